//! Membership registry: the immutable sponsorship tree.
//!
//! Members live in an arena indexed by their sequential id, so sponsor links
//! are plain indices. Root always sits at index [`ROOT_ID`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MatrixError, Result};

pub type MemberId = u64;
pub type Address = String;
pub type Level = u8;

pub const ROOT_ID: MemberId = 0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub address: Address,
    /// `None` only for Root.
    pub sponsor: Option<MemberId>,
    pub highest_level: Level,
}

impl Member {
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipRegistry {
    members: Vec<Member>,
    by_address: BTreeMap<Address, MemberId>,
}

impl MembershipRegistry {
    /// Create a registry holding only Root, which owns every level for life.
    pub fn new(root_address: &str, max_level: Level) -> Result<Self> {
        let root_address = root_address.trim();
        if root_address.is_empty() {
            return Err(MatrixError::InvalidRoot);
        }
        let root = Member {
            id: ROOT_ID,
            address: root_address.to_string(),
            sponsor: None,
            highest_level: max_level,
        };
        let mut by_address = BTreeMap::new();
        by_address.insert(root.address.clone(), ROOT_ID);
        Ok(Self {
            members: vec![root],
            by_address,
        })
    }

    /// Number of records, Root included.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn root(&self) -> &Member {
        &self.members[ROOT_ID as usize]
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        usize::try_from(id).ok().and_then(|idx| self.members.get(idx))
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.get(id).is_some()
    }

    pub fn id_of(&self, address: &str) -> Option<MemberId> {
        self.by_address.get(address).copied()
    }

    pub fn by_address(&self, address: &str) -> Result<&Member> {
        self.id_of(address)
            .and_then(|id| self.get(id))
            .ok_or_else(|| MatrixError::NotRegistered(address.to_string()))
    }

    pub fn sponsor_of(&self, id: MemberId) -> Option<MemberId> {
        self.get(id).and_then(|m| m.sponsor)
    }

    /// Id the next registration will receive.
    pub fn next_id(&self) -> MemberId {
        self.members.len() as MemberId
    }

    /// Validate that `address` could be registered under `sponsor` without
    /// touching the registry.
    pub fn check_registration(&self, address: &str, sponsor: MemberId) -> Result<()> {
        if !self.contains(sponsor) {
            return Err(MatrixError::UnknownSponsor(sponsor));
        }
        if address.trim().is_empty() {
            return Err(MatrixError::InvalidAddress(address.to_string()));
        }
        if self.by_address.contains_key(address) {
            return Err(MatrixError::AlreadyRegistered(address.to_string()));
        }
        Ok(())
    }

    /// Append a member at level 1 under `sponsor`.
    pub fn register(&mut self, address: &str, sponsor: MemberId) -> Result<MemberId> {
        self.check_registration(address, sponsor)?;
        let id = self.next_id();
        self.members.push(Member {
            id,
            address: address.to_string(),
            sponsor: Some(sponsor),
            highest_level: 1,
        });
        self.by_address.insert(address.to_string(), id);
        Ok(id)
    }

    /// Raise a member's ceiling. The ceiling never decreases and Root is fixed.
    pub(crate) fn raise_ceiling(&mut self, id: MemberId, level: Level) {
        if id == ROOT_ID {
            return;
        }
        if let Some(member) = usize::try_from(id)
            .ok()
            .and_then(|idx| self.members.get_mut(idx))
        {
            member.highest_level = member.highest_level.max(level);
        }
    }

    /// Sponsor chain of `id`, nearest first, ending with Root.
    pub fn ancestors(&self, id: MemberId) -> Ancestors<'_> {
        Ancestors {
            registry: self,
            next: self.sponsor_of(id),
        }
    }

    /// Sponsor hops from `id` to Root; Root itself has depth 0.
    pub fn depth(&self, id: MemberId) -> usize {
        self.ancestors(id).count()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Verify the arena invariants of a registry that did not come from
    /// [`MembershipRegistry::new`]: Root at index 0 owning `level_count`
    /// levels, sequential ids, sponsors strictly older than their sponsees
    /// and an address index that matches the records.
    pub fn check_tree(&self, level_count: Level) -> Result<()> {
        let corrupt = |what: String| Err(MatrixError::CorruptState(what));
        let Some(root) = self.members.first() else {
            return corrupt("registry has no root".into());
        };
        if root.id != ROOT_ID || root.sponsor.is_some() || root.address.trim().is_empty() {
            return corrupt("malformed root record".into());
        }
        if root.highest_level != level_count {
            return corrupt(format!(
                "root owns {} levels, config has {level_count}",
                root.highest_level
            ));
        }
        for (idx, member) in self.members.iter().enumerate().skip(1) {
            if member.id != idx as MemberId {
                return corrupt(format!("member at index {idx} has id {}", member.id));
            }
            match member.sponsor {
                Some(sponsor) if sponsor < member.id => {}
                _ => return corrupt(format!("member {} has no older sponsor", member.id)),
            }
            if member.highest_level == 0 || member.highest_level > level_count {
                return corrupt(format!(
                    "member {} owns level {}",
                    member.id, member.highest_level
                ));
            }
        }
        if self.by_address.len() != self.members.len()
            || self
                .members
                .iter()
                .any(|m| self.by_address.get(&m.address) != Some(&m.id))
        {
            return corrupt("address index out of sync".into());
        }
        Ok(())
    }
}

pub struct Ancestors<'a> {
    registry: &'a MembershipRegistry,
    next: Option<MemberId>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Member;

    fn next(&mut self) -> Option<Self::Item> {
        let member = self.registry.get(self.next?)?;
        self.next = member.sponsor;
        Some(member)
    }
}
