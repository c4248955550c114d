use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::PlacementEngine;
use crate::ledger::LevelView;
use crate::treasury::BalanceSheet;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state file carries an invalid matrix: {0}")]
    Invalid(#[from] crate::error::MatrixError),
}

/// Everything the CLI persists between invocations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub engine: PlacementEngine,
    pub balances: BalanceSheet,
}

impl Snapshot {
    pub fn new(engine: PlacementEngine) -> Self {
        Self {
            engine,
            balances: BalanceSheet::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        snapshot.engine.check_consistency()?;
        Ok(snapshot)
    }

    /// Write through a sibling temp file so a crash never leaves a torn state.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Deterministic commitment over members, level states and balances.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        let registry = self.engine.registry();
        for member in registry.members() {
            let mut hasher = Sha256::new();
            hasher.update(b"member");
            hasher.update(member.id.to_le_bytes());
            hasher.update(member.address.as_bytes());
            hasher.update(member.sponsor.unwrap_or(u64::MAX).to_le_bytes());
            hasher.update([member.highest_level]);
            leaves.push(hasher.finalize().into());
        }
        let levels = self.engine.levels();
        for (member, level, state) in levels.entries() {
            let mut hasher = Sha256::new();
            hasher.update(b"level");
            hasher.update(member.to_le_bytes());
            hasher.update([level]);
            hasher.update(state.tier1.to_le_bytes());
            hasher.update(state.tier2.to_le_bytes());
            hasher.update(state.cycles.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (account, balance) in self.balances.accounts() {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update(account.as_bytes());
            hasher.update(balance.credited.to_le_bytes());
            hasher.update(balance.payouts.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        let mut hasher = Sha256::new();
        hasher.update(b"root");
        hasher.update(self.engine.height().to_le_bytes());
        hasher.update(levels.width().to_le_bytes());
        hasher.update(build_merkle(leaves));
        hasher.finalize().into()
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"matrix-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::MatrixConfig;
    use crate::registry::ROOT_ID;

    fn populated() -> Snapshot {
        let engine = PlacementEngine::new(MatrixConfig::default(), "root").unwrap();
        let mut snapshot = Snapshot::new(engine);
        let price = snapshot.engine.level_price(1).unwrap();
        for (address, sponsor) in [("alice", ROOT_ID), ("bob", 1), ("carol", 2)] {
            snapshot
                .engine
                .join(address, Some(sponsor), price, &mut snapshot.balances)
                .unwrap();
        }
        snapshot
    }

    #[test]
    fn state_root_is_deterministic_and_tracks_changes() {
        let mut snapshot = populated();
        let root1 = snapshot.state_root();
        assert_eq!(root1, snapshot.clone().state_root());

        let price = snapshot.engine.level_price(1).unwrap();
        snapshot
            .engine
            .join("dave", Some(3), price, &mut snapshot.balances)
            .unwrap();
        assert_ne!(root1, snapshot.state_root());
    }

    #[test]
    fn save_then_load_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let snapshot = populated();
        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.state_root(), snapshot.state_root());
        assert_eq!(loaded.engine.resolve_recipient("carol", 1).unwrap(), "bob");
    }

    fn tampered(edit: impl FnOnce(&mut serde_json::Value)) -> Result<Snapshot, StoreError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut value = serde_json::to_value(populated()).unwrap();
        edit(&mut value);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        Snapshot::load(&path)
    }

    #[test]
    fn load_rejects_inconsistent_matrices() {
        assert!(tampered(|_| {}).is_ok());
        let edits: [fn(&mut serde_json::Value); 5] = [
            |v| v["engine"]["levels"]["width"] = serde_json::json!(2),
            |v| v["engine"]["registry"]["members"] = serde_json::json!([]),
            |v| v["engine"]["registry"]["members"][0]["highest_level"] = serde_json::json!(1),
            |v| v["engine"]["registry"]["members"][2]["sponsor"] = serde_json::json!(3),
            |v| v["engine"]["prices"] = serde_json::json!([1, 2, 3, 4]),
        ];
        for edit in edits {
            assert!(matches!(tampered(edit), Err(StoreError::Invalid(_))));
        }
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(Snapshot::load(&path), Err(StoreError::Json(_))));
        assert!(matches!(
            Snapshot::load(&dir.path().join("missing.json")),
            Err(StoreError::Io(_))
        ));
    }
}
