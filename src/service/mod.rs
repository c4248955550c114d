use parking_lot::Mutex;

use crate::engine::{Payout, PlacementEngine};
use crate::error::Result;
use crate::registry::{Level, MemberId};
use crate::treasury::{Amount, Treasury};

/// Shared handle that serializes every operation behind one lock, so each
/// join or purchase sees and leaves a consistent matrix.
pub struct MatrixService<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    engine: PlacementEngine,
    treasury: T,
}

impl<T: Treasury> MatrixService<T> {
    pub fn new(engine: PlacementEngine, treasury: T) -> Self {
        Self {
            inner: Mutex::new(Inner { engine, treasury }),
        }
    }

    pub fn join(
        &self,
        address: &str,
        sponsor: Option<MemberId>,
        payment: Amount,
    ) -> Result<Payout> {
        let mut guard = self.inner.lock();
        let Inner { engine, treasury } = &mut *guard;
        engine.join(address, sponsor, payment, treasury)
    }

    pub fn purchase_level(&self, address: &str, level: Level, payment: Amount) -> Result<Payout> {
        let mut guard = self.inner.lock();
        let Inner { engine, treasury } = &mut *guard;
        engine.purchase_level(address, level, payment, treasury)
    }

    /// Run a read-only query under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&PlacementEngine, &T) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard.engine, &guard.treasury)
    }

    pub fn into_parts(self) -> (PlacementEngine, T) {
        let inner = self.inner.into_inner();
        (inner.engine, inner.treasury)
    }
}
