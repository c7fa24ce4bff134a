use std::ops::{Deref, DerefMut};

use nimbus_core::CcError;
use tokio::sync::{Mutex, MutexGuard};

/// The named coarse locks of the controller, in acquisition order.
///
/// Any section holding more than one lock must acquire them in strictly
/// increasing rank; `OrderedMutex::lock_after` enforces this. NcCall ranks
/// below the cache locks because fan-out sections hold it across the whole
/// NC critical section while cache locks are taken and released inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockId {
    Init,
    Config,
    NcCall,
    InstCache,
    ResCache,
    Vnet,
}

impl LockId {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Config => 1,
            Self::NcCall => 2,
            Self::InstCache => 3,
            Self::ResCache => 4,
            Self::Vnet => 5,
        }
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Config => "CONFIG",
            Self::NcCall => "NCCALL",
            Self::InstCache => "INSTCACHE",
            Self::ResCache => "RESCACHE",
            Self::Vnet => "VNET",
        };
        write!(f, "{}", name)
    }
}

/// A named mutex that participates in the fixed acquisition order.
///
/// Guards are plain RAII: a worker that unwinds releases everything it
/// holds, so the release-all-on-fatal-exit contract needs no bookkeeping.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    id: LockId,
    inner: Mutex<T>,
}

#[derive(Debug)]
pub struct OrderedGuard<'a, T> {
    id: LockId,
    guard: MutexGuard<'a, T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(id: LockId, value: T) -> Self {
        Self {
            id,
            inner: Mutex::new(value),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquire as the first (or only) lock of a section.
    pub async fn lock(&self) -> OrderedGuard<'_, T> {
        OrderedGuard {
            id: self.id,
            guard: self.inner.lock().await,
        }
    }

    /// Acquire while `held` is already held. Fails without blocking when the
    /// requested lock does not rank strictly above the held one.
    pub async fn lock_after<'a, U>(
        &'a self,
        held: &OrderedGuard<'_, U>,
    ) -> Result<OrderedGuard<'a, T>, CcError> {
        if self.id.rank() <= held.id().rank() {
            return Err(CcError::LockOrder {
                held: held.id().to_string(),
                requested: self.id.to_string(),
            });
        }
        Ok(self.lock().await)
    }

    /// Non-blocking acquire; used by tests to assert a lock is not held.
    pub fn try_lock(&self) -> Option<OrderedGuard<'_, T>> {
        self.inner.try_lock().ok().map(|guard| OrderedGuard {
            id: self.id,
            guard,
        })
    }
}

impl<T> OrderedGuard<'_, T> {
    pub fn id(&self) -> LockId {
        self.id
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_is_total_order() {
        let order = [
            LockId::Init,
            LockId::Config,
            LockId::NcCall,
            LockId::InstCache,
            LockId::ResCache,
            LockId::Vnet,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() < pair[1].rank(), "{} < {}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_lock_after_ascending_succeeds() {
        let config = OrderedMutex::new(LockId::Config, 0u32);
        let rescache = OrderedMutex::new(LockId::ResCache, 0u32);

        let g1 = config.lock().await;
        let g2 = rescache.lock_after(&g1).await.unwrap();
        assert_eq!(g2.id(), LockId::ResCache);
    }

    #[tokio::test]
    async fn test_lock_after_descending_is_rejected() {
        let config = OrderedMutex::new(LockId::Config, 0u32);
        let vnet = OrderedMutex::new(LockId::Vnet, 0u32);

        let g1 = vnet.lock().await;
        let err = config.lock_after(&g1).await.unwrap_err();
        match err {
            CcError::LockOrder { held, requested } => {
                assert_eq!(held, "VNET");
                assert_eq!(requested, "CONFIG");
            }
            other => panic!("expected LockOrder, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_after_same_lock_is_rejected() {
        let nc = OrderedMutex::new(LockId::NcCall, ());
        let g = nc.lock().await;
        assert!(nc.lock_after(&g).await.is_err());
    }

    #[tokio::test]
    async fn test_guard_release_on_drop() {
        let m = OrderedMutex::new(LockId::InstCache, 7u32);
        {
            let mut g = m.lock().await;
            *g = 8;
            assert!(m.try_lock().is_none());
        }
        let g = m.try_lock().expect("released after drop");
        assert_eq!(*g, 8);
    }
}
