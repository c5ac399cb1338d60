// In-memory stores. Readers load an `ArcSwap` snapshot without locking;
// writers serialize on a mutex so read-modify-write stays atomic.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use super::{CertRepository, NetConfigStore};
use crate::error::CoreError;
use crate::model::{CertPool, NetConfig};

#[derive(Debug)]
pub struct MemoryNetConfigStore {
    current: ArcSwap<NetConfig>,
    write: Mutex<()>,
}

impl MemoryNetConfigStore {
    pub fn new(initial: NetConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            write: Mutex::new(()),
        }
    }
}

impl Default for MemoryNetConfigStore {
    fn default() -> Self {
        Self::new(NetConfig::web_defaults())
    }
}

impl NetConfigStore for MemoryNetConfigStore {
    fn load(&self) -> Result<NetConfig, CoreError> {
        Ok(NetConfig::clone(&self.current.load()))
    }

    fn modify(&self, f: &mut dyn FnMut(&mut NetConfig)) -> Result<NetConfig, CoreError> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = NetConfig::clone(&self.current.load());
        f(&mut next);
        self.current.store(Arc::new(next.clone()));
        Ok(next)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCertRepository {
    pool: ArcSwap<CertPool>,
    write: Mutex<()>,
}

impl MemoryCertRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertRepository for MemoryCertRepository {
    fn snapshot(&self) -> Result<CertPool, CoreError> {
        Ok(CertPool::clone(&self.pool.load()))
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut CertPool) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = CertPool::clone(&self.pool.load());
        f(&mut next)?;
        self.pool.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::tests::{entry, exercise_cert_repository, exercise_net_store};

    #[test]
    fn net_store_contract() {
        exercise_net_store(&MemoryNetConfigStore::default());
    }

    #[test]
    fn cert_repository_contract() {
        exercise_cert_repository(&MemoryCertRepository::new());
    }

    #[test]
    fn failed_transaction_leaves_pool_untouched() {
        let repo = MemoryCertRepository::new();
        repo.upsert_cert(entry("a")).unwrap();
        let err = repo.transaction(&mut |pool| {
            pool.certs.clear();
            Err(CoreError::Internal("boom".into()))
        });
        assert!(err.is_err());
        assert_eq!(repo.all_including_expired().unwrap().len(), 1);
    }
}
