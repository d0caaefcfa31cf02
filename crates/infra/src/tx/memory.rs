//! In-memory transactional key/value backend for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::manager::{BoxError, DbHandle, TxBackend, TxError, transaction_or_default};

/// Lifecycle counters, for asserting commit/rollback exclusivity.
#[derive(Debug, Default)]
pub struct TxCounters {
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl TxCounters {
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: Mutex<BTreeMap<String, String>>,
    counters: TxCounters,
    next_id: AtomicU64,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

/// Staged writes of one open transaction (`None` = delete).
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    writes: BTreeMap<String, Option<String>>,
}

impl MemoryTx {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Transactional backend over a shared `BTreeMap`.
///
/// Writes made inside a transaction are invisible to readers outside it until
/// commit. Failure switches let tests exercise every lifecycle error path.
#[derive(Debug, Clone, Default)]
pub struct MemoryTxBackend {
    inner: Arc<Inner>,
}

impl MemoryTxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &TxCounters {
        &self.inner.counters
    }

    pub fn fail_begin(&self, fail: bool) {
        self.inner.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.inner.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.inner.fail_rollback.store(fail, Ordering::SeqCst);
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.data.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl TxBackend for MemoryTxBackend {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, BoxError> {
        if self.inner.fail_begin.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        self.inner.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTx {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            writes: BTreeMap::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), BoxError> {
        if self.inner.fail_commit.load(Ordering::SeqCst) {
            return Err("serialization failure".into());
        }
        let mut data = self.data();
        for (key, value) in tx.writes {
            match value {
                Some(v) => data.insert(key, v),
                None => data.remove(&key),
            };
        }
        self.inner.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _tx: MemoryTx) -> Result<(), BoxError> {
        if self.inner.fail_rollback.load(Ordering::SeqCst) {
            return Err("connection reset".into());
        }
        self.inner.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Tiny repository over [`MemoryTxBackend`] that joins the ambient
/// transaction when there is one.
#[derive(Debug, Clone)]
pub struct MemoryKv {
    backend: MemoryTxBackend,
}

impl MemoryKv {
    pub fn new(backend: MemoryTxBackend) -> Self {
        Self { backend }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<(), TxError> {
        self.write(key, Some(value.to_string())).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), TxError> {
        self.write(key, None).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, TxError> {
        match transaction_or_default::<MemoryTx, _>(&self.backend) {
            DbHandle::Transaction(tx) => {
                let tx = tx.lock().await?;
                if let Some(staged) = tx.writes.get(key) {
                    return Ok(staged.clone());
                }
                Ok(self.backend.data().get(key).cloned())
            }
            DbHandle::Default(backend) => Ok(backend.data().get(key).cloned()),
        }
    }

    async fn write(&self, key: &str, value: Option<String>) -> Result<(), TxError> {
        match transaction_or_default::<MemoryTx, _>(&self.backend) {
            DbHandle::Transaction(tx) => {
                tx.lock().await?.writes.insert(key.to_string(), value);
            }
            DbHandle::Default(backend) => {
                let mut data = backend.data();
                match value {
                    Some(v) => data.insert(key.to_string(), v),
                    None => data.remove(key),
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::TransactionManager;

    #[tokio::test]
    async fn writes_outside_a_transaction_are_immediate() {
        let kv = MemoryKv::new(MemoryTxBackend::new());

        kv.put("a", "1").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));

        kv.delete("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn staged_writes_are_visible_only_inside() {
        let backend = MemoryTxBackend::new();
        let kv = MemoryKv::new(backend.clone());
        let manager = TransactionManager::new(backend);
        let observer = kv.clone();

        manager
            .with_transaction(|| async {
                kv.put("a", "1").await?;
                assert_eq!(kv.get("a").await?.as_deref(), Some("1"));

                let outside = tokio::spawn(async move { observer.get("a").await })
                    .await
                    .expect("join");
                assert_eq!(outside?, None);
                Ok::<_, TxError>(())
            })
            .await
            .unwrap();

        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
    }
}
