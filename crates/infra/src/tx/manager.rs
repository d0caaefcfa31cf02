//! Ambient transaction handling on top of a pluggable [`TxBackend`].

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error};

/// Boxed error produced by a transaction backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the transaction lifecycle itself.
///
/// Errors returned by the unit of work are never converted into this type;
/// they reach the caller untouched.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] BoxError),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] BoxError),

    /// The unit of work failed and the rollback failed too.
    #[error("rollback failed after unit of work error ({original}): {rollback}")]
    Rollback {
        original: String,
        #[source]
        rollback: BoxError,
    },

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Finished,

    /// The ambient transaction was opened by a different backend type.
    #[error("ambient transaction belongs to a different backend")]
    ForeignTransaction,
}

/// Storage that can open, commit and roll back transactions.
#[async_trait]
pub trait TxBackend: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, BoxError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), BoxError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), BoxError>;
}

#[async_trait]
impl<B: TxBackend> TxBackend for Arc<B> {
    type Tx = B::Tx;

    async fn begin(&self) -> Result<Self::Tx, BoxError> {
        (**self).begin().await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), BoxError> {
        (**self).commit(tx).await
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), BoxError> {
        (**self).rollback(tx).await
    }
}

type Slot<T> = Mutex<Option<T>>;

/// Opaque ambient value; the concrete type is `Slot<B::Tx>`.
#[derive(Clone)]
struct AmbientTransaction {
    slot: Arc<dyn Any + Send + Sync>,
}

tokio::task_local! {
    static AMBIENT: AmbientTransaction;
}

fn ambient() -> Option<AmbientTransaction> {
    AMBIENT.try_with(Clone::clone).ok()
}

/// Shared handle to an open transaction.
pub struct TxHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for TxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TxHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("slot", &Arc::as_ptr(&self.slot))
            .finish()
    }
}

impl<T: Send + 'static> TxHandle<T> {
    /// Exclusive access to the transaction for the next statement(s).
    ///
    /// Statements issued through the returned guard execute in call order.
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, T>, TxError> {
        let guard = self.slot.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| TxError::Finished)
    }

    /// Whether both handles refer to the same transaction.
    pub fn same_as(&self, other: &TxHandle<T>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

/// Either the ambient transaction or a caller-provided fallback (usually the
/// connection pool).
#[derive(Debug)]
pub enum DbHandle<T, D> {
    Transaction(TxHandle<T>),
    Default(D),
}

/// The ambient transaction of type `T`, if the current task runs inside one.
pub fn current_transaction<T: Send + 'static>() -> Option<TxHandle<T>> {
    let slot = ambient()?.slot.downcast::<Slot<T>>().ok()?;
    Some(TxHandle { slot })
}

/// Ambient transaction if present, else `fallback`.
pub fn transaction_or_default<T: Send + 'static, D>(fallback: D) -> DbHandle<T, D> {
    match current_transaction::<T>() {
        Some(tx) => DbHandle::Transaction(tx),
        None => DbHandle::Default(fallback),
    }
}

/// Whether the current task runs inside any ambient transaction.
pub fn in_transaction() -> bool {
    ambient().is_some()
}

/// Runs units of work inside (possibly shared) transactions.
#[derive(Debug, Clone)]
pub struct TransactionManager<B> {
    backend: B,
}

impl<B: TxBackend> TransactionManager<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `work` inside a transaction.
    ///
    /// - Inside an existing ambient transaction `work` runs directly and the
    ///   outer call stays responsible for commit / rollback.
    /// - Otherwise a transaction is opened and made ambient for `work`:
    ///   `Ok` commits (a commit failure is returned), `Err(e)` rolls back and
    ///   returns `e` unchanged, a panic rolls back and resumes unwinding.
    ///
    /// A rollback that fails after `work` failed is reported as
    /// [`TxError::Rollback`] so it cannot be mistaken for `work`'s own error.
    pub async fn with_transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError> + Display,
    {
        if let Some(existing) = ambient() {
            if !existing.slot.is::<Slot<B::Tx>>() {
                return Err(TxError::ForeignTransaction.into());
            }
            debug!("reusing ambient transaction");
            return work().await;
        }

        let tx = self.backend.begin().await.map_err(TxError::Begin)?;
        let slot: Arc<Slot<B::Tx>> = Arc::new(Mutex::new(Some(tx)));
        let ambient = AmbientTransaction { slot: slot.clone() };

        let outcome = AMBIENT
            .scope(ambient, AssertUnwindSafe(async move { work().await }).catch_unwind())
            .await;

        let tx = slot.lock().await.take();

        match outcome {
            Ok(Ok(value)) => {
                let tx = tx.ok_or(TxError::Finished)?;
                self.backend.commit(tx).await.map_err(TxError::Commit)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Some(tx) = tx {
                    if let Err(rollback) = self.backend.rollback(tx).await {
                        return Err(TxError::Rollback {
                            original: err.to_string(),
                            rollback,
                        }
                        .into());
                    }
                }
                Err(err)
            }
            Err(panic) => {
                if let Some(tx) = tx {
                    if let Err(rollback) = self.backend.rollback(tx).await {
                        error!(error = %rollback, "rollback after panic failed");
                    }
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

/// Object-safe view of a [`TransactionManager`] for callers that hold it as
/// `Arc<dyn UnitOfWork<E>>`.
#[async_trait]
pub trait UnitOfWork<E>: Send + Sync {
    /// Run `work` atomically, with the semantics of
    /// [`TransactionManager::with_transaction`].
    async fn atomically(&self, work: BoxFuture<'_, Result<(), E>>) -> Result<(), E>;
}

#[async_trait]
impl<B, E> UnitOfWork<E> for TransactionManager<B>
where
    B: TxBackend,
    E: From<TxError> + Display + Send + 'static,
{
    async fn atomically(&self, work: BoxFuture<'_, Result<(), E>>) -> Result<(), E> {
        self.with_transaction(|| work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::memory::{MemoryKv, MemoryTx, MemoryTxBackend};

    #[derive(Debug, PartialEq)]
    enum AppError {
        ItemNotFound,
        Tx(String),
    }

    impl Display for AppError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                AppError::ItemNotFound => write!(f, "item not found"),
                AppError::Tx(msg) => write!(f, "{msg}"),
            }
        }
    }

    impl From<TxError> for AppError {
        fn from(value: TxError) -> Self {
            AppError::Tx(value.to_string())
        }
    }

    fn setup() -> (TransactionManager<MemoryTxBackend>, MemoryKv) {
        let backend = MemoryTxBackend::new();
        let kv = MemoryKv::new(backend.clone());
        (TransactionManager::new(backend), kv)
    }

    #[tokio::test]
    async fn nested_calls_reuse_the_outer_transaction() {
        let (manager, _) = setup();

        let (outer, inner) = manager
            .with_transaction(|| async {
                let outer = current_transaction::<MemoryTx>().expect("outer tx");
                let inner = manager
                    .with_transaction(|| async {
                        Ok::<_, AppError>(current_transaction::<MemoryTx>().expect("inner tx"))
                    })
                    .await?;
                Ok::<_, AppError>((outer, inner))
            })
            .await
            .unwrap();

        assert!(outer.same_as(&inner));
        let counters = manager.backend().counters();
        assert_eq!(counters.begins(), 1);
        assert_eq!(counters.commits(), 1);
        assert_eq!(counters.rollbacks(), 0);
    }

    #[tokio::test]
    async fn success_commits_writes() {
        let (manager, kv) = setup();

        manager
            .with_transaction(|| async {
                kv.put("item:1", "drill").await?;
                kv.put("item:2", "ladder").await?;
                Ok::<_, AppError>(())
            })
            .await
            .unwrap();

        assert_eq!(kv.get("item:1").await.unwrap().as_deref(), Some("drill"));
        assert_eq!(kv.get("item:2").await.unwrap().as_deref(), Some("ladder"));
    }

    #[tokio::test]
    async fn error_rolls_back_and_is_returned_unchanged() {
        let (manager, kv) = setup();

        let result: Result<(), AppError> = manager
            .with_transaction(|| async {
                kv.put("item:1", "drill").await?;
                Err(AppError::ItemNotFound)
            })
            .await;

        assert_eq!(result, Err(AppError::ItemNotFound));
        assert_eq!(kv.get("item:1").await.unwrap(), None);
        let counters = manager.backend().counters();
        assert_eq!(counters.commits(), 0);
        assert_eq!(counters.rollbacks(), 1);
    }

    #[tokio::test]
    async fn nested_error_rolls_back_outer_writes_too() {
        let (manager, kv) = setup();

        let result: Result<(), AppError> = manager
            .with_transaction(|| async {
                kv.put("loan:1", "open").await?;
                manager
                    .with_transaction(|| async {
                        kv.put("loan:2", "open").await?;
                        Err::<(), _>(AppError::ItemNotFound)
                    })
                    .await
            })
            .await;

        assert_eq!(result, Err(AppError::ItemNotFound));
        assert_eq!(kv.get("loan:1").await.unwrap(), None);
        assert_eq!(kv.get("loan:2").await.unwrap(), None);
        assert_eq!(manager.backend().counters().rollbacks(), 1);
    }

    #[tokio::test]
    async fn panic_rolls_back_and_propagates() {
        let (manager, kv) = setup();
        let backend = manager.backend().clone();
        let kv_inner = kv.clone();

        let joined = tokio::spawn(async move {
            manager
                .with_transaction(|| async {
                    kv_inner.put("item:1", "drill").await?;
                    if kv_inner.get("item:1").await?.is_some() {
                        panic!("boom");
                    }
                    Ok::<_, AppError>(())
                })
                .await
        })
        .await;

        let err = joined.expect_err("panic must propagate");
        assert!(err.is_panic());
        assert_eq!(backend.counters().rollbacks(), 1);
        assert_eq!(backend.counters().commits(), 0);
        assert_eq!(kv.get("item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn commit_failure_is_reported() {
        let (manager, kv) = setup();
        manager.backend().fail_commit(true);

        let result = manager
            .with_transaction(|| async {
                kv.put("item:1", "drill").await?;
                Ok::<_, AppError>(())
            })
            .await;

        assert!(matches!(result, Err(AppError::Tx(ref msg)) if msg.contains("commit")));
        assert_eq!(kv.get("item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rollback_failure_is_distinct_from_the_original_error() {
        let (manager, _) = setup();
        manager.backend().fail_rollback(true);

        let result: Result<(), AppError> = manager
            .with_transaction(|| async { Err(AppError::ItemNotFound) })
            .await;

        match result {
            Err(AppError::Tx(msg)) => {
                assert!(msg.contains("rollback failed"));
                assert!(msg.contains("item not found"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn begin_failure_skips_the_unit_of_work() {
        let (manager, _) = setup();
        manager.backend().fail_begin(true);
        let ran = std::sync::atomic::AtomicBool::new(false);

        let result = manager
            .with_transaction(|| async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await;

        assert!(matches!(result, Err(AppError::Tx(ref msg)) if msg.contains("begin")));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawned_tasks_do_not_inherit_the_transaction() {
        let (manager, _) = setup();

        let (inside, spawned) = manager
            .with_transaction(|| async {
                let spawned = tokio::spawn(async { in_transaction() }).await.unwrap();
                Ok::<_, AppError>((in_transaction(), spawned))
            })
            .await
            .unwrap();

        assert!(inside);
        assert!(!spawned);
        assert!(!in_transaction());
    }

    #[tokio::test]
    async fn fallback_is_used_outside_a_transaction() {
        match transaction_or_default::<MemoryTx, _>("pool") {
            DbHandle::Default(pool) => assert_eq!(pool, "pool"),
            DbHandle::Transaction(_) => panic!("no transaction expected"),
        }
    }
}
