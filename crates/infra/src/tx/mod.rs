//! Transaction boundary manager.
//!
//! ## Design
//!
//! - A unit of work runs inside [`TransactionManager::with_transaction`]
//! - The open transaction is stored as the *ambient* transaction of the
//!   current tokio task (task-local), so nested units of work find and reuse
//!   it instead of opening a second top-level transaction
//! - Exactly one of commit / rollback happens for every transaction that was
//!   opened; panics roll back and re-raise
//! - Repositories call [`transaction_or_default`] to run their statements on
//!   the ambient transaction when one is active, or on the pool otherwise
//!
//! The ambient transaction is scoped to one task chain. `tokio::spawn`ed
//! tasks start without one, which keeps concurrent task executions in
//! separate transaction scopes.

pub mod manager;
pub mod memory;

pub use manager::{
    BoxError, DbHandle, TransactionManager, TxBackend, TxError, TxHandle, UnitOfWork,
    current_transaction, in_transaction, transaction_or_default,
};
pub use memory::{MemoryKv, MemoryTx, MemoryTxBackend, TxCounters};
