//! Postgres adapters: transaction backend, durable task broker and the
//! processor store ports.
//!
//! Every statement goes through [`execute`] / [`fetch_all`] /
//! [`fetch_optional`], which run on the ambient transaction when the caller
//! is inside [`TransactionManager::with_transaction`](crate::tx::TransactionManager::with_transaction)
//! and on the pool otherwise.

mod broker;
mod store;

use std::ops::DerefMut;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::sync::MappedMutexGuard;

use crate::tx::{BoxError, DbHandle, TxBackend, TxError, transaction_or_default};

pub use broker::PgTaskBroker;
pub use store::PgStore;

pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

/// Migrations owned by this crate (the `job_tasks` table).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// [`TxBackend`] over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgTxBackend {
    pool: PgPool,
}

impl PgTxBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TxBackend for PgTxBackend {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, BoxError> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: PgTransaction) -> Result<(), BoxError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: PgTransaction) -> Result<(), BoxError> {
        Ok(tx.rollback().await?)
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Type-erased transaction guard.
///
/// `MappedMutexGuard`'s `Send` impl carries a `T: 'a` bound which rustc
/// cannot prove for `Transaction<'static, _>` once the guard is held across
/// an `.await` (regions are erased in coroutine witnesses). Boxing it as a
/// `dyn ... + Send` object keeps callers' futures provably `Send`.
type TxGuard<'g> = Box<dyn DerefMut<Target = PgTransaction> + Send + 'g>;

fn erase_guard<'g>(guard: MappedMutexGuard<'g, PgTransaction>) -> TxGuard<'g> {
    Box::new(guard)
}

async fn execute<E>(pool: &PgPool, query: PgQuery<'_>) -> Result<PgQueryResult, E>
where
    E: From<sqlx::Error> + From<TxError>,
{
    match transaction_or_default::<PgTransaction, _>(pool) {
        DbHandle::Transaction(tx) => {
            let mut conn = erase_guard(tx.lock().await?);
            Ok(query.execute(&mut ***conn).await?)
        }
        DbHandle::Default(pool) => Ok(query.execute(pool).await?),
    }
}

async fn fetch_all<E>(pool: &PgPool, query: PgQuery<'_>) -> Result<Vec<PgRow>, E>
where
    E: From<sqlx::Error> + From<TxError>,
{
    match transaction_or_default::<PgTransaction, _>(pool) {
        DbHandle::Transaction(tx) => {
            let mut conn = erase_guard(tx.lock().await?);
            Ok(query.fetch_all(&mut ***conn).await?)
        }
        DbHandle::Default(pool) => Ok(query.fetch_all(pool).await?),
    }
}

async fn fetch_optional<E>(pool: &PgPool, query: PgQuery<'_>) -> Result<Option<PgRow>, E>
where
    E: From<sqlx::Error> + From<TxError>,
{
    match transaction_or_default::<PgTransaction, _>(pool) {
        DbHandle::Transaction(tx) => {
            let mut conn = erase_guard(tx.lock().await?);
            Ok(query.fetch_optional(&mut ***conn).await?)
        }
        DbHandle::Default(pool) => Ok(query.fetch_optional(pool).await?),
    }
}

/// Milliseconds as stored in `BIGINT` columns, saturating.
fn millis(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
