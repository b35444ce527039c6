//! Services is a core layer for the app business logic like
//! coupon validation, issuance and keeping the stock mirror in sync.

pub mod coupons;
pub mod stock_sync;
pub mod types;

pub use self::coupons::*;
pub use self::stock_sync::*;
pub use self::types::*;

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::{Error as FailureError, Fail};
use futures_cpupool::CpuPool;
use r2d2::{ManageConnection, Pool, PooledConnection};

use context::StaticContext;
use errors::Error;
use repos::ReposFactory;

/// Service
pub struct Service<
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
> {
    pub static_context: StaticContext<T, M, F>,
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > Service<T, M, F>
{
    /// Create a new service
    pub fn new(static_context: StaticContext<T, M, F>) -> Self {
        Self { static_context }
    }

    /// Runs `f` with a pooled db connection on the cpu pool
    pub fn spawn_on_pool<R, Func>(&self, f: Func) -> ServiceFuture<R>
    where
        Func: FnOnce(PooledConnection<M>) -> Result<R, FailureError> + Send + 'static,
        R: Send + 'static,
    {
        self.spawn_with_db_pool(move |db_pool| get_connection(&db_pool).and_then(f))
    }

    /// Runs `f` on the cpu pool, `f` checks db connections out itself.
    /// For work that blocks on something else while it does not need the db.
    pub fn spawn_with_db_pool<R, Func>(&self, f: Func) -> ServiceFuture<R>
    where
        Func: FnOnce(Pool<M>) -> Result<R, FailureError> + Send + 'static,
        R: Send + 'static,
    {
        let db_pool = self.static_context.db_pool.clone();
        let cpu_pool: &CpuPool = &self.static_context.cpu_pool;
        Box::new(cpu_pool.spawn_fn(move || f(db_pool)))
    }
}

/// Checks out a db connection
pub fn get_connection<M: ManageConnection>(db_pool: &Pool<M>) -> Result<PooledConnection<M>, FailureError> {
    db_pool
        .get()
        .map_err(|e| -> FailureError { e.context(Error::Connection).into() })
}
