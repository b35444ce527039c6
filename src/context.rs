//! `StaticContext` is a top level dependency injection container of long
//! lived resources shared by every service call.
use std::sync::Arc;

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use futures_cpupool::CpuPool;
use r2d2::{ManageConnection, Pool};

use config::Config;
use locks::LockService;
use repos::{CouponStockStore, ReposFactory};
use services::coupons::CouponIssuance;
use services::stock_sync::StockSynchronizer;

pub struct StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub db_pool: Pool<M>,
    pub cpu_pool: CpuPool,
    pub config: Arc<Config>,
    pub repo_factory: F,
    pub stock_store: Arc<CouponStockStore>,
    pub lock_service: Arc<LockService>,
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > StaticContext<T, M, F>
{
    pub fn new(
        db_pool: Pool<M>,
        cpu_pool: CpuPool,
        config: Arc<Config>,
        repo_factory: F,
        stock_store: Arc<CouponStockStore>,
        lock_service: Arc<LockService>,
    ) -> Self {
        Self {
            db_pool,
            cpu_pool,
            config,
            repo_factory,
            stock_store,
            lock_service,
        }
    }

    pub fn stock_synchronizer(&self) -> StockSynchronizer {
        StockSynchronizer::new(self.stock_store.clone(), self.lock_service.clone(), self.config.stock.clone())
    }

    pub fn coupon_issuance(&self) -> CouponIssuance {
        CouponIssuance::new(self.stock_synchronizer(), self.config.lock.ttl(), self.config.lock.total_timeout())
    }
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > Clone for StaticContext<T, M, F>
{
    fn clone(&self) -> Self {
        Self {
            db_pool: self.db_pool.clone(),
            cpu_pool: self.cpu_pool.clone(),
            config: self.config.clone(),
            repo_factory: self.repo_factory.clone(),
            stock_store: self.stock_store.clone(),
            lock_service: self.lock_service.clone(),
        }
    }
}
