//! Coupons is a service issuing limited coupons to users.
//! The layered structure of the app is
//!
//! `Loader -> Service -> Repo + CouponStockStore + LockService`
//!
//! Issuance takes a unit of stock from the redis mirror under a distributed
//! lock and persists it in the db, compensating the mirror when the db write
//! fails. Each layer can throw Error with context or cover occurred error with
//! Error in the context, see `errors::Error` for the kinds.

#![allow(proc_macro_derive_resolution_fallback)]
#![recursion_limit = "128"]
extern crate config as config_crate;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate failure;
extern crate futures;
extern crate futures_cpupool;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate r2d2;
extern crate r2d2_redis;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate sentry;
extern crate tokio;
extern crate tokio_core;
extern crate tokio_signal;
extern crate uuid;

#[macro_use]
pub mod macros;
pub mod config;
pub mod context;
pub mod errors;
pub mod loaders;
pub mod locks;
pub mod models;
pub mod repos;
pub mod schema;
pub mod sentry_integration;
pub mod services;

use std::sync::Arc;
use std::time::Duration;

use diesel::pg::PgConnection;
use diesel::r2d2::ConnectionManager;
use failure::{err_msg, Error as FailureError};
use futures::{future, Future, Stream};
use futures_cpupool::CpuPool;
use r2d2_redis::RedisConnectionManager;
use tokio_core::reactor::Core;

use config::Config;
use context::StaticContext;
use repos::{CouponStockStore, RedisCouponStockStore, ReposFactoryImpl};
use services::Service;

pub type AppContext = StaticContext<PgConnection, ConnectionManager<PgConnection>, ReposFactoryImpl>;
pub type AppService = Service<PgConnection, ConnectionManager<PgConnection>, ReposFactoryImpl>;

/// Creates db and redis pools, the stock mirror and the lock service from `Config`
pub fn create_context(config: Config) -> Result<AppContext, FailureError> {
    // Prepare database pool
    let db_manager = ConnectionManager::<PgConnection>::new(config.server.database.clone());
    let db_pool = r2d2::Pool::builder().max_size(config.server.db_pool_size).build(db_manager)?;

    // Prepare CPU pool
    let cpu_pool = CpuPool::new(config.server.thread_count);

    // Prepare Redis pool
    let redis_manager = RedisConnectionManager::new(config.redis.url.as_str())?;
    let redis_pool = r2d2::Pool::builder()
        .max_size(config.redis.pool_size)
        .connection_timeout(config.redis.connection_timeout())
        .build(redis_manager)?;
    let stock_store = RedisCouponStockStore::new(redis_pool, config.stock.key_prefix.clone());

    let lock_service = locks::create_lock_service(&config)?;
    info!("Lock service is using {} redis instance(s)", config.lock_instances().len());

    Ok(StaticContext::new(
        db_pool,
        cpu_pool,
        Arc::new(config),
        ReposFactoryImpl,
        Arc::new(stock_store) as Arc<CouponStockStore>,
        Arc::new(lock_service),
    ))
}

/// Keeps the stock mirror of active coupons in sync until Ctrl+C,
/// then drains in-flight lock holders.
pub fn start_stock_keeper(config: Config) -> Result<(), FailureError> {
    let drain_timeout = config.drain_timeout();
    let interval = config.stock.resync_interval_s.map(Duration::from_secs);

    let context = create_context(config)?;
    let lock_service = context.lock_service.clone();
    let service: AppService = Service::new(context);

    let mut core = Core::new()?;
    core.run(loaders::resync_once(&service))?;

    let ctrl_c = tokio_signal::ctrl_c()
        .flatten_stream()
        .into_future()
        .map_err(|(err, _rest)| FailureError::from(err))
        .and_then(|(ctrl_c, _rest)| match ctrl_c {
            None => future::err(err_msg("Unexpected error: Ctrl+C stream ended")),
            Some(_) => {
                info!("Ctrl+C received. Exiting...");
                future::ok(())
            }
        });

    let keeper: Box<Future<Item = (), Error = FailureError>> = match interval {
        Some(interval) => {
            info!("Resyncing coupon stock every {:?}", interval);
            Box::new(loaders::run(service, interval))
        }
        None => Box::new(future::empty::<(), FailureError>()),
    };

    core.run(keeper.select(ctrl_c).map(|_| ()).map_err(|(err, _fut)| err))?;

    if lock_service.shutdown(drain_timeout) {
        info!("All lock holders finished, shut down cleanly");
    } else {
        warn!("Lock holders were still running after {:?}", drain_timeout);
    }
    Ok(())
}
