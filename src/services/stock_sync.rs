//! Stock sync keeps the redis stock mirror reconcilable with the db.
//!
//! The mirror of a coupon is rebuilt under the coupon lock from the durable
//! counters: issued users first, then metadata, and the stock counter last,
//! since its presence is what marks the mirror as warm.
use std::cmp;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::Error as FailureError;
use r2d2::ManageConnection;

use config::StockConfig;
use locks::LockService;
use models::*;
use repos::{CouponStockStore, CouponsRepo, ReposFactory, UserCouponsRepo};
use sentry_integration;
use services::types::ServiceFuture;
use services::Service;

pub trait StockSyncService {
    /// Makes sure the stock mirror of coupon exists, returns `false` if there is no such coupon
    fn ensure_synced(&self, coupon_id: CouponId) -> ServiceFuture<bool>;
    /// Rebuilds the mirror of every active coupon
    fn sync_all_active_coupons(&self) -> ServiceFuture<SyncSummary>;
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > StockSyncService for Service<T, M, F>
{
    fn ensure_synced(&self, coupon_id: CouponId) -> ServiceFuture<bool> {
        let repo_factory = self.static_context.repo_factory.clone();
        let synchronizer = self.static_context.stock_synchronizer();

        self.spawn_on_pool(move |conn| {
            let coupons_repo = repo_factory.create_coupons_repo(&*conn);
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            synchronizer
                .ensure_synced(&*coupons_repo, &*user_coupons_repo, coupon_id)
                .map_err(|e| e.context("Service StockSync, ensure_synced endpoint error occurred.").into())
        })
    }

    fn sync_all_active_coupons(&self) -> ServiceFuture<SyncSummary> {
        let repo_factory = self.static_context.repo_factory.clone();
        let synchronizer = self.static_context.stock_synchronizer();

        self.spawn_on_pool(move |conn| {
            let coupons_repo = repo_factory.create_coupons_repo(&*conn);
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            synchronizer
                .sync_all_active_coupons(&*coupons_repo, &*user_coupons_repo)
                .map_err(|e| e.context("Service StockSync, sync_all_active_coupons endpoint error occurred.").into())
        })
    }
}

#[derive(Clone)]
pub struct StockSynchronizer {
    stock_store: Arc<CouponStockStore>,
    lock_service: Arc<LockService>,
    config: StockConfig,
}

impl StockSynchronizer {
    pub fn new(stock_store: Arc<CouponStockStore>, lock_service: Arc<LockService>, config: StockConfig) -> Self {
        Self {
            stock_store,
            lock_service,
            config,
        }
    }

    pub fn stock_store(&self) -> &Arc<CouponStockStore> {
        &self.stock_store
    }

    pub fn lock_service(&self) -> &Arc<LockService> {
        &self.lock_service
    }

    pub fn lock_key(&self, coupon_id: CouponId) -> String {
        self.config.lock_key(coupon_id.0)
    }

    pub fn ensure_synced(
        &self,
        coupons_repo: &CouponsRepo,
        user_coupons_repo: &UserCouponsRepo,
        coupon_id: CouponId,
    ) -> Result<bool, FailureError> {
        if self.stock_store.stock_exists(coupon_id)? {
            return Ok(true);
        }

        info!("Stock of coupon {} is not cached, syncing from db.", coupon_id);
        self.lock_service.with_default_lock(&self.lock_key(coupon_id), || {
            // somebody may have synced it while we were waiting for the lock
            if self.stock_store.stock_exists(coupon_id)? {
                return Ok(true);
            }
            self.resync_locked(coupons_repo, user_coupons_repo, coupon_id)
        })
    }

    /// Rebuilds the mirror of coupon. The caller must hold the coupon lock.
    pub fn resync_locked(
        &self,
        coupons_repo: &CouponsRepo,
        user_coupons_repo: &UserCouponsRepo,
        coupon_id: CouponId,
    ) -> Result<bool, FailureError> {
        match coupons_repo.find(coupon_id)? {
            Some(coupon) => {
                self.write_mirror(&coupon, user_coupons_repo)?;
                Ok(true)
            }
            None => {
                warn!("Coupon {} is absent in db, nothing to sync.", coupon_id);
                Ok(false)
            }
        }
    }

    pub fn sync_all_active_coupons(&self, coupons_repo: &CouponsRepo, user_coupons_repo: &UserCouponsRepo) -> Result<SyncSummary, FailureError> {
        let coupons = coupons_repo.list_active(SystemTime::now())?;
        let mut summary = SyncSummary::default();

        for coupon in coupons {
            let synced = self
                .lock_service
                .with_default_lock(&self.lock_key(coupon.id), || {
                    self.resync_locked(coupons_repo, user_coupons_repo, coupon.id)
                });

            match synced {
                Ok(true) => summary.synced += 1,
                Ok(false) => {}
                Err(e) => {
                    let e: FailureError = e.context(format!("Stock sync of coupon {} failed", coupon.id)).into();
                    sentry_integration::report(&e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Stock sync finished, {} coupon(s) synced, {} failed.",
            summary.synced, summary.failed
        );
        Ok(summary)
    }

    fn write_mirror(&self, coupon: &Coupon, user_coupons_repo: &UserCouponsRepo) -> Result<(), FailureError> {
        let user_ids = user_coupons_repo.issued_user_ids(coupon.id)?;
        if user_ids.len() as i64 != i64::from(coupon.issued_count) {
            warn!(
                "Coupon {} has {} issued user(s) but issued count {}.",
                coupon.id,
                user_ids.len(),
                coupon.issued_count
            );
        }

        let ttl = stock_ttl(
            coupon.valid_until,
            SystemTime::now(),
            self.config.grace_period(),
            self.config.max_ttl(),
        );
        let remaining = coupon.remaining_stock();

        self.stock_store.sync_issued_users(coupon.id, &user_ids, ttl)?;
        self.stock_store.cache_metadata(&CouponStockMetadata::from(coupon), ttl)?;
        self.stock_store.sync_stock(coupon.id, remaining, ttl)?;

        debug!(
            "Stock of coupon {} synced: remaining {}, {} issued user(s), ttl {:?}.",
            coupon.id,
            remaining,
            user_ids.len(),
            ttl
        );
        Ok(())
    }
}

/// Lifetime of a coupon mirror: until the coupon expires plus `grace`,
/// capped at `max` and never below one second
pub fn stock_ttl(valid_until: SystemTime, now: SystemTime, grace: Duration, max: Duration) -> Duration {
    let until_expiry = valid_until.duration_since(now).unwrap_or_else(|_| Duration::from_secs(0));
    let ttl = cmp::min(until_expiry + grace, max);
    cmp::max(ttl, Duration::from_secs(1))
}
