//! Coupons Services, issuance of limited coupons to users
//!
//! Issuance runs the cache fast path under the coupon lock and persists the
//! result in one db transaction. When the db write fails, the cache side is
//! compensated before the error reaches the caller. A db connection is only
//! checked out around db work, never while waiting for the coupon lock.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::Error as FailureError;
use r2d2::{ManageConnection, Pool};

use errors::{error_kind, Error};
use locks::LockService;
use models::*;
use repos::{CouponStockStore, ReposFactory};
use sentry_integration;
use services::stock_sync::StockSynchronizer;
use services::types::ServiceFuture;
use services::{get_connection, Service};

pub trait CouponsService {
    /// Issues coupon to user, at most once per user and never above the issue limit
    fn issue_coupon(&self, user_id: UserId, coupon_id: CouponId) -> ServiceFuture<UserCoupon>;
    /// Durable counters of coupon next to its cache mirror
    fn get_stock_report(&self, coupon_id: CouponId) -> ServiceFuture<StockReport>;
    /// Creates new coupon and warms up its stock mirror
    fn create_coupon(&self, payload: NewCoupon) -> ServiceFuture<Coupon>;
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > CouponsService for Service<T, M, F>
{
    fn issue_coupon(&self, user_id: UserId, coupon_id: CouponId) -> ServiceFuture<UserCoupon> {
        let repo_factory = self.static_context.repo_factory.clone();
        let issuance = self.static_context.coupon_issuance();

        self.spawn_with_db_pool(move |db_pool| {
            issuance
                .issue(&db_pool, &repo_factory, user_id, coupon_id)
                .map_err(|e| e.context("Service Coupons, issue_coupon endpoint error occurred.").into())
        })
    }

    fn get_stock_report(&self, coupon_id: CouponId) -> ServiceFuture<StockReport> {
        let repo_factory = self.static_context.repo_factory.clone();
        let stock_store = self.static_context.stock_store.clone();

        self.spawn_on_pool(move |conn| {
            {
                let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                let statistics = coupons_repo.get_statistics(coupon_id)?.ok_or_else(|| not_found(coupon_id))?;
                let cache_remaining = stock_store.remaining_stock(coupon_id)?;
                let cached_users = stock_store.issued_users_count(coupon_id)?;
                let metadata = stock_store.get_metadata(coupon_id)?;

                let report = StockReport::new(&statistics, cache_remaining, cached_users, metadata.as_ref());
                if !report.consistent {
                    warn!("Stock of coupon {} is inconsistent: {:?}", coupon_id, report);
                }
                Ok(report)
            }.map_err(|e: FailureError| e.context("Service Coupons, get_stock_report endpoint error occurred.").into())
        })
    }

    fn create_coupon(&self, payload: NewCoupon) -> ServiceFuture<Coupon> {
        let repo_factory = self.static_context.repo_factory.clone();
        let synchronizer = self.static_context.stock_synchronizer();

        self.spawn_on_pool(move |conn| {
            {
                let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);
                let coupon = conn.transaction::<Coupon, FailureError, _>(|| coupons_repo.create(payload))?;

                // a cold mirror is rebuilt on first issuance anyway
                if let Err(e) = synchronizer.ensure_synced(&*coupons_repo, &*user_coupons_repo, coupon.id) {
                    warn!("Stock of new coupon {} was not cached: {}", coupon.id, e);
                }
                Ok(coupon)
            }.map_err(|e: FailureError| e.context("Service Coupons, create_coupon endpoint error occurred.").into())
        })
    }
}

/// Issuance protocol of a single coupon to a single user
pub struct CouponIssuance {
    synchronizer: StockSynchronizer,
    lock_ttl: Duration,
    lock_timeout: Duration,
}

impl CouponIssuance {
    pub fn new(synchronizer: StockSynchronizer, lock_ttl: Duration, lock_timeout: Duration) -> Self {
        Self {
            synchronizer,
            lock_ttl,
            lock_timeout,
        }
    }

    fn stock_store(&self) -> &Arc<CouponStockStore> {
        self.synchronizer.stock_store()
    }

    fn lock_service(&self) -> &Arc<LockService> {
        self.synchronizer.lock_service()
    }

    pub fn issue<T, M, F>(&self, db_pool: &Pool<M>, repo_factory: &F, user_id: UserId, coupon_id: CouponId) -> Result<UserCoupon, FailureError>
    where
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    {
        {
            let conn = get_connection(db_pool)?;
            let coupons_repo = repo_factory.create_coupons_repo(&*conn);
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            let coupon = coupons_repo.find(coupon_id)?.ok_or_else(|| not_found(coupon_id))?;
            check_coupon(&coupon, SystemTime::now())?;

            let synced = self
                .synchronizer
                .ensure_synced(&*coupons_repo, &*user_coupons_repo, coupon_id)?;
            if !synced {
                return Err(not_found(coupon_id));
            }
        }

        let lock_key = self.synchronizer.lock_key(coupon_id);
        self.lock_service().with_lock(&lock_key, self.lock_ttl, self.lock_timeout, || {
            match self.stock_store().try_issue(coupon_id, user_id)? {
                IssueOutcome::Success { remaining } => {
                    debug!("Coupon {} taken by user {} in cache, {} left.", coupon_id, user_id, remaining);
                    self.persist(db_pool, repo_factory, coupon_id, user_id)
                }
                IssueOutcome::AlreadyIssued => Err(format_err!("Coupon {} has already been issued to user {}", coupon_id, user_id)
                    .context(Error::AlreadyIssued)
                    .into()),
                IssueOutcome::OutOfStock => Err(format_err!("Coupon {} is out of stock", coupon_id)
                    .context(Error::OutOfStock)
                    .into()),
                IssueOutcome::NotFound => {
                    warn!("Stock of coupon {} vanished from cache during issuance, resyncing.", coupon_id);
                    self.resync(db_pool, repo_factory, coupon_id);
                    Err(format_err!("Stock of coupon {} was evicted, retry later", coupon_id)
                        .context(Error::ServiceUnavailable)
                        .into())
                }
            }
        })
    }

    /// Writes an issuance already taken in cache to db. Runs under the coupon lock.
    fn persist<T, M, F>(&self, db_pool: &Pool<M>, repo_factory: &F, coupon_id: CouponId, user_id: UserId) -> Result<UserCoupon, FailureError>
    where
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    {
        let persisted = get_connection(db_pool).and_then(|conn| {
            let coupons_repo = repo_factory.create_coupons_repo(&*conn);
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);

            let user_coupon = conn.transaction::<UserCoupon, FailureError, _>(|| {
                let user_coupon = user_coupons_repo.create(NewUserCoupon { coupon_id, user_id })?;
                if !coupons_repo.increment_issued_count_if_under_limit(coupon_id)? {
                    return Err(format_err!("Issue limit of coupon {} is reached in db", coupon_id)
                        .context(Error::OutOfStock)
                        .into());
                }
                Ok(user_coupon)
            });
            user_coupon
        });

        persisted.or_else(|e| {
            warn!("Issuance of coupon {} to user {} failed in db: {}", coupon_id, user_id, e);
            self.compensate(coupon_id, user_id);

            // db refused what the mirror let through, so the mirror has drifted
            match error_kind(&e) {
                Some(Error::OutOfStock) | Some(Error::AlreadyIssued) => {
                    warn!("Stock mirror of coupon {} disagrees with db, resyncing.", coupon_id);
                    self.resync(db_pool, repo_factory, coupon_id);
                }
                _ => {}
            }
            Err(e)
        })
    }

    fn compensate(&self, coupon_id: CouponId, user_id: UserId) {
        match self.stock_store().rollback_issuance(coupon_id, user_id) {
            Ok(true) => info!("Issuance of coupon {} to user {} rolled back in cache.", coupon_id, user_id),
            Ok(false) => warn!("Cache had no issuance of coupon {} to user {} to roll back.", coupon_id, user_id),
            Err(rollback_err) => {
                let critical: FailureError = rollback_err
                    .context(format!(
                        "Coupon {} stays issued to user {} in cache only, stock mirror is inconsistent",
                        coupon_id, user_id
                    )).into();
                sentry_integration::report(&critical);
            }
        }
    }

    /// Rebuilds the mirror under the coupon lock held by the caller. Failures are only logged.
    fn resync<T, M, F>(&self, db_pool: &Pool<M>, repo_factory: &F, coupon_id: CouponId)
    where
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    {
        let resynced = get_connection(db_pool).and_then(|conn| {
            let coupons_repo = repo_factory.create_coupons_repo(&*conn);
            let user_coupons_repo = repo_factory.create_user_coupons_repo(&*conn);
            let resynced = self
                .synchronizer
                .resync_locked(&*coupons_repo, &*user_coupons_repo, coupon_id);
            resynced
        });

        if let Err(e) = resynced {
            warn!("Resync of coupon {} failed: {}", coupon_id, e);
        }
    }
}

/// Checks the coupon can be issued at `now`
pub fn validate_coupon(coupon: &Coupon, now: SystemTime) -> CouponValidate {
    if !coupon.is_active {
        return CouponValidate::NotActive;
    }

    if now < coupon.valid_from {
        return CouponValidate::NotStarted;
    }

    if now > coupon.valid_until {
        return CouponValidate::HasExpired;
    }

    CouponValidate::Valid
}

fn check_coupon(coupon: &Coupon, now: SystemTime) -> Result<(), FailureError> {
    let kind = match validate_coupon(coupon, now) {
        CouponValidate::Valid => return Ok(()),
        CouponValidate::NotActive => Error::CouponNotActive,
        CouponValidate::NotStarted => Error::NotStarted,
        CouponValidate::HasExpired => Error::Expired,
    };
    Err(format_err!("Coupon {} can not be issued: {:?}", coupon.id, kind).context(kind).into())
}

fn not_found(coupon_id: CouponId) -> FailureError {
    format_err!("Coupon {} not found", coupon_id).context(Error::NotFound).into()
}

#[cfg(test)]
pub mod tests {
    use std::collections::HashMap;
    use std::thread;
    use std::time::{Duration, SystemTime};

    use futures::future::{self, Future};
    use tokio_core::reactor::Core;

    use errors::{error_kind, Error};
    use models::*;
    use repos::repo_factory::tests::*;
    use repos::*;
    use services::*;

    fn issue_concurrently(env: &MockEnvironment, coupon_id: CouponId, users: Vec<UserId>) -> HashMap<Option<Error>, usize> {
        let mut core = Core::new().unwrap();
        let works = users
            .into_iter()
            .map(|user_id| env.service.issue_coupon(user_id, coupon_id).then(|result| Ok::<_, ()>(result)))
            .collect::<Vec<_>>();
        let results = core.run(future::join_all(works)).unwrap();

        let mut outcomes = HashMap::new();
        for result in results {
            let kind = match result {
                Ok(_) => None,
                Err(e) => Some(error_kind(&e).unwrap_or(Error::Database)),
            };
            *outcomes.entry(kind).or_insert(0) += 1;
        }
        outcomes
    }

    fn assert_consistent(env: &MockEnvironment, coupon_id: CouponId) {
        let mut core = Core::new().unwrap();
        let report = core.run(env.service.get_stock_report(coupon_id)).unwrap();
        assert!(report.consistent, "{:?}", report);
    }

    fn users(from: i32, count: i32) -> Vec<UserId> {
        (from..from + count).map(UserId).collect()
    }

    #[test]
    fn test_issue_coupon() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(3, &[]);

        let mut core = Core::new().unwrap();
        let user_coupon = core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap();

        assert_eq!(user_coupon.coupon_id, coupon.id);
        assert_eq!(user_coupon.user_id, UserId(1));
        assert!(!user_coupon.is_used);
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 1);
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(2));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_issue_unknown_coupon() {
        let env = MockEnvironment::new();

        let mut core = Core::new().unwrap();
        let err = core.run(env.service.issue_coupon(UserId(1), CouponId(404))).unwrap_err();
        assert_eq!(error_kind(&err), Some(Error::NotFound));
        assert_eq!(error_kind(&err).map(|kind| kind.code()), Some(404));
    }

    #[test]
    fn test_issue_invalid_coupons() {
        let env = MockEnvironment::new();
        let inactive = env.db.seed_coupon(3, &[]);
        env.db.update_coupon(inactive.id, |coupon| coupon.is_active = false);
        let upcoming = env.db.seed_coupon(3, &[]);
        env.db.update_coupon(upcoming.id, |coupon| coupon.valid_from = SystemTime::now() + Duration::from_secs(3600));
        let expired = env.db.seed_coupon(3, &[]);
        env.db.update_coupon(expired.id, |coupon| coupon.valid_until = SystemTime::now() - Duration::from_secs(1));

        let mut core = Core::new().unwrap();
        for (coupon_id, kind) in vec![
            (inactive.id, Error::CouponNotActive),
            (upcoming.id, Error::NotStarted),
            (expired.id, Error::Expired),
        ] {
            let err = core.run(env.service.issue_coupon(UserId(1), coupon_id)).unwrap_err();
            assert_eq!(error_kind(&err), Some(kind));
            assert_eq!(kind.code(), 400);
            assert!(!env.stock.stock_exists(coupon_id).unwrap());
        }
    }

    #[test]
    fn test_bounded_issuance() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(100, &[]);

        let outcomes = issue_concurrently(&env, coupon.id, users(1, 150));

        assert_eq!(outcomes.get(&None), Some(&100));
        assert_eq!(outcomes.get(&Some(Error::OutOfStock)), Some(&50));
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 100);
        assert_eq!(env.db.user_coupons(coupon.id).len(), 100);
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(0));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_issuance_on_nearly_exhausted_coupon() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(100, &users(1000, 95));

        let outcomes = issue_concurrently(&env, coupon.id, users(1, 10));

        assert_eq!(outcomes.get(&None), Some(&5));
        assert_eq!(outcomes.get(&Some(Error::OutOfStock)), Some(&5));
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 100);
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_no_double_issuance() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(10, &[]);

        let outcomes = issue_concurrently(&env, coupon.id, vec![UserId(7); 12]);

        assert_eq!(outcomes.get(&None), Some(&1));
        assert_eq!(outcomes.get(&Some(Error::AlreadyIssued)), Some(&11));
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 1);
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(9));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_db_failure_is_compensated() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(5, &[]);
        env.db.set_fail_user_coupon_inserts(true);

        let mut core = Core::new().unwrap();
        let err = core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap_err();
        assert_eq!(error_kind(&err), Some(Error::Database));
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(5));
        assert!(!env.stock.is_issued(coupon.id, UserId(1)).unwrap());
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 0);

        env.db.set_fail_user_coupon_inserts(false);
        core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap();
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(4));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_db_limit_rolls_back_user_row() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(1, &[UserId(1)]);
        // mirror claims stock the db does not have
        env.stock.sync_stock(coupon.id, 1, Duration::from_secs(60)).unwrap();

        let mut core = Core::new().unwrap();
        let err = core.run(env.service.issue_coupon(UserId(2), coupon.id)).unwrap_err();

        assert_eq!(error_kind(&err), Some(Error::OutOfStock));
        assert_eq!(env.db.user_coupons(coupon.id).len(), 1);
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 1);
        assert!(!env.stock.is_issued(coupon.id, UserId(2)).unwrap());
        // the refusal resyncs the mirror to db
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(0));
        assert_consistent(&env, coupon.id);

        let outcomes = issue_concurrently(&env, coupon.id, users(3, 3));
        assert_eq!(outcomes.get(&Some(Error::OutOfStock)), Some(&3));
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 1);
        assert_eq!(env.db.user_coupons(coupon.id).len(), 1);
    }

    #[test]
    fn test_db_duplicate_user_resyncs_mirror() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(5, &[UserId(1)]);
        // mirror lost the issuance to user 1
        env.stock.sync_stock(coupon.id, 5, Duration::from_secs(60)).unwrap();

        let mut core = Core::new().unwrap();
        let err = core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap_err();

        assert_eq!(error_kind(&err), Some(Error::AlreadyIssued));
        assert_eq!(env.db.user_coupons(coupon.id).len(), 1);
        assert!(env.stock.is_issued(coupon.id, UserId(1)).unwrap());
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(4));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_failed_rollback_returns_db_error() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(5, &[]);
        env.db.set_fail_user_coupon_inserts(true);
        env.stock.set_fail_rollbacks(true);

        let mut core = Core::new().unwrap();
        let err = core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap_err();

        assert_eq!(error_kind(&err), Some(Error::Database));
        assert!(env.stock.is_issued(coupon.id, UserId(1)).unwrap());
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(4));

        core.run(env.service.sync_all_active_coupons()).unwrap();
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(5));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_cache_outage_is_unavailable() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(5, &[]);
        env.stock.set_unavailable(true);

        let mut core = Core::new().unwrap();
        let err = core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap_err();

        assert_eq!(error_kind(&err), Some(Error::ServiceUnavailable));
        assert_eq!(error_kind(&err).map(|kind| kind.code()), Some(503));
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 0);
        assert!(env.db.user_coupons(coupon.id).is_empty());
    }

    #[test]
    fn test_evicted_stock_is_resynced() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(5, &[UserId(1)]);

        let mut core = Core::new().unwrap();
        core.run(env.service.ensure_synced(coupon.id)).unwrap();
        env.stock.evict_on_next_try_issue();

        let err = core.run(env.service.issue_coupon(UserId(2), coupon.id)).unwrap_err();
        assert_eq!(error_kind(&err), Some(Error::ServiceUnavailable));
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(4));
        assert!(env.stock.is_issued(coupon.id, UserId(1)).unwrap());

        core.run(env.service.issue_coupon(UserId(2), coupon.id)).unwrap();
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(3));
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_busy_coupon_times_out() {
        let env = MockEnvironment::with_lock_timeout(Duration::from_millis(200));
        let coupon = env.db.seed_coupon(5, &[]);

        let mut core = Core::new().unwrap();
        core.run(env.service.ensure_synced(coupon.id)).unwrap();
        let lock_key = env.service.static_context.stock_synchronizer().lock_key(coupon.id);
        let _held = env
            .lock_service
            .lock(&lock_key, Duration::from_secs(5), Duration::from_secs(1))
            .unwrap();

        let err = core.run(env.service.issue_coupon(UserId(1), coupon.id)).unwrap_err();
        assert_eq!(error_kind(&err), Some(Error::LockTimeout));
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(5));
    }

    #[test]
    fn test_waiting_for_lock_holds_no_connection() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(5, &[]);

        let mut core = Core::new().unwrap();
        core.run(env.service.ensure_synced(coupon.id)).unwrap();
        let lock_key = env.service.static_context.stock_synchronizer().lock_key(coupon.id);
        let held = env
            .lock_service
            .lock(&lock_key, Duration::from_secs(5), Duration::from_secs(1))
            .unwrap();

        let works = users(1, 3)
            .into_iter()
            .map(|user_id| env.service.issue_coupon(user_id, coupon.id))
            .collect::<Vec<_>>();
        thread::sleep(Duration::from_millis(300));

        let state = env.service.static_context.db_pool.state();
        assert_eq!(state.connections - state.idle_connections, 0);

        drop(held);
        let issued = core.run(future::join_all(works)).unwrap();
        assert_eq!(issued.len(), 3);
        assert_eq!(env.db.coupon(coupon.id).unwrap().issued_count, 3);
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_mixed_runs_stay_consistent() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(20, &users(500, 3));

        let mut requests = users(1, 10);
        requests.extend(users(500, 3));
        requests.extend(users(5, 10));
        issue_concurrently(&env, coupon.id, requests);
        env.db.set_fail_user_coupon_inserts(true);
        issue_concurrently(&env, coupon.id, users(100, 5));
        env.db.set_fail_user_coupon_inserts(false);
        issue_concurrently(&env, coupon.id, users(200, 10));

        let durable = env.db.coupon(coupon.id).unwrap();
        assert_eq!(durable.issued_count, 20);
        assert_eq!(env.db.user_coupons(coupon.id).len(), 20);
        assert_consistent(&env, coupon.id);
    }

    #[test]
    fn test_get_stock_report() {
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(10, &[UserId(1), UserId(2)]);

        let mut core = Core::new().unwrap();
        let cold = core.run(env.service.get_stock_report(coupon.id)).unwrap();
        assert_eq!(cold.cache_remaining, None);
        assert!(!cold.consistent);

        core.run(env.service.ensure_synced(coupon.id)).unwrap();
        let warm = core.run(env.service.get_stock_report(coupon.id)).unwrap();
        assert_eq!(warm.issue_limit, 10);
        assert_eq!(warm.issued_count, 2);
        assert_eq!(warm.issued_users, 2);
        assert_eq!(warm.cache_remaining, Some(8));
        assert_eq!(warm.cached_users, 2);
        assert_eq!(warm.cached_issue_limit, Some(10));
        assert!(warm.consistent);

        // limit raised in db but not in the mirror
        env.db.update_coupon(coupon.id, |coupon| coupon.issue_limit = 12);
        let stale = core.run(env.service.get_stock_report(coupon.id)).unwrap();
        assert_eq!(stale.cached_issue_limit, Some(10));
        assert!(!stale.consistent);
    }

    #[test]
    fn test_create_coupon() {
        let env = MockEnvironment::new();
        let now = SystemTime::now();
        let payload = NewCoupon {
            code: "spring".to_string(),
            title: "Spring sale".to_string(),
            store_id: StoreId(1),
            percent: 15,
            issue_limit: 50,
            valid_from: now,
            valid_until: now + Duration::from_secs(3600),
        };

        let mut core = Core::new().unwrap();
        let coupon = core.run(env.service.create_coupon(payload)).unwrap();

        assert_eq!(coupon.issue_limit, 50);
        assert_eq!(coupon.issued_count, 0);
        assert_eq!(env.stock.remaining_stock(coupon.id).unwrap(), Some(50));
    }

    #[test]
    fn test_create_coupon_with_taken_code() {
        let env = MockEnvironment::new();
        let now = SystemTime::now();
        let payload = NewCoupon {
            code: "autumn".to_string(),
            title: "Autumn sale".to_string(),
            store_id: StoreId(1),
            percent: 20,
            issue_limit: 10,
            valid_from: now,
            valid_until: now + Duration::from_secs(3600),
        };
        let mut same_code = payload.clone();
        same_code.code = "AUTUMN".to_string();
        let mut other_store = payload.clone();
        other_store.store_id = StoreId(2);

        let mut core = Core::new().unwrap();
        core.run(env.service.create_coupon(payload)).unwrap();
        let err = core.run(env.service.create_coupon(same_code)).unwrap_err();
        assert_eq!(error_kind(&err), Some(Error::CouponCodeTaken));
        assert_eq!(error_kind(&err).map(|kind| kind.code()), Some(409));

        let coupon = core.run(env.service.create_coupon(other_store)).unwrap();
        assert_eq!(coupon.code, "AUTUMN");
    }

    #[test]
    fn test_validate_coupon() {
        let now = SystemTime::now();
        let env = MockEnvironment::new();
        let coupon = env.db.seed_coupon(1, &[]);

        assert_eq!(validate_coupon(&coupon, now), CouponValidate::Valid);
        assert_eq!(validate_coupon(&coupon, coupon.valid_until + Duration::from_secs(1)), CouponValidate::HasExpired);
        assert_eq!(validate_coupon(&coupon, coupon.valid_from - Duration::from_secs(1)), CouponValidate::NotStarted);
    }
}
