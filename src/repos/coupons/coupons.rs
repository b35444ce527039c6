use std::time::SystemTime;

use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::Connection;
use failure::Error as FailureError;

use errors::{coupon_create_error, diesel_error};
use models::*;
use repos::types::RepoResult;
use schema::coupons::dsl as Coupons;
use schema::user_coupons::dsl as UserCoupons;

/// Coupons repository, responsible for handling coupons table
pub struct CouponsRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait CouponsRepo {
    /// Creates new coupon
    fn create(&self, payload: NewCoupon) -> RepoResult<Coupon>;

    /// Find coupon by id
    fn find(&self, id_arg: CouponId) -> RepoResult<Option<Coupon>>;

    /// Active coupons that have not expired at `now`
    fn list_active(&self, now: SystemTime) -> RepoResult<Vec<Coupon>>;

    /// Increments issued_count unless the limit is reached, returns whether a row changed
    fn increment_issued_count_if_under_limit(&self, id_arg: CouponId) -> RepoResult<bool>;

    /// Issuance counters of coupon
    fn get_statistics(&self, id_arg: CouponId) -> RepoResult<Option<CouponStatistics>>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponsRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponsRepo for CouponsRepoImpl<'a, T> {
    fn create(&self, payload: NewCoupon) -> RepoResult<Coupon> {
        debug!("Create new coupon {:?}.", payload);
        let mut payload = payload;
        payload.code = payload.code.to_uppercase();

        let query = diesel::insert_into(Coupons::coupons).values(&payload);
        query
            .get_result::<Coupon>(self.db_conn)
            .map_err(coupon_create_error)
            .map_err(|e: FailureError| e.context(format!("Creates new coupon: {:?} error occurred", payload)).into())
    }

    fn find(&self, id_arg: CouponId) -> RepoResult<Option<Coupon>> {
        debug!("Find in coupon with id {}.", id_arg);
        let query = Coupons::coupons.filter(Coupons::id.eq(&id_arg));
        query
            .get_result(self.db_conn)
            .optional()
            .map_err(diesel_error)
            .map_err(|e: FailureError| e.context(format!("Find coupon with id: {} error occurred", id_arg)).into())
    }

    fn list_active(&self, now: SystemTime) -> RepoResult<Vec<Coupon>> {
        debug!("Find active coupons valid until after {:?}.", now);
        let query = Coupons::coupons
            .filter(Coupons::is_active.eq(true))
            .filter(Coupons::valid_until.gt(now))
            .order(Coupons::id);

        query
            .get_results(self.db_conn)
            .map_err(diesel_error)
            .map_err(|e: FailureError| e.context("List active coupons error occurred").into())
    }

    fn increment_issued_count_if_under_limit(&self, id_arg: CouponId) -> RepoResult<bool> {
        debug!("Increment issued count of coupon {}.", id_arg);
        let filtered = Coupons::coupons
            .filter(Coupons::id.eq(&id_arg))
            .filter(Coupons::issued_count.lt(Coupons::issue_limit));
        let query = diesel::update(filtered).set((
            Coupons::issued_count.eq(Coupons::issued_count + 1),
            Coupons::updated_at.eq(SystemTime::now()),
        ));

        query
            .execute(self.db_conn)
            .map(|updated| updated == 1)
            .map_err(diesel_error)
            .map_err(|e: FailureError| {
                e.context(format!("Increment issued count of coupon: {} error occurred", id_arg))
                    .into()
            })
    }

    fn get_statistics(&self, id_arg: CouponId) -> RepoResult<Option<CouponStatistics>> {
        debug!("Get statistics of coupon {}.", id_arg);
        let query = Coupons::coupons.filter(Coupons::id.eq(&id_arg));

        query
            .get_result::<Coupon>(self.db_conn)
            .optional()
            .map_err(diesel_error)
            .and_then(|coupon| match coupon {
                Some(coupon) => UserCoupons::user_coupons
                    .filter(UserCoupons::coupon_id.eq(&id_arg))
                    .count()
                    .get_result::<i64>(self.db_conn)
                    .map_err(diesel_error)
                    .map(|issued_users| {
                        Some(CouponStatistics {
                            coupon_id: coupon.id,
                            issue_limit: coupon.issue_limit,
                            issued_count: coupon.issued_count,
                            issued_users,
                        })
                    }),
                None => Ok(None),
            }).map_err(|e: FailureError| e.context(format!("Get statistics of coupon: {} error occurred", id_arg)).into())
    }
}
