use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::Connection;
use failure::Error as FailureError;

use errors::diesel_error;
use models::*;
use repos::types::RepoResult;
use schema::user_coupons::dsl as UserCoupons;

/// UserCoupons repository, responsible for handling user_coupons table
pub struct UserCouponsRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait UserCouponsRepo {
    /// Issues coupon to user, fails with `AlreadyIssued` on a second issue
    fn create(&self, payload: NewUserCoupon) -> RepoResult<UserCoupon>;

    /// Ids of users holding the coupon
    fn issued_user_ids(&self, coupon_id_arg: CouponId) -> RepoResult<Vec<UserId>>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> UserCouponsRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> UserCouponsRepo for UserCouponsRepoImpl<'a, T> {
    fn create(&self, payload: NewUserCoupon) -> RepoResult<UserCoupon> {
        debug!("Issue coupon {} to user {}.", payload.coupon_id, payload.user_id);
        let query = diesel::insert_into(UserCoupons::user_coupons).values(&payload);

        query
            .get_result::<UserCoupon>(self.db_conn)
            .map_err(diesel_error)
            .map_err(|e: FailureError| e.context(format!("Create user coupon: {:?} error occurred", payload)).into())
    }

    fn issued_user_ids(&self, coupon_id_arg: CouponId) -> RepoResult<Vec<UserId>> {
        debug!("Find users holding coupon {}.", coupon_id_arg);
        let query = UserCoupons::user_coupons
            .filter(UserCoupons::coupon_id.eq(&coupon_id_arg))
            .select(UserCoupons::user_id)
            .order(UserCoupons::user_id);

        query
            .get_results::<UserId>(self.db_conn)
            .map_err(diesel_error)
            .map_err(|e: FailureError| {
                e.context(format!("List users holding coupon: {} error occurred", coupon_id_arg))
                    .into()
            })
    }
}
