//! Model user_coupons

use std::time::SystemTime;

use models::{CouponId, UserCouponId, UserId};
use schema::user_coupons;

/// Coupon issued to a user, unique per (coupon_id, user_id)
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "user_coupons"]
pub struct UserCoupon {
    pub id: UserCouponId,
    pub coupon_id: CouponId,
    pub user_id: UserId,
    pub is_used: bool,
    pub issued_at: SystemTime,
    pub used_at: Option<SystemTime>,
}

/// Payload for issuing coupon to user
#[derive(Serialize, Deserialize, Insertable, Clone, Debug)]
#[table_name = "user_coupons"]
pub struct NewUserCoupon {
    pub coupon_id: CouponId,
    pub user_id: UserId,
}
