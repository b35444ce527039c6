//! Model coupons
use std::time::SystemTime;

use models::{CouponId, StoreId};
use schema::coupons;

/// DB presenting by coupon
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "coupons"]
pub struct Coupon {
    pub id: CouponId,
    pub code: String,
    pub title: String,
    pub store_id: StoreId,
    pub percent: i32,
    pub issue_limit: i32,
    pub issued_count: i32,
    pub valid_from: SystemTime,
    pub valid_until: SystemTime,
    pub is_active: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Coupon {
    /// Stock left according to the durable counters, never negative
    pub fn remaining_stock(&self) -> i64 {
        i64::from(self.issue_limit - self.issued_count).max(0)
    }
}

/// Payload for creating coupon
#[derive(Serialize, Deserialize, Insertable, Clone, Debug)]
#[table_name = "coupons"]
pub struct NewCoupon {
    pub code: String,
    pub title: String,
    pub store_id: StoreId,
    pub percent: i32,
    pub issue_limit: i32,
    pub valid_from: SystemTime,
    pub valid_until: SystemTime,
}

/// Issuance counters of a coupon as seen by the durable store
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CouponStatistics {
    pub coupon_id: CouponId,
    pub issue_limit: i32,
    pub issued_count: i32,
    pub issued_users: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum CouponValidate {
    NotActive,
    NotStarted,
    HasExpired,
    Valid,
}
