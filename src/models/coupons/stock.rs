//! Cache-resident stock mirror of coupons

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use models::{Coupon, CouponId, CouponStatistics};

/// Result of a single fast path issuance attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    Success { remaining: i64 },
    AlreadyIssued,
    OutOfStock,
    /// Stock mirror is missing, the coupon has to be resynced from db
    NotFound,
}

/// Metadata kept next to the stock counter for revalidation without db
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponStockMetadata {
    pub coupon_id: CouponId,
    pub is_active: bool,
    pub valid_from: SystemTime,
    pub valid_until: SystemTime,
    pub issue_limit: i32,
}

impl<'a> From<&'a Coupon> for CouponStockMetadata {
    fn from(coupon: &'a Coupon) -> Self {
        Self {
            coupon_id: coupon.id,
            is_active: coupon.is_active,
            valid_from: coupon.valid_from,
            valid_until: coupon.valid_until,
            issue_limit: coupon.issue_limit,
        }
    }
}

/// Durable counters of a coupon next to its cache mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockReport {
    pub coupon_id: CouponId,
    pub issue_limit: i32,
    pub issued_count: i32,
    pub issued_users: i64,
    pub cache_remaining: Option<i64>,
    pub cached_users: usize,
    /// Issue limit recorded in the cached metadata
    pub cached_issue_limit: Option<i32>,
    pub consistent: bool,
}

impl StockReport {
    /// The mirror is consistent when stock, issued users and metadata all agree with the db
    pub fn new(
        statistics: &CouponStatistics,
        cache_remaining: Option<i64>,
        cached_users: usize,
        metadata: Option<&CouponStockMetadata>,
    ) -> Self {
        let cached_issue_limit = metadata.map(|metadata| metadata.issue_limit);
        let stock_matches = cache_remaining
            .map(|remaining| i64::from(statistics.issued_count) + remaining == i64::from(statistics.issue_limit))
            .unwrap_or(false);
        let users_match = statistics.issued_users == cached_users as i64;
        let metadata_matches = cached_issue_limit == Some(statistics.issue_limit);

        Self {
            coupon_id: statistics.coupon_id,
            issue_limit: statistics.issue_limit,
            issued_count: statistics.issued_count,
            issued_users: statistics.issued_users,
            cache_remaining,
            cached_users,
            cached_issue_limit,
            consistent: stock_matches && users_match && metadata_matches,
        }
    }
}

/// Outcome of a warm-up pass over active coupons
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub failed: usize,
}

pub fn to_unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64 * 1000 + i64::from(elapsed.subsec_millis()),
        Err(e) => {
            let before = e.duration();
            -(before.as_secs() as i64 * 1000 + i64::from(before.subsec_millis()))
        }
    }
}

pub fn from_unix_millis(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.wrapping_neg() as u64)
    }
}
