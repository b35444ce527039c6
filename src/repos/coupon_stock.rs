//! Coupon stock mirror in redis. `try_issue` and `rollback_issuance` are the
//! only delta mutations; the `sync_*` writes replace state and belong to the
//! stock synchronizer. The metadata hash is read by stock reports to check
//! the mirror against db; issuance validates coupons against db only.
use std::collections::HashMap;
use std::time::Duration;

use failure::{Error as FailureError, Fail};
use r2d2::{Pool, PooledConnection};
use r2d2_redis::redis::{self, Script};
use r2d2_redis::RedisConnectionManager;

use errors::Error;
use locks::millis;
use models::*;
use repos::types::RepoResult;

lazy_static! {
    static ref TRY_ISSUE_SCRIPT: Script = Script::new(
        r"
        if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
            return {2, 0}
        end
        local stock = redis.call('GET', KEYS[1])
        if not stock then
            return {3, 0}
        end
        if tonumber(stock) <= 0 then
            return {1, 0}
        end
        local remaining = redis.call('DECR', KEYS[1])
        if remaining < 0 then
            redis.call('INCR', KEYS[1])
            return {1, 0}
        end
        redis.call('SADD', KEYS[2], ARGV[1])
        if redis.call('PTTL', KEYS[2]) < 0 then
            local ttl = redis.call('PTTL', KEYS[1])
            if ttl > 0 then
                redis.call('PEXPIRE', KEYS[2], ttl)
            end
        end
        return {0, remaining}
        "
    );
    static ref ROLLBACK_SCRIPT: Script = Script::new(
        r"
        if redis.call('SREM', KEYS[2], ARGV[1]) == 1 then
            if redis.call('EXISTS', KEYS[1]) == 1 then
                redis.call('INCR', KEYS[1])
            end
            return 1
        end
        return 0
        "
    );
}

const ISSUE_SUCCESS: i64 = 0;
const ISSUE_OUT_OF_STOCK: i64 = 1;
const ISSUE_ALREADY_ISSUED: i64 = 2;
const ISSUE_NOT_FOUND: i64 = 3;

pub trait CouponStockStore: Send + Sync {
    /// Atomically takes one unit of stock for the user. Call under the coupon lock.
    fn try_issue(&self, coupon_id: CouponId, user_id: UserId) -> RepoResult<IssueOutcome>;

    /// Inverse of a successful `try_issue`. Returns `false` when there was nothing to undo.
    fn rollback_issuance(&self, coupon_id: CouponId, user_id: UserId) -> RepoResult<bool>;

    /// Replaces the stock counter
    fn sync_stock(&self, coupon_id: CouponId, remaining: i64, ttl: Duration) -> RepoResult<()>;

    /// Replaces the issued users set
    fn sync_issued_users(&self, coupon_id: CouponId, user_ids: &[UserId], ttl: Duration) -> RepoResult<()>;

    /// Replaces the metadata hash
    fn cache_metadata(&self, metadata: &CouponStockMetadata, ttl: Duration) -> RepoResult<()>;

    fn stock_exists(&self, coupon_id: CouponId) -> RepoResult<bool>;

    fn remaining_stock(&self, coupon_id: CouponId) -> RepoResult<Option<i64>>;

    fn is_issued(&self, coupon_id: CouponId, user_id: UserId) -> RepoResult<bool>;

    fn issued_users_count(&self, coupon_id: CouponId) -> RepoResult<usize>;

    fn get_metadata(&self, coupon_id: CouponId) -> RepoResult<Option<CouponStockMetadata>>;

    /// Drops the whole mirror of the coupon
    fn evict(&self, coupon_id: CouponId) -> RepoResult<()>;
}

/// Stock mirror on a redis pool
pub struct RedisCouponStockStore {
    pool: Pool<RedisConnectionManager>,
    key_prefix: String,
}

impl RedisCouponStockStore {
    pub fn new(pool: Pool<RedisConnectionManager>, key_prefix: String) -> Self {
        Self { pool, key_prefix }
    }

    pub fn stock_key(&self, coupon_id: CouponId) -> String {
        format!("{}:stock:{}", self.key_prefix, coupon_id)
    }

    pub fn issued_key(&self, coupon_id: CouponId) -> String {
        format!("{}:issued:{}", self.key_prefix, coupon_id)
    }

    pub fn meta_key(&self, coupon_id: CouponId) -> String {
        format!("{}:meta:{}", self.key_prefix, coupon_id)
    }

    fn conn(&self) -> RepoResult<PooledConnection<RedisConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| unavailable(e, "Stock cache connection error".to_string()))
    }
}

impl CouponStockStore for RedisCouponStockStore {
    fn try_issue(&self, coupon_id: CouponId, user_id: UserId) -> RepoResult<IssueOutcome> {
        debug!("Try issue coupon {} to user {} in cache.", coupon_id, user_id);
        let mut conn = self.conn()?;
        let reply = TRY_ISSUE_SCRIPT
            .key(self.stock_key(coupon_id))
            .key(self.issued_key(coupon_id))
            .arg(user_id.0)
            .invoke::<(i64, i64)>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Try issue coupon: {} to user: {} error occurred", coupon_id, user_id)))?;

        match reply {
            (ISSUE_SUCCESS, remaining) => Ok(IssueOutcome::Success { remaining }),
            (ISSUE_OUT_OF_STOCK, _) => Ok(IssueOutcome::OutOfStock),
            (ISSUE_ALREADY_ISSUED, _) => Ok(IssueOutcome::AlreadyIssued),
            (ISSUE_NOT_FOUND, _) => Ok(IssueOutcome::NotFound),
            (code, _) => Err(format_err!("Unexpected issue script reply {} for coupon {}", code, coupon_id)),
        }
    }

    fn rollback_issuance(&self, coupon_id: CouponId, user_id: UserId) -> RepoResult<bool> {
        debug!("Roll back issuance of coupon {} to user {} in cache.", coupon_id, user_id);
        let mut conn = self.conn()?;
        ROLLBACK_SCRIPT
            .key(self.stock_key(coupon_id))
            .key(self.issued_key(coupon_id))
            .arg(user_id.0)
            .invoke::<i64>(&mut *conn)
            .map(|undone| undone == 1)
            .map_err(|e| unavailable(e, format!("Roll back coupon: {} of user: {} error occurred", coupon_id, user_id)))
    }

    fn sync_stock(&self, coupon_id: CouponId, remaining: i64, ttl: Duration) -> RepoResult<()> {
        debug!("Sync stock of coupon {} to {}.", coupon_id, remaining);
        let mut conn = self.conn()?;
        redis::cmd("SET")
            .arg(self.stock_key(coupon_id))
            .arg(remaining)
            .arg("PX")
            .arg(millis(ttl))
            .query::<()>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Sync stock of coupon: {} error occurred", coupon_id)))
    }

    fn sync_issued_users(&self, coupon_id: CouponId, user_ids: &[UserId], ttl: Duration) -> RepoResult<()> {
        debug!("Sync {} issued users of coupon {}.", user_ids.len(), coupon_id);
        let key = self.issued_key(coupon_id);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(&key).ignore();
        if !user_ids.is_empty() {
            let ids = user_ids.iter().map(|id| id.0).collect::<Vec<i32>>();
            pipe.cmd("SADD").arg(&key).arg(ids).ignore();
            pipe.cmd("PEXPIRE").arg(&key).arg(millis(ttl)).ignore();
        }

        let mut conn = self.conn()?;
        pipe.query::<()>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Sync issued users of coupon: {} error occurred", coupon_id)))
    }

    fn cache_metadata(&self, metadata: &CouponStockMetadata, ttl: Duration) -> RepoResult<()> {
        debug!("Cache metadata {:?}.", metadata);
        let key = self.meta_key(metadata.coupon_id);
        let mut conn = self.conn()?;
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("HMSET")
            .arg(&key)
            .arg("is_active")
            .arg(if metadata.is_active { 1 } else { 0 })
            .arg("valid_from")
            .arg(to_unix_millis(metadata.valid_from))
            .arg("valid_until")
            .arg(to_unix_millis(metadata.valid_until))
            .arg("issue_limit")
            .arg(metadata.issue_limit)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(millis(ttl))
            .ignore()
            .query::<()>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Cache metadata of coupon: {} error occurred", metadata.coupon_id)))
    }

    fn stock_exists(&self, coupon_id: CouponId) -> RepoResult<bool> {
        let mut conn = self.conn()?;
        redis::cmd("EXISTS")
            .arg(self.stock_key(coupon_id))
            .query::<bool>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Check stock of coupon: {} error occurred", coupon_id)))
    }

    fn remaining_stock(&self, coupon_id: CouponId) -> RepoResult<Option<i64>> {
        let mut conn = self.conn()?;
        redis::cmd("GET")
            .arg(self.stock_key(coupon_id))
            .query::<Option<i64>>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Get stock of coupon: {} error occurred", coupon_id)))
    }

    fn is_issued(&self, coupon_id: CouponId, user_id: UserId) -> RepoResult<bool> {
        let mut conn = self.conn()?;
        redis::cmd("SISMEMBER")
            .arg(self.issued_key(coupon_id))
            .arg(user_id.0)
            .query::<bool>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Check user: {} of coupon: {} error occurred", user_id, coupon_id)))
    }

    fn issued_users_count(&self, coupon_id: CouponId) -> RepoResult<usize> {
        let mut conn = self.conn()?;
        redis::cmd("SCARD")
            .arg(self.issued_key(coupon_id))
            .query::<usize>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Count issued users of coupon: {} error occurred", coupon_id)))
    }

    fn get_metadata(&self, coupon_id: CouponId) -> RepoResult<Option<CouponStockMetadata>> {
        let mut conn = self.conn()?;
        let fields = redis::cmd("HGETALL")
            .arg(self.meta_key(coupon_id))
            .query::<HashMap<String, i64>>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Get metadata of coupon: {} error occurred", coupon_id)))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| format_err!("Metadata of coupon {} has no field {}", coupon_id, name))
        };

        Ok(Some(CouponStockMetadata {
            coupon_id,
            is_active: field("is_active")? == 1,
            valid_from: from_unix_millis(field("valid_from")?),
            valid_until: from_unix_millis(field("valid_until")?),
            issue_limit: field("issue_limit")? as i32,
        }))
    }

    fn evict(&self, coupon_id: CouponId) -> RepoResult<()> {
        debug!("Evict cache of coupon {}.", coupon_id);
        let mut conn = self.conn()?;
        redis::cmd("DEL")
            .arg(self.stock_key(coupon_id))
            .arg(self.issued_key(coupon_id))
            .arg(self.meta_key(coupon_id))
            .query::<()>(&mut *conn)
            .map_err(|e| unavailable(e, format!("Evict cache of coupon: {} error occurred", coupon_id)))
    }
}

fn unavailable<E: Fail>(e: E, message: String) -> FailureError {
    e.context(message).context(Error::ServiceUnavailable).into()
}
