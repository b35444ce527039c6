//! Lock store client: the primitives a single redis instance offers to the
//! quorum lock. Nothing else is stored through this client.
use std::time::Duration;

use failure::{Error as FailureError, Fail};
use r2d2::{Pool, PooledConnection};
use r2d2_redis::redis::{self, Script};
use r2d2_redis::RedisConnectionManager;

use errors::Error;

lazy_static! {
    static ref RELEASE_SCRIPT: Script = Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "
    );
    static ref EXTEND_SCRIPT: Script = Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
        "
    );
}

pub type LockStoreResult<T> = Result<T, FailureError>;

pub trait LockStore: Send + Sync {
    /// Human readable name of the instance for logs
    fn name(&self) -> &str;

    /// Sets `resource` to `token` if the resource is free
    fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> LockStoreResult<bool>;

    /// Deletes `resource` only if it is still owned by `token`
    fn release(&self, resource: &str, token: &str) -> LockStoreResult<bool>;

    /// Resets the ttl of `resource` only if it is still owned by `token`
    fn extend(&self, resource: &str, token: &str, ttl: Duration) -> LockStoreResult<bool>;
}

/// Lock store backed by one redis instance
pub struct RedisLockStore {
    name: String,
    pool: Pool<RedisConnectionManager>,
}

impl RedisLockStore {
    pub fn new(name: String, pool: Pool<RedisConnectionManager>) -> Self {
        Self { name, pool }
    }

    /// Creates a pool for `url` and checks the instance answers.
    pub fn connect(url: &str, pool_size: u32, connection_timeout: Duration) -> LockStoreResult<Self> {
        let manager = RedisConnectionManager::new(url).map_err(|e| e.context(format!("Invalid lock store url {}", url)))?;
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(connection_timeout)
            .build(manager)
            .map_err(|e| e.context(format!("Failed to create lock store pool for {}", url)))?;

        let store = RedisLockStore::new(url.to_string(), pool);
        {
            let mut conn = store.conn()?;
            redis::cmd("PING")
                .query::<String>(&mut *conn)
                .map_err(|e| e.context(format!("Lock store {} does not answer", url)))?;
        }
        Ok(store)
    }

    fn conn(&self) -> LockStoreResult<PooledConnection<RedisConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| e.context(format!("Lock store {} connection error", self.name)).context(Error::ServiceUnavailable).into())
    }
}

impl LockStore for RedisLockStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> LockStoreResult<bool> {
        let mut conn = self.conn()?;
        redis::cmd("SET")
            .arg(resource)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query::<Option<String>>(&mut *conn)
            .map(|reply| reply.is_some())
            .map_err(|e| e.context(format!("Lock store {}, acquire {} failed", self.name, resource)).into())
    }

    fn release(&self, resource: &str, token: &str) -> LockStoreResult<bool> {
        let mut conn = self.conn()?;
        RELEASE_SCRIPT
            .key(resource)
            .arg(token)
            .invoke::<i64>(&mut *conn)
            .map(|deleted| deleted == 1)
            .map_err(|e| e.context(format!("Lock store {}, release {} failed", self.name, resource)).into())
    }

    fn extend(&self, resource: &str, token: &str, ttl: Duration) -> LockStoreResult<bool> {
        let mut conn = self.conn()?;
        EXTEND_SCRIPT
            .key(resource)
            .arg(token)
            .arg(millis(ttl))
            .invoke::<i64>(&mut *conn)
            .map(|extended| extended == 1)
            .map_err(|e| e.context(format!("Lock store {}, extend {} failed", self.name, resource)).into())
    }
}

pub fn millis(duration: Duration) -> i64 {
    duration.as_secs() as i64 * 1000 + i64::from(duration.subsec_millis())
}
