//! Distributed locking: quorum lock over redis instances with release
//! notifications, used to serialize issuance and resync per coupon.
pub mod notify;
pub mod service;
pub mod store;

pub use self::notify::*;
pub use self::service::*;
pub use self::store::*;

use std::sync::{Arc, Mutex, MutexGuard};

use failure::Error as FailureError;
use r2d2::Pool;
use r2d2_redis::RedisConnectionManager;

use config::Config;

/// Creates the lock service on the redis instances from config
pub fn create_lock_service(config: &Config) -> Result<LockService, FailureError> {
    let instances = config
        .lock_instances()
        .iter()
        .map(|url| {
            RedisLockStore::connect(url, config.redis.pool_size, config.redis.connection_timeout())
                .map(|store| Arc::new(store) as Arc<LockStore>)
        }).collect::<Result<Vec<_>, _>>()?;

    let notify_url = config.lock_notify_url();
    let manager = RedisConnectionManager::new(notify_url.as_str())?;
    let pool = Pool::builder()
        .max_size(config.redis.pool_size)
        .connection_timeout(config.redis.connection_timeout())
        .build(manager)?;
    let bus = RedisReleaseBus::new(&notify_url, pool, config.lock.channel_prefix.clone())?;

    LockService::new(instances, Arc::new(bus), config.lock.clone())
}

pub(crate) fn unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{self, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use failure::{Error as FailureError, Fail};

    use config::LockConfig;
    use errors::Error;

    use super::*;

    /// Lock store instance in memory
    pub struct MemoryLockStore {
        name: String,
        entries: Mutex<HashMap<String, (String, Instant)>>,
        down: AtomicBool,
    }

    impl MemoryLockStore {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                entries: Mutex::new(HashMap::new()),
                down: AtomicBool::new(false),
            }
        }

        /// Current owner token of a live lock
        pub fn holder(&self, resource: &str) -> Option<String> {
            let now = Instant::now();
            unpoisoned(&self.entries)
                .get(resource)
                .filter(|(_, expires_at)| *expires_at > now)
                .map(|(token, _)| token.clone())
        }

        pub fn occupy(&self, resource: &str, token: &str, ttl: Duration) {
            unpoisoned(&self.entries).insert(resource.to_string(), (token.to_string(), Instant::now() + ttl));
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), FailureError> {
            if self.down.load(Ordering::SeqCst) {
                Err(format_err!("Lock store {} is down", self.name)
                    .context(Error::ServiceUnavailable)
                    .into())
            } else {
                Ok(())
            }
        }
    }

    impl LockStore for MemoryLockStore {
        fn name(&self) -> &str {
            &self.name
        }

        fn try_acquire(&self, resource: &str, token: &str, ttl: Duration) -> LockStoreResult<bool> {
            self.check()?;
            let now = Instant::now();
            let mut entries = unpoisoned(&self.entries);
            let free = entries.get(resource).map(|(_, expires_at)| *expires_at <= now).unwrap_or(true);
            if free {
                entries.insert(resource.to_string(), (token.to_string(), now + ttl));
            }
            Ok(free)
        }

        fn release(&self, resource: &str, token: &str) -> LockStoreResult<bool> {
            self.check()?;
            let mut entries = unpoisoned(&self.entries);
            let owned = entries.get(resource).map(|(owner, _)| owner == token).unwrap_or(false);
            if owned {
                entries.remove(resource);
            }
            Ok(owned)
        }

        fn extend(&self, resource: &str, token: &str, ttl: Duration) -> LockStoreResult<bool> {
            self.check()?;
            let now = Instant::now();
            let mut entries = unpoisoned(&self.entries);
            match entries.get_mut(resource) {
                Some(entry) if entry.0 == token && entry.1 > now => {
                    entry.1 = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    /// Release bus delivering to listeners of the same process
    #[derive(Default)]
    pub struct MemoryReleaseBus {
        listeners: Mutex<Vec<Sender<String>>>,
        published: AtomicUsize,
    }

    impl MemoryReleaseBus {
        pub fn published(&self) -> usize {
            self.published.load(Ordering::SeqCst)
        }
    }

    impl ReleaseBus for MemoryReleaseBus {
        fn publish(&self, resource: &str) -> Result<(), FailureError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            unpoisoned(&self.listeners).retain(|listener| listener.send(resource.to_string()).is_ok());
            Ok(())
        }

        fn listen(&self, on_release: &Fn(&str), shutdown: &AtomicBool) -> Result<(), FailureError> {
            let (tx, rx) = mpsc::channel();
            unpoisoned(&self.listeners).push(tx);
            while !shutdown.load(Ordering::SeqCst) {
                if let Ok(resource) = rx.recv_timeout(Duration::from_millis(10)) {
                    on_release(&resource);
                }
            }
            Ok(())
        }
    }

    pub fn test_lock_config() -> LockConfig {
        LockConfig {
            instances: vec![],
            notify_url: None,
            ttl_ms: 1_000,
            total_timeout_ms: 5_000,
            retry_delay_ms: 10,
            retry_jitter_ms: 10,
            wait_slice_ms: 500,
            drift_factor: 0.01,
            auto_extend: false,
            channel_prefix: "coupon-test:lock-released:".to_string(),
        }
    }

    pub fn memory_lock_service(instances: usize, config: LockConfig) -> (LockService, Vec<Arc<MemoryLockStore>>, Arc<MemoryReleaseBus>) {
        let stores = (0..instances)
            .map(|i| Arc::new(MemoryLockStore::new(&format!("memory-{}", i))))
            .collect::<Vec<_>>();
        let bus = Arc::new(MemoryReleaseBus::default());
        let service = LockService::new(
            stores.iter().map(|store| store.clone() as Arc<LockStore>).collect(),
            bus.clone(),
            config,
        ).unwrap();
        (service, stores, bus)
    }
}
