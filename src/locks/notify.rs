//! Release notifications. A lock holder publishes on `{prefix}{resource}`
//! after releasing, and every lock service instance wakes its local waiters
//! for that resource instead of letting them sleep out their wait slice.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use failure::{Error as FailureError, Fail};
use r2d2::Pool;
use r2d2_redis::redis::{self, Client};
use r2d2_redis::RedisConnectionManager;

use super::unpoisoned;

pub trait ReleaseBus: Send + Sync {
    /// Announces that `resource` has been released
    fn publish(&self, resource: &str) -> Result<(), FailureError>;

    /// Blocks calling `on_release` for every released resource until
    /// `shutdown` is raised. Returns an error when the subscription breaks.
    fn listen(&self, on_release: &Fn(&str), shutdown: &AtomicBool) -> Result<(), FailureError>;
}

/// Release bus on redis pub/sub
pub struct RedisReleaseBus {
    client: Client,
    pool: Pool<RedisConnectionManager>,
    channel_prefix: String,
    poll_interval: Duration,
}

impl RedisReleaseBus {
    pub fn new(url: &str, pool: Pool<RedisConnectionManager>, channel_prefix: String) -> Result<Self, FailureError> {
        let client = Client::open(url).map_err(|e| e.context(format!("Invalid release bus url {}", url)))?;
        Ok(Self {
            client,
            pool,
            channel_prefix,
            poll_interval: Duration::from_millis(500),
        })
    }
}

impl ReleaseBus for RedisReleaseBus {
    fn publish(&self, resource: &str) -> Result<(), FailureError> {
        let mut conn = self.pool.get()?;
        redis::cmd("PUBLISH")
            .arg(format!("{}{}", self.channel_prefix, resource))
            .arg(resource)
            .query::<i64>(&mut *conn)
            .map(|_| ())
            .map_err(|e| e.context(format!("Publish release of {} failed", resource)).into())
    }

    fn listen(&self, on_release: &Fn(&str), shutdown: &AtomicBool) -> Result<(), FailureError> {
        let mut conn = self.client.get_connection()?;
        let mut pubsub = conn.as_pubsub();
        pubsub.psubscribe(format!("{}*", self.channel_prefix))?;
        pubsub.set_read_timeout(Some(self.poll_interval))?;
        debug!("Subscribed to lock release channels {}*", self.channel_prefix);

        while !shutdown.load(Ordering::SeqCst) {
            match pubsub.get_message() {
                Ok(msg) => {
                    let channel = msg.get_channel_name();
                    if channel.starts_with(&self.channel_prefix) {
                        on_release(&channel[self.channel_prefix.len()..]);
                    }
                }
                Err(ref e) if e.is_timeout() => continue,
                Err(e) => return Err(e.context("Lock release subscription broke").into()),
            }
        }
        Ok(())
    }
}

struct Slot {
    generation: Mutex<u64>,
    released: Condvar,
}

/// Per resource waiter registry owned by one lock service.
#[derive(Default)]
pub struct Waiters {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Waiters {
    /// Registers interest in the next release of `resource`. Must be taken
    /// before an acquisition attempt, so a release that happens between the
    /// failed attempt and the wait is not missed.
    pub fn ticket(&self, resource: &str) -> Ticket {
        let slot = {
            let mut slots = unpoisoned(&self.slots);
            slots
                .entry(resource.to_string())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        generation: Mutex::new(0),
                        released: Condvar::new(),
                    })
                }).clone()
        };
        let seen = *unpoisoned(&slot.generation);
        Ticket {
            waiters: self,
            resource: resource.to_string(),
            slot,
            seen,
        }
    }

    /// Wakes every waiter of `resource`
    pub fn notify(&self, resource: &str) {
        let slot = unpoisoned(&self.slots).get(resource).cloned();
        if let Some(slot) = slot {
            let mut generation = unpoisoned(&slot.generation);
            *generation = generation.wrapping_add(1);
            slot.released.notify_all();
        }
    }

    /// Number of resources somebody is waiting for
    pub fn len(&self) -> usize {
        unpoisoned(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, resource: &str, slot: &Arc<Slot>) {
        let mut slots = unpoisoned(&self.slots);
        // the map and the dropping ticket are the last two owners
        let unused = slots
            .get(resource)
            .map(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) <= 2)
            .unwrap_or(false);
        if unused {
            slots.remove(resource);
        }
    }
}

pub struct Ticket<'a> {
    waiters: &'a Waiters,
    resource: String,
    slot: Arc<Slot>,
    seen: u64,
}

impl<'a> Ticket<'a> {
    /// Waits for a release newer than the ticket, at most `timeout`.
    /// Returns `true` when woken by a release.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = unpoisoned(&self.slot.generation);
        while *generation == self.seen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            generation = match self.slot.released.wait_timeout(generation, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl<'a> Drop for Ticket<'a> {
    fn drop(&mut self) {
        self.waiters.forget(&self.resource, &self.slot);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn notify_wakes_waiter() {
        let waiters = Arc::new(Waiters::default());
        let ticket_waiters = waiters.clone();
        let handle = thread::spawn(move || {
            let ticket = ticket_waiters.ticket("coupon:lock:1");
            let started = Instant::now();
            let woken = ticket.wait(Duration::from_secs(5));
            (woken, started.elapsed())
        });

        while waiters.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        waiters.notify("coupon:lock:1");

        let (woken, elapsed) = handle.join().unwrap();
        assert!(woken);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn release_before_wait_is_not_lost() {
        let waiters = Waiters::default();
        let ticket = waiters.ticket("coupon:lock:2");
        waiters.notify("coupon:lock:2");
        assert!(ticket.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wait_times_out_without_release() {
        let waiters = Waiters::default();
        let ticket = waiters.ticket("coupon:lock:3");
        waiters.notify("coupon:lock:4");
        assert!(!ticket.wait(Duration::from_millis(20)));
    }

    #[test]
    fn slots_are_dropped_with_last_ticket() {
        let waiters = Waiters::default();
        {
            let _first = waiters.ticket("coupon:lock:5");
            let _second = waiters.ticket("coupon:lock:5");
            assert_eq!(waiters.len(), 1);
        }
        assert!(waiters.is_empty());
    }
}
