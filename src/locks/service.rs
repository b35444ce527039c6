//! Quorum (redlock) mutual exclusion over one or more lock store instances.
//!
//! A failed acquisition does not spin: the caller parks on the resource's
//! release notification for at most one wait slice and retries when woken,
//! until the total timeout runs out. Locks are released on every exit path
//! of the critical section through `LockGuard`.
use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use failure::{Error as FailureError, Fail};
use rand::{self, Rng};
use uuid::Uuid;

use config::LockConfig;
use errors::Error;

use super::notify::{ReleaseBus, Waiters};
use super::store::{millis, LockStore};
use super::unpoisoned;

const RESUBSCRIBE_DELAY_MS: u64 = 1000;

/// Lock held on a quorum of instances
#[derive(Debug, Clone)]
pub struct Lock {
    pub resource: String,
    pub token: String,
    /// Time the lock is guaranteed to be held, counted from `acquired_at`
    pub validity: Duration,
    pub acquired_at: Instant,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

struct InFlightToken(Arc<InFlight>);

impl InFlightToken {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        *unpoisoned(&in_flight.count) += 1;
        InFlightToken(in_flight.clone())
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        let mut count = unpoisoned(&self.0.count);
        *count -= 1;
        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

pub struct LockService {
    instances: Arc<Vec<Arc<LockStore>>>,
    quorum: usize,
    bus: Arc<ReleaseBus>,
    waiters: Arc<Waiters>,
    config: LockConfig,
    in_flight: Arc<InFlight>,
    draining: AtomicBool,
    shutdown: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl LockService {
    /// Creates the service and starts listening for release notifications
    pub fn new(instances: Vec<Arc<LockStore>>, bus: Arc<ReleaseBus>, config: LockConfig) -> Result<Self, FailureError> {
        if instances.is_empty() {
            return Err(format_err!("Lock service needs at least one lock store instance"));
        }

        let quorum = instances.len() / 2 + 1;
        let waiters = Arc::new(Waiters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let listener = spawn_listener(bus.clone(), waiters.clone(), shutdown.clone())?;

        info!(
            "Lock service started with {} instance(s), quorum {}",
            instances.len(),
            quorum
        );

        Ok(Self {
            instances: Arc::new(instances),
            quorum,
            bus,
            waiters,
            config,
            in_flight: Arc::new(InFlight::default()),
            draining: AtomicBool::new(false),
            shutdown,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Runs `f` while holding `resource`.
    /// Fails with `LockTimeout` when the lock is not acquired within `total_timeout`.
    pub fn with_lock<R, F>(&self, resource: &str, ttl: Duration, total_timeout: Duration, f: F) -> Result<R, FailureError>
    where
        F: FnOnce() -> Result<R, FailureError>,
    {
        let _guard = self.lock(resource, ttl, total_timeout)?;
        f()
    }

    /// `with_lock` with the configured ttl and total timeout
    pub fn with_default_lock<R, F>(&self, resource: &str, f: F) -> Result<R, FailureError>
    where
        F: FnOnce() -> Result<R, FailureError>,
    {
        let ttl = self.config.ttl();
        let total_timeout = self.config.total_timeout();
        self.with_lock(resource, ttl, total_timeout, f)
    }

    /// Acquires `resource`, the lock is released when the guard is dropped
    pub fn lock(&self, resource: &str, ttl: Duration, total_timeout: Duration) -> Result<LockGuard, FailureError> {
        let in_flight = InFlightToken::enter(&self.in_flight);
        if self.draining.load(Ordering::SeqCst) {
            return Err(format_err!("Lock service is shutting down, lock {} rejected", resource)
                .context(Error::ServiceUnavailable)
                .into());
        }

        let lock = self.acquire(resource, ttl, total_timeout)?;
        let extender = if self.config.auto_extend {
            self.spawn_extender(&lock, ttl)
        } else {
            None
        };

        Ok(LockGuard {
            service: self,
            lock,
            extender,
            _in_flight: in_flight,
        })
    }

    fn acquire(&self, resource: &str, ttl: Duration, total_timeout: Duration) -> Result<Lock, FailureError> {
        let deadline = Instant::now() + total_timeout;
        let mut attempts = 0;
        let mut contended = false;
        let mut last_error = None;

        loop {
            // registered before the attempt, so a release right after it still wakes us
            let ticket = self.waiters.ticket(resource);
            attempts += 1;

            let failed = match self.try_lock(resource, ttl) {
                Ok(Some(lock)) => {
                    debug!("Lock {} acquired after {} attempt(s).", resource, attempts);
                    return Ok(lock);
                }
                Ok(None) => {
                    contended = true;
                    false
                }
                Err(e) => {
                    warn!("Lock {} attempt {} failed: {}", resource, attempts, e);
                    last_error = Some(e);
                    true
                }
            };

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;

            if failed {
                thread::sleep(cmp::min(self.retry_backoff(), remaining));
            } else {
                ticket.wait(cmp::min(self.config.wait_slice(), remaining));
            }
        }

        match last_error {
            Some(e) if !contended => Err(e
                .context(format!("Lock store unavailable while acquiring {}", resource))
                .context(Error::ServiceUnavailable)
                .into()),
            _ => Err(format_err!(
                "Lock {} not acquired within {:?} after {} attempt(s)",
                resource,
                total_timeout,
                attempts
            ).context(Error::LockTimeout)
            .into()),
        }
    }

    /// One redlock round. `Ok(None)` means the resource is held by someone else.
    fn try_lock(&self, resource: &str, ttl: Duration) -> Result<Option<Lock>, FailureError> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut acquired = 0;
        let mut failed = 0;
        let mut last_error = None;

        for instance in self.instances.iter() {
            match instance.try_acquire(resource, &token, ttl) {
                Ok(true) => acquired += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!("Lock store {} refused {}: {}", instance.name(), resource, e);
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        let validity = ttl
            .checked_sub(started.elapsed())
            .and_then(|rest| rest.checked_sub(self.drift(ttl)))
            .unwrap_or_else(|| Duration::from_millis(0));

        if acquired >= self.quorum && validity > Duration::from_millis(0) {
            return Ok(Some(Lock {
                resource: resource.to_string(),
                token,
                validity,
                acquired_at: started,
            }));
        }

        if acquired > 0 {
            self.release_everywhere(resource, &token);
        }

        match last_error {
            Some(e) if self.instances.len() - failed < self.quorum => Err(e),
            _ => Ok(None),
        }
    }

    fn drift(&self, ttl: Duration) -> Duration {
        let drift_ms = (millis(ttl) as f64 * self.config.drift_factor) as u64;
        Duration::from_millis(drift_ms + 2)
    }

    fn retry_backoff(&self) -> Duration {
        let jitter = if self.config.retry_jitter_ms > 0 {
            rand::thread_rng().gen_range(0, self.config.retry_jitter_ms)
        } else {
            0
        };
        self.config.retry_delay() + Duration::from_millis(jitter)
    }

    fn release_everywhere(&self, resource: &str, token: &str) -> usize {
        self.instances
            .iter()
            .filter(|instance| match instance.release(resource, token) {
                Ok(released) => released,
                Err(e) => {
                    warn!("Lock store {} failed to release {}: {}", instance.name(), resource, e);
                    false
                }
            }).count()
    }

    fn unlock(&self, lock: &Lock) {
        let released = self.release_everywhere(&lock.resource, &lock.token);
        if released < self.quorum {
            warn!(
                "Lock {} was released on {} instance(s) only, the rest expire by ttl.",
                lock.resource, released
            );
        }

        self.waiters.notify(&lock.resource);
        if let Err(e) = self.bus.publish(&lock.resource) {
            warn!("Release notification for {} was not published: {}", lock.resource, e);
        }
        debug!("Lock {} released.", lock.resource);
    }

    fn spawn_extender(&self, lock: &Lock, ttl: Duration) -> Option<Extender> {
        let (stop, stopped) = mpsc::channel::<()>();
        let instances = self.instances.clone();
        let quorum = self.quorum;
        let resource = lock.resource.clone();
        let token = lock.token.clone();
        let period = ttl / 2;

        let spawned = thread::Builder::new().name("lock-extender".to_string()).spawn(move || loop {
            match stopped.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {
                    let extended = instances
                        .iter()
                        .filter(|instance| instance.extend(&resource, &token, ttl).unwrap_or(false))
                        .count();
                    if extended < quorum {
                        error!("Lock {} lost while its critical section is still running.", resource);
                        break;
                    }
                    debug!("Lock {} extended by {:?}.", resource, ttl);
                }
                _ => break,
            }
        });

        match spawned {
            Ok(handle) => Some(Extender {
                stop,
                handle: Some(handle),
            }),
            Err(e) => {
                warn!("Lock extender for {} not started: {}", lock.resource, e);
                None
            }
        }
    }

    /// Stops accepting lock calls, waits for in-flight ones and stops the
    /// release listener. Returns `false` if calls were still running after
    /// `drain_timeout`.
    pub fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + drain_timeout;
        let drained = {
            let mut count = unpoisoned(&self.in_flight.count);
            loop {
                let now = Instant::now();
                if *count == 0 || now >= deadline {
                    break;
                }
                count = match self.in_flight.drained.wait_timeout(count, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            if *count > 0 {
                warn!("{} lock call(s) still in flight after {:?}.", *count, drain_timeout);
            }
            *count == 0
        };

        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(listener) = unpoisoned(&self.listener).take() {
            if listener.join().is_err() {
                error!("Lock release listener panicked.");
            }
        }
        info!("Lock service stopped.");
        drained
    }
}

impl Drop for LockService {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn spawn_listener(bus: Arc<ReleaseBus>, waiters: Arc<Waiters>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>, FailureError> {
    thread::Builder::new()
        .name("lock-release-listener".to_string())
        .spawn(move || {
            let on_release = |resource: &str| waiters.notify(resource);
            while !shutdown.load(Ordering::SeqCst) {
                if let Err(e) = bus.listen(&on_release, &shutdown) {
                    warn!("Lock release listener failed, resubscribing: {}", e);
                    thread::sleep(Duration::from_millis(RESUBSCRIBE_DELAY_MS));
                }
            }
        }).map_err(|e| e.context("Failed to start lock release listener").into())
}

struct Extender {
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Extender {
    fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Held lock, released on drop
pub struct LockGuard<'a> {
    service: &'a LockService,
    lock: Lock,
    extender: Option<Extender>,
    _in_flight: InFlightToken,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        match self.extender.take() {
            Some(mut extender) => extender.stop(),
            None => {
                if self.lock.acquired_at.elapsed() > self.lock.validity {
                    warn!("Critical section of {} outlived the lock validity.", self.lock.resource);
                }
            }
        }
        self.service.unlock(&self.lock);
    }
}
