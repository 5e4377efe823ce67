//! Admission control for device claims

use async_trait::async_trait;
use cogs_core::{BrokerConfig, Claim, CogsError, CogsResult, Device, Subscriber};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::placement::{LowestNumberFirst, PlacementStrategy};
use crate::store::StateStore;

/// How long a claim may wait for devices
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wait {
    /// Fail at once if the devices are not free
    Immediate,
    /// Wait up to the given duration
    For(Duration),
    /// Wait until the devices become free
    Forever,
}

impl Wait {
    /// Interpret a client timeout in seconds
    ///
    /// Zero never blocks, a negative value waits forever.
    pub fn from_secs(secs: f64) -> Self {
        if secs.is_nan() || secs == 0.0 {
            return Wait::Immediate;
        }
        if secs < 0.0 {
            return Wait::Forever;
        }
        Duration::try_from_secs_f64(secs)
            .map(Wait::For)
            .unwrap_or(Wait::Forever)
    }
}

/// Keeps the waiter count accurate however a claim ends
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Broker granting exclusive device claims
pub struct ClaimBroker {
    /// Shared state
    store: Arc<StateStore>,
    /// Device selection
    placement: Arc<dyn PlacementStrategy>,
    /// Wakes suspended claims
    notify: Notify,
    /// Claims currently inside `claim`
    waiters: AtomicUsize,
    /// Re-check interval while waiting
    poll_interval: Duration,
    /// Time an unused claim is kept, `None` to keep it forever
    claim_grace: Option<Duration>,
}

impl ClaimBroker {
    /// Create a new broker
    pub fn new(store: Arc<StateStore>, config: &BrokerConfig) -> Self {
        let claim_grace =
            (config.claim_grace_secs > 0).then(|| Duration::from_secs(config.claim_grace_secs));

        info!(
            poll_interval_ms = config.poll_interval_ms,
            claim_grace_secs = config.claim_grace_secs,
            "Claim broker initialized"
        );

        Self {
            store,
            placement: Arc::new(LowestNumberFirst),
            notify: Notify::new(),
            waiters: AtomicUsize::new(0),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            claim_grace,
        }
    }

    /// Replace the placement strategy
    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Number of claims currently waiting or being decided
    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Wake every suspended claim so it re-checks the free devices
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Reserve `count` devices for `owner`
    ///
    /// Returns the granted devices in ascending number order. Dropping the
    /// returned future abandons the wait without reserving anything.
    pub async fn claim(&self, count: u32, wait: Wait, owner: &str) -> CogsResult<Vec<Device>> {
        if count == 0 {
            return Err(CogsError::InvalidRequest(
                "at least one device must be requested".to_string(),
            ));
        }

        let total = self.store.device_count().await;
        if count as usize > total {
            return Err(CogsError::ResourceExhausted(format!(
                "requested {} devices, node has {}",
                count, total
            )));
        }

        let _guard = WaiterGuard::register(&self.waiters);
        let deadline = match wait {
            Wait::For(timeout) => Instant::now().checked_add(timeout),
            Wait::Immediate | Wait::Forever => None,
        };

        debug!(owner = %owner, count = count, wait = ?wait, "Claim requested");

        loop {
            // Arm before checking so a release in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let available = match self.try_reserve(count, owner).await {
                Ok(devices) => return Ok(devices),
                Err(available) => available,
            };

            if wait == Wait::Immediate {
                return Err(CogsError::Timeout {
                    requested: count,
                    available,
                });
            }

            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = expiry => {
                    return self
                        .try_reserve(count, owner)
                        .await
                        .map_err(|available| {
                            info!(owner = %owner, count = count, available = available, "Claim timed out");
                            CogsError::Timeout { requested: count, available }
                        });
                }
            }
        }
    }

    /// Grant `count` free devices in one critical section
    ///
    /// On shortage returns the number of free devices.
    async fn try_reserve(&self, count: u32, owner: &str) -> Result<Vec<Device>, u32> {
        let placement = self.placement.clone();

        let result = self
            .store
            .with_claims(|book| {
                let free = book.free_numbers();
                let Some(numbers) = placement.place(count as usize, &free) else {
                    return Err(free.len() as u32);
                };

                let mut devices = Vec::with_capacity(numbers.len());
                for number in numbers {
                    if book.set_claim(number, Some(owner)) {
                        if let Some(device) = book.device(number) {
                            devices.push(device.clone());
                        }
                    }
                }
                devices.sort_by_key(|d| d.number);
                Ok(devices)
            })
            .await;

        if let Ok(devices) = &result {
            let numbers: Vec<u32> = devices.iter().map(|d| d.number).collect();
            info!(owner = %owner, devices = ?numbers, "Claim granted");
        }
        result
    }

    /// Release claims held by `owner`
    ///
    /// Fails without releasing anything if a number is unknown or claimed
    /// by someone else. Unclaimed devices are skipped. Returns the released
    /// numbers.
    pub async fn release(&self, numbers: &[u32], owner: &str) -> CogsResult<Vec<u32>> {
        let released = self
            .store
            .with_claims(|book| {
                for &number in numbers {
                    match book.claim(number) {
                        None => return Err(CogsError::DeviceNotFound(number)),
                        Some(claim) if !claim.is_free() && claim.user != owner => {
                            return Err(CogsError::PermissionDenied(format!(
                                "device {} is claimed by {}",
                                number, claim.user
                            )));
                        }
                        Some(_) => {}
                    }
                }

                let mut released = Vec::new();
                for &number in numbers {
                    let held = book.claim(number).map(|c| !c.is_free()).unwrap_or(false);
                    if held && book.set_claim(number, None) {
                        released.push(number);
                    }
                }
                Ok(released)
            })
            .await?;

        if !released.is_empty() {
            info!(owner = %owner, devices = ?released, "Claims released");
            self.wake();
        }
        Ok(released)
    }

    /// Release claims that never became occupied within the grace period
    pub async fn sweep(&self) -> Vec<u32> {
        let Some(grace) = self.claim_grace else {
            return Vec::new();
        };

        let released = self
            .store
            .with_claims(|book| {
                let now = book.now();
                let stale: Vec<(u32, String)> = book
                    .claims()
                    .filter(|(_, claim)| !claim.is_free() && !claim.occupied)
                    .filter(|(_, claim)| {
                        claim
                            .claimed_at
                            .and_then(|at| (now - at).to_std().ok())
                            .map(|age| age >= grace)
                            .unwrap_or(false)
                    })
                    .map(|(number, claim)| (number, claim.user.clone()))
                    .collect();

                for (number, user) in &stale {
                    warn!(device = number, user = %user, "Releasing claim unused within grace period");
                    book.set_claim(*number, None);
                }
                stale.into_iter().map(|(number, _)| number).collect::<Vec<_>>()
            })
            .await;

        if !released.is_empty() {
            self.wake();
        }
        released
    }

    /// Run `sweep` periodically until shutdown
    ///
    /// Returns `None` when the grace period is disabled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let grace = self.claim_grace?;
        let period = (grace / 4).clamp(Duration::from_secs(1), Duration::from_secs(30));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Claim sweeper stopping");
                        break;
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl Subscriber<Device> for ClaimBroker {
    async fn handle(&self, _event: &Device) {
        self.wake();
    }
}

#[async_trait]
impl Subscriber<Claim> for ClaimBroker {
    async fn handle(&self, event: &Claim) {
        let number = event.device_number;

        let released = self
            .store
            .with_claims(|book| {
                if !event.is_vacant() {
                    if book.mark_occupied(number, event.pid) {
                        debug!(device = number, pid = event.pid, "Claim occupied");
                    }
                    return None;
                }

                match book.claim(number) {
                    Some(claim) if !claim.is_free() && claim.occupied => {
                        let user = claim.user.clone();
                        book.set_claim(number, None);
                        Some(user)
                    }
                    _ => None,
                }
            })
            .await;

        if let Some(user) = released {
            info!(device = number, user = %user, "Claim released, device idle");
        }
        self.wake();
    }
}
