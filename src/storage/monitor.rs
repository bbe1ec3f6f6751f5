//! Per-domain monitor tasks and the pool that owns them.
//!
//! Each monitored domain gets a long-lived thread that periodically probes
//! the domain, tracks validity transitions, publishes state-change events
//! and cooperatively manages the host-id lease. Probe failures never kill a
//! task; only the stop signal does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};
use log::{debug, error, info, warn};
use uuid::Uuid;

use vhostd_api::config::AgentConfig;
use vhostd_api::status::DomainMonitorStatus;

use crate::storage::domain::{DomainCache, StorageDomain};
use crate::storage::event::DomainStateChangeEvent;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Interruptible stop signal: waiting on it ends early when it is set.
#[derive(Default)]
pub struct StopEvent {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl StopEvent {
    pub fn set(&self) {
        *self.flag.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Waits up to `timeout`; returns true if the signal was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(flag, deadline - now).unwrap();
            flag = guard;
        }
        true
    }
}

/// State shared between a monitor task and the pool.
struct MonitorShared {
    sd_uuid: Uuid,
    host_id: u32,
    pool_domain: AtomicBool,
    stop: StopEvent,
    /// Replaced wholesale at the end of every tick; readers always see a
    /// fully committed record.
    status: Mutex<DomainMonitorStatus>,
}

struct MonitorHandle {
    shared: Arc<MonitorShared>,
    thread: Option<JoinHandle<()>>,
}

struct PoolInner {
    cache: Arc<dyn DomainCache>,
    interval: Duration,
    refresh_time: Duration,
    domains: Mutex<BTreeMap<Uuid, MonitorHandle>>,
    on_domain_state_change: DomainStateChangeEvent,
}

pub struct DomainMonitor {
    inner: Arc<PoolInner>,
}

impl DomainMonitor {
    pub fn new(cache: Arc<dyn DomainCache>, interval: Duration, refresh_time: Duration) -> Self {
        DomainMonitor {
            inner: Arc::new(PoolInner {
                cache,
                interval,
                refresh_time,
                domains: Mutex::new(BTreeMap::new()),
                on_domain_state_change: DomainStateChangeEvent::new(
                    "Storage.DomainMonitor.onDomainStateChange",
                ),
            }),
        }
    }

    pub fn from_config(cache: Arc<dyn DomainCache>, config: &AgentConfig) -> Self {
        DomainMonitor::new(
            cache,
            config.sd_health_check_delay,
            config.repo_stats_cache_refresh_timeout,
        )
    }

    pub fn on_domain_state_change(&self) -> &DomainStateChangeEvent {
        &self.inner.on_domain_state_change
    }

    pub fn monitored_domains(&self) -> Vec<Uuid> {
        self.inner.domains.lock().unwrap().keys().copied().collect()
    }

    pub fn pool_monitored_domains(&self) -> Vec<Uuid> {
        self.inner
            .domains
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, handle)| handle.shared.pool_domain.load(Ordering::SeqCst))
            .map(|(sd_uuid, _)| *sd_uuid)
            .collect()
    }

    /// Starts monitoring a domain. Idempotent: a second call only ORs the
    /// `pool_domain` flag into the existing monitor.
    pub fn start_monitoring(
        &self,
        sd_uuid: Uuid,
        host_id: u32,
        pool_domain: bool,
    ) -> Result<(), Error> {
        let mut domains = self.inner.domains.lock().unwrap();
        if let Some(handle) = domains.get(&sd_uuid) {
            handle
                .shared
                .pool_domain
                .fetch_or(pool_domain, Ordering::SeqCst);
            return Ok(());
        }

        info!("Start monitoring {sd_uuid}");
        let shared = Arc::new(MonitorShared {
            sd_uuid,
            host_id,
            pool_domain: AtomicBool::new(pool_domain),
            stop: StopEvent::default(),
            status: Mutex::new(DomainMonitorStatus::new(now_secs())),
        });
        let worker = MonitorWorker {
            pool: Arc::downgrade(&self.inner),
            shared: shared.clone(),
            cache: self.inner.cache.clone(),
            interval: self.inner.interval,
            refresh_time: self.inner.refresh_time,
            domain: None,
            is_iso_domain: None,
            iso_prefix: None,
            first_change: true,
            last_refresh: Instant::now(),
            next_status: DomainMonitorStatus::new(now_secs()),
        };
        let thread = thread::Builder::new()
            .name(format!("monitor/{sd_uuid}"))
            .spawn(move || worker.run())
            .context("Failed to spawn domain monitor thread")?;

        // The domain is added only after the task successfully started.
        domains.insert(
            sd_uuid,
            MonitorHandle {
                shared,
                thread: Some(thread),
            },
        );
        Ok(())
    }

    /// Stops the named monitors and blocks until their tasks exit.
    ///
    /// All stop signals are raised before any join: a released host-id must
    /// not be re-acquired by a monitor that has not yet observed its own
    /// stop signal.
    pub fn stop_monitoring(&self, sd_uuids: &[Uuid]) {
        let mut to_join = Vec::new();
        {
            let mut domains = self.inner.domains.lock().unwrap();
            for sd_uuid in sd_uuids {
                if let Some(handle) = domains.get_mut(sd_uuid) {
                    info!("Stop monitoring {sd_uuid}");
                    handle.shared.stop.set();
                    if let Some(thread) = handle.thread.take() {
                        to_join.push((*sd_uuid, thread));
                    }
                }
            }
        }

        // Joining happens outside the pool lock; most of this time is spent
        // waiting for the lease manager.
        for (sd_uuid, thread) in to_join {
            debug!("Waiting for monitor {sd_uuid}");
            if thread.join().is_err() {
                error!("Monitor task for {sd_uuid} panicked");
            }
            if self
                .inner
                .domains
                .lock()
                .unwrap()
                .remove(&sd_uuid)
                .is_none()
            {
                warn!("Monitor for {sd_uuid} removed while stopping");
            }
        }
    }

    /// The last fully committed status of every monitored domain.
    pub fn monitored_domains_status(&self) -> Vec<(Uuid, DomainMonitorStatus)> {
        self.inner
            .domains
            .lock()
            .unwrap()
            .iter()
            .map(|(sd_uuid, handle)| (*sd_uuid, handle.shared.status.lock().unwrap().clone()))
            .collect()
    }

    pub fn close(&self) {
        info!("Stopping all domain monitors");
        self.stop_monitoring(&self.monitored_domains());
    }
}

/// Raised through the probe when the stop signal is observed at a
/// cancellation point.
struct Canceled;

enum ProbeFailure {
    Canceled,
    Error(Error),
}

impl From<Canceled> for ProbeFailure {
    fn from(_: Canceled) -> Self {
        ProbeFailure::Canceled
    }
}

struct MonitorWorker {
    pool: Weak<PoolInner>,
    shared: Arc<MonitorShared>,
    cache: Arc<dyn DomainCache>,
    interval: Duration,
    refresh_time: Duration,
    domain: Option<Arc<dyn StorageDomain>>,
    is_iso_domain: Option<bool>,
    iso_prefix: Option<String>,
    first_change: bool,
    last_refresh: Instant,
    next_status: DomainMonitorStatus,
}

impl MonitorWorker {
    fn run(mut self) {
        debug!("Starting domain monitor for {}", self.shared.sd_uuid);
        self.monitor_loop();
        debug!("Stopping domain monitor for {}", self.shared.sd_uuid);
        if self.should_release_host_id() {
            self.release_host_id();
        }
    }

    fn monitor_loop(&mut self) {
        while !self.shared.stop.is_set() {
            if self.monitor_domain().is_err() {
                debug!("Canceled domain monitor for {}", self.shared.sd_uuid);
                return;
            }
            self.shared.stop.wait(self.interval);
        }
    }

    fn checkpoint(&self) -> Result<(), Canceled> {
        if self.shared.stop.is_set() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }

    fn monitor_domain(&mut self) -> Result<(), Canceled> {
        self.next_status = DomainMonitorStatus::new(now_secs());

        // Pick up changes in the domain, for example a domain upgrade.
        if self.last_refresh.elapsed() > self.refresh_time {
            self.checkpoint()?;
            self.refresh_domain();
        }

        match self.collect_info() {
            Ok(()) => {}
            Err(ProbeFailure::Canceled) => return Err(Canceled),
            Err(ProbeFailure::Error(e)) => {
                error!(
                    "Error while collecting domain {} monitoring information: {e:#}",
                    self.shared.sd_uuid
                );
                self.next_status.error = Some(format!("{e:#}"));
            }
        }

        self.next_status.check_time = now_secs();
        self.next_status.valid = self.next_status.error.is_none();

        if self.status_did_change() {
            self.notify_status_change()?;
        }
        self.first_change = false;

        if self.should_acquire_host_id() {
            self.checkpoint()?;
            self.acquire_host_id();
        }

        *self.shared.status.lock().unwrap() = self.next_status.clone();
        Ok(())
    }

    fn refresh_domain(&mut self) {
        debug!("Refreshing domain {}", self.shared.sd_uuid);
        self.cache.invalidate(self.shared.sd_uuid);
        self.domain = None;
        self.last_refresh = Instant::now();
    }

    fn collect_info(&mut self) -> Result<(), ProbeFailure> {
        if self.domain.is_none() {
            // The handle is produced inside the loop: it may take a while,
            // it may fail, and the task keeps retrying on subsequent ticks
            // until it succeeds or the domain is deactivated.
            self.checkpoint()?;
            self.domain = Some(
                self.cache
                    .produce(self.shared.sd_uuid)
                    .map_err(ProbeFailure::Error)?,
            );
        }
        let domain = self.domain.clone().expect("domain was just produced");

        if self.is_iso_domain.is_none() {
            // Deferred: the iso prefix discovery can fail if the domain
            // disappears, and it must be retried then.
            self.checkpoint()?;
            let is_iso = domain.is_iso().map_err(ProbeFailure::Error)?;
            if is_iso {
                self.iso_prefix = Some(domain.iso_images_dir().map_err(ProbeFailure::Error)?);
            }
            self.is_iso_domain = Some(is_iso);
        }

        // May trigger a refresh of the lvm cache; seen taking up to 90
        // seconds on overloaded machines.
        self.checkpoint()?;
        domain.selftest().map_err(ProbeFailure::Error)?;

        // Blocks while the storage server is not accessible.
        self.checkpoint()?;
        self.next_status.read_delay = domain
            .read_delay()
            .map_err(ProbeFailure::Error)?
            .as_secs_f64();

        self.collect_statistics(&domain).map_err(ProbeFailure::Error)
    }

    fn collect_statistics(&mut self, domain: &Arc<dyn StorageDomain>) -> Result<(), Error> {
        let stats = domain.stats()?;
        self.next_status.disk_utilization = (stats.disk_total, stats.disk_free);
        self.next_status.vg_md_utilization = (stats.mda_size, stats.mda_free);
        self.next_status.vg_md_has_enough_free_space = stats.mda_valid;
        self.next_status.vg_md_free_below_threshold = stats.mda_below_threshold;

        let master = domain.validate_master()?;
        self.next_status.master_valid = master.valid;
        self.next_status.master_mounted = master.mounted;

        self.next_status.has_host_id = domain.has_host_id(self.shared.host_id)?;
        self.next_status.iso_prefix = self.iso_prefix.clone();
        self.next_status.version = domain.version()?;
        Ok(())
    }

    fn status_did_change(&self) -> bool {
        self.first_change || self.shared.status.lock().unwrap().valid != self.next_status.valid
    }

    fn notify_status_change(&self) -> Result<(), Canceled> {
        self.checkpoint()?;
        debug!(
            "Domain {} changed its status to {}",
            self.shared.sd_uuid,
            if self.next_status.valid {
                "Valid"
            } else {
                "Invalid"
            }
        );
        // The pool may already be gone; emitting becomes a no-op then.
        if let Some(pool) = self.pool.upgrade() {
            pool.on_domain_state_change
                .emit(self.shared.sd_uuid, self.next_status.valid);
        }
        Ok(())
    }

    fn should_acquire_host_id(&self) -> bool {
        // An ISO domain can be shared by multiple pools; no host-id there.
        self.is_iso_domain == Some(false)
            && self.next_status.valid
            && !self.next_status.has_host_id
    }

    fn should_release_host_id(&self) -> bool {
        // If the domain was never produced, or is an ISO domain, no host-id
        // was ever requested and releasing is superfluous.
        self.domain.is_some() && self.is_iso_domain != Some(true)
    }

    fn acquire_host_id(&self) {
        let Some(domain) = &self.domain else {
            return;
        };
        if let Err(e) = domain.acquire_host_id(self.shared.host_id) {
            debug!(
                "Unable to issue the acquire host id {} request for domain {}: {e:#}",
                self.shared.host_id, self.shared.sd_uuid
            );
        }
    }

    fn release_host_id(&self) {
        let Some(domain) = &self.domain else {
            return;
        };
        if let Err(e) = domain.release_host_id(self.shared.host_id) {
            debug!(
                "Unable to release the host id {} for domain {}: {e:#}",
                self.shared.host_id, self.shared.sd_uuid
            );
        }
    }
}
