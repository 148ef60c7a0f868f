//! The lease engine.
//!
//! Owns the allocator and the lease store behind a single token (a
//! [`tokio::sync::Mutex`]): every public operation locks on entry, mutates
//! both sides, persists, and unlocks. Callers therefore observe mutations
//! in commit order, and the allocator's view always agrees with the table.
//!
//! The expiry sweep runs as a [`PeriodicTask`] started with
//! [`Engine::start_gc`] and joined by [`Engine::shutdown`].

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator::RangeAllocator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file_store::FileStore;
use crate::lease::{HwAddr, Lease, whole_seconds};
use crate::store::LeaseStore;
use crate::task::PeriodicTask;

struct Inner<S> {
    allocator: RangeAllocator,
    store: S,
}

pub struct Engine<S: LeaseStore> {
    inner: Arc<Mutex<Inner<S>>>,
    lease_time: Duration,
    gc: Mutex<Option<PeriodicTask>>,
}

impl Engine<FileStore> {
    /// Engine over the journal-backed store at `lease_file`.
    pub fn with_lease_file<P: AsRef<Path>>(
        lease_file: P,
        lease_time: Duration,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
    ) -> Result<Self> {
        let store = FileStore::open(lease_file.as_ref(), Utc::now())?;
        Self::new(store, lease_time, range_start, range_end)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Self::with_lease_file(
            &config.lease_file,
            config.lease_time()?,
            config.range_start,
            config.range_end,
        )
    }
}

impl<S: LeaseStore> Engine<S> {
    /// Builds the engine over an already-opened store and reconciles the
    /// allocator with it: every persisted lease is replayed as an
    /// allocation, and a lease the allocator refuses (the configured range
    /// no longer covers it, or its address is taken) is logged and
    /// discarded rather than failing startup.
    pub fn new(
        mut store: S,
        lease_time: Duration,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
    ) -> Result<Self> {
        if lease_time.is_zero() {
            return Err(Error::InvalidConfig(
                "lease_time must be greater than 0".to_string(),
            ));
        }

        let mut allocator = RangeAllocator::new(range_start, range_end)?;

        for lease in store.list()? {
            let discard = match allocator.allocate(Some(lease.ip)) {
                Ok(granted) if granted == lease.ip => false,
                Ok(granted) => {
                    // The hint was not honoured: the persisted address is
                    // not available in the configured range.
                    if let Err(free_error) = allocator.free(granted) {
                        warn!(%free_error, "could not undo reconciliation grant");
                    }
                    true
                }
                Err(_) => true,
            };

            if discard {
                warn!(
                    hw = %lease.hw,
                    ip = %lease.ip,
                    "persisted lease does not fit the configured range, discarding"
                );
                if let Err(delete_error) = store.delete_by_hw(lease.hw) {
                    warn!(%delete_error, "could not discard stale lease");
                }
            }
        }

        let restored = store.list()?.len();
        info!(
            leases = restored,
            range_start = %range_start,
            range_end = %range_end,
            "lease engine ready"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { allocator, store })),
            lease_time,
            gc: Mutex::new(None),
        })
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// DISCOVER path: a known client gets its recorded address with the
    /// expiration pushed forward; an unknown client gets a fresh
    /// allocation, honouring `requested_ip` when it is free and in range.
    ///
    /// When the allocation succeeds but the table cannot be persisted the
    /// address is freed again and the persistence error is returned.
    pub async fn offer_or_renew(
        &self,
        hw: HwAddr,
        requested_ip: Option<Ipv4Addr>,
        host: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Ipv4Addr> {
        let mut inner = self.inner.lock().await;

        if inner.store.get(hw)?.is_some() {
            let (ip, extended) = inner.store.renew(hw, now, self.lease_time)?;
            debug!(%hw, %ip, extended, "renewed on discover");
            return Ok(ip);
        }

        info!(%hw, "new client, leasing a fresh address");
        let ip = inner.allocator.allocate(requested_ip)?;
        let expires_at = self.expiry(now);

        match inner
            .store
            .upsert(hw, ip, expires_at, host.map(String::from), "")
        {
            Ok(lease) => Ok(lease.ip),
            Err(persist_error) => {
                // Compensate, but always surface the original failure.
                if let Err(free_error) = inner.allocator.free(ip) {
                    error!(%ip, %free_error, "could not free address after failed persist");
                }
                Err(persist_error)
            }
        }
    }

    /// REQUEST path: the client must be known and `req_ip` must match its
    /// recorded address; a mismatch is never silently reassigned. On
    /// success the renewal is flushed to durable storage.
    pub async fn confirm_or_renew(
        &self,
        hw: HwAddr,
        req_ip: Ipv4Addr,
        _host: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Ipv4Addr> {
        let mut inner = self.inner.lock().await;

        let lease = inner
            .store
            .get(hw)?
            .ok_or_else(|| Error::NotFound(hw.to_string()))?;

        if lease.ip != req_ip {
            return Err(Error::Mismatch {
                hw: hw.to_string(),
                requested: req_ip,
                stored: lease.ip,
            });
        }

        let (ip, _extended) = inner.store.renew(hw, now, self.lease_time)?;
        // A REQUEST confirms the lease; buffered renewals go to disk now.
        inner.store.flush()?;
        debug!(%hw, %ip, "confirmed lease");
        Ok(ip)
    }

    /// RELEASE path: the `(hw, ip)` pair must match a recorded lease.
    pub async fn release(&self, hw: HwAddr, ip: Ipv4Addr) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let lease = inner
            .store
            .get(hw)?
            .ok_or_else(|| Error::NotFound(hw.to_string()))?;
        if lease.ip != ip {
            return Err(Error::Mismatch {
                hw: hw.to_string(),
                requested: ip,
                stored: lease.ip,
            });
        }

        let freed = inner.store.delete_by_hw(hw)?;
        if let Err(free_error) = inner.allocator.free(freed) {
            // Table and allocator disagreed; the table is already durable,
            // so log loudly and move on.
            error!(%hw, %freed, %free_error, "released address was not allocated");
        }

        info!(%hw, %freed, "lease released");
        Ok(())
    }

    /// Admin/ingestion path: records a lease observed elsewhere (message
    /// bus, external daemon dump). The address must reconcile with the
    /// allocator: out-of-range imports are rejected and an address held by
    /// a different client is a conflict.
    pub async fn upsert(
        &self,
        hw: HwAddr,
        ip: Ipv4Addr,
        host: Option<&str>,
        feeder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.store.get(hw)? {
            // The recorded address wins; only metadata and expiry move.
            return inner.store.upsert(
                hw,
                existing.ip,
                expires_at,
                host.map(String::from),
                feeder,
            );
        }

        if !inner.allocator.contains(ip) {
            return Err(Error::OutOfRange(ip));
        }

        let granted = inner.allocator.allocate(Some(ip))?;
        if granted != ip {
            if let Err(free_error) = inner.allocator.free(granted) {
                warn!(%free_error, "could not undo fallback grant");
            }
            let holder = inner
                .store
                .list()?
                .into_iter()
                .find(|lease| lease.ip == ip)
                .map(|lease| lease.hw.to_string())
                .unwrap_or_default();
            return Err(Error::Conflict { ip, holder });
        }

        match inner
            .store
            .upsert(hw, ip, expires_at, host.map(String::from), feeder)
        {
            Ok(lease) => Ok(lease),
            Err(persist_error) => {
                if let Err(free_error) = inner.allocator.free(ip) {
                    error!(%ip, %free_error, "could not free address after failed persist");
                }
                Err(persist_error)
            }
        }
    }

    pub async fn find_by_hw(&self, hw: HwAddr) -> Result<Option<Lease>> {
        self.inner.lock().await.store.get(hw)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Lease>> {
        self.inner.lock().await.store.find_by_id(id)
    }

    pub async fn find_by_feeder(&self, feeder: &str) -> Result<Vec<Lease>> {
        self.inner.lock().await.store.find_by_feeder(feeder)
    }

    pub async fn find_all(&self) -> Result<Vec<Lease>> {
        self.inner.lock().await.store.list()
    }

    /// Whether `ip` is currently allocated.
    pub async fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.inner.lock().await.allocator.is_allocated(ip)
    }

    /// Runs one expiry sweep with the given clock and returns how many
    /// leases were reaped.
    pub async fn collect_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        sweep(&mut inner, now)
    }

    /// Starts the periodic expiry sweep. A previously running sweep task
    /// is stopped first.
    pub async fn start_gc(&self, period: Duration) {
        let inner = Arc::clone(&self.inner);
        let task = PeriodicTask::spawn("lease-gc", period, move || {
            let inner = Arc::clone(&inner);
            async move {
                debug!("expiry sweep");
                let mut inner = inner.lock().await;
                match sweep(&mut inner, Utc::now()) {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "reaped expired leases"),
                    // Best effort: the next tick retries.
                    Err(sweep_error) => warn!(%sweep_error, "expiry sweep failed"),
                }
            }
        });

        if let Some(previous) = self.gc.lock().await.replace(task) {
            previous.stop().await;
        }
    }

    /// Stops the expiry sweep, waits out any in-flight mutation, and
    /// flushes the store. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.gc.lock().await.take() {
            task.stop().await;
        }

        let mut inner = self.inner.lock().await;
        inner.store.flush()
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        whole_seconds(now + TimeDelta::seconds(self.lease_time.as_secs() as i64))
    }
}

/// One expiry sweep: reap stale leases, return their addresses to the
/// allocator, and push any buffered state to disk.
fn sweep<S: LeaseStore>(inner: &mut Inner<S>, now: DateTime<Utc>) -> Result<usize> {
    let removed = inner.store.delete_expired(now)?;

    for (hw, ip) in &removed {
        match inner.allocator.free(*ip) {
            Ok(()) => info!(%hw, %ip, "lease expired"),
            // Should not happen while the engine is the only writer.
            Err(free_error) => warn!(%hw, %ip, %free_error, "reaped lease held no allocation"),
        }
    }

    // Also covers renewals buffered since the last confirmed request.
    inner.store.flush()?;

    Ok(removed.len())
}
