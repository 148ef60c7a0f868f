//! The lease-table capability.
//!
//! Both persistence backings (the journal-backed map in
//! [`crate::file_store`] and the SQLite table in [`crate::sqlite`])
//! implement this one trait, and the engine depends on nothing else.
//! Operations are synchronous: the engine serialises every call behind its
//! own token, and the SQLite backing is a synchronous library anyway.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::lease::{HwAddr, Lease};

/// Durable mapping from hardware address to lease.
///
/// Implementations enforce the two table invariants: `hw` is the primary
/// key, and no two entries share an address. Mutations that create,
/// reassign, or remove a lease are durable before they return; renewals
/// may be buffered until [`LeaseStore::flush`].
pub trait LeaseStore: Send + 'static {
    /// Creates or updates the lease for `hw`, idempotently.
    ///
    /// An existing entry keeps its address and id; only the expiration,
    /// host, and feeder are taken from the arguments. Inserting an address
    /// held by a different client fails with
    /// [`Conflict`](crate::Error::Conflict).
    fn upsert(
        &mut self,
        hw: HwAddr,
        ip: Ipv4Addr,
        expires_at: DateTime<Utc>,
        host: Option<String>,
        feeder: &str,
    ) -> Result<Lease>;

    /// Pushes the expiration of an existing lease to
    /// `max(existing, now + lease_time)`.
    ///
    /// Returns the leased address and whether the deadline actually moved.
    /// Fails with [`NotFound`](crate::Error::NotFound) when `hw` has no
    /// entry; whether a miss becomes an allocation is the engine's call.
    fn renew(
        &mut self,
        hw: HwAddr,
        now: DateTime<Utc>,
        lease_time: Duration,
    ) -> Result<(Ipv4Addr, bool)>;

    /// Removes the lease for `hw` and returns the freed address.
    fn delete_by_hw(&mut self, hw: HwAddr) -> Result<Ipv4Addr>;

    /// Removes every lease expired at `now`; all removals or none.
    ///
    /// Returns the removed `(hw, ip)` pairs so the caller can return the
    /// addresses to the allocator.
    fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<(HwAddr, Ipv4Addr)>>;

    fn get(&self, hw: HwAddr) -> Result<Option<Lease>>;

    fn find_by_id(&self, id: i64) -> Result<Option<Lease>>;

    fn find_by_feeder(&self, feeder: &str) -> Result<Vec<Lease>>;

    fn list(&self) -> Result<Vec<Lease>>;

    /// Pushes buffered renewals to durable storage. A no-op when the
    /// backing commits every mutation eagerly.
    fn flush(&mut self) -> Result<()>;
}
