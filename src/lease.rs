//! Lease records and hardware-address handling.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A 6-byte Ethernet hardware address.
///
/// The canonical text form is lowercase colon-separated hex
/// (`aa:bb:cc:dd:ee:ff`); parsing also accepts dash separators and
/// uppercase digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HwAddr([u8; 6]);

impl HwAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for HwAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_lowercase().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut count = 0;

        for part in normalized.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(Error::MalformedLease(format!(
                    "invalid hardware address: {s}"
                )));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::MalformedLease(format!("invalid hardware address: {s}")))?;
            count += 1;
        }

        if count != 6 {
            return Err(Error::MalformedLease(format!(
                "invalid hardware address: {s}"
            )));
        }

        Ok(Self(octets))
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A binding of a hardware address to an IPv4 address for a bounded
/// wall-clock window.
///
/// Leases cross the engine boundary by value only; mutating a returned
/// copy never affects the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Store-assigned surrogate key, for admin lookups.
    pub id: i64,

    /// The client's hardware address; primary key of the lease table.
    pub hw: HwAddr,

    /// The leased IPv4 address, unique across live leases.
    pub ip: Ipv4Addr,

    /// Client-supplied hostname, informational.
    pub host: Option<String>,

    /// Tag of the external feed this lease was ingested from; empty for
    /// leases issued by the engine itself.
    #[serde(default)]
    pub feeder: String,

    /// When this lease expires (UTC, whole seconds).
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Returns true if the lease has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Seconds remaining until expiration at `now`, or 0 if expired.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Drops the sub-second component so a persisted expiration reloads
/// bit-for-bit from its RFC 3339 form.
pub(crate) fn whole_seconds(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(instant.timestamp(), 0).unwrap_or(instant)
}
