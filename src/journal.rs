//! Text codecs for the lease journal and the external daemon dump.
//!
//! The journal is the authoritative on-disk snapshot of the lease table:
//! one live lease per line, `hw ip expiration`, with the expiration in
//! RFC 3339. Every durable mutation rewrites the whole file through an
//! atomic rename; there is no append path.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, Result};
use crate::lease::{HwAddr, Lease};

/// ANSI C timestamp layout used by the external daemon's lease dump,
/// e.g. `Mon Jan  2 15:04:05 2006`.
const DUMP_TIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// A journal line: the subset of a lease that survives a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub hw: HwAddr,
    pub ip: Ipv4Addr,
    pub expires_at: DateTime<Utc>,
}

/// Renders the lease table in journal form.
pub fn encode<'a, I>(leases: I) -> String
where
    I: IntoIterator<Item = &'a Lease>,
{
    let mut out = String::new();
    for lease in leases {
        out.push_str(&format!(
            "{} {} {}\n",
            lease.hw,
            lease.ip,
            lease.expires_at.to_rfc3339()
        ));
    }
    out
}

/// Parses journal text.
///
/// Blank lines are skipped and records expired at `now` are silently
/// dropped; any other malformation fails the whole load.
pub fn decode(text: &str, now: DateTime<Utc>) -> Result<Vec<JournalRecord>> {
    let mut records = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(Error::MalformedLease(format!(
                "want 3 fields, got {}: {line}",
                tokens.len()
            )));
        }

        let hw: HwAddr = tokens[0].parse()?;
        let ip: Ipv4Addr = tokens[1]
            .parse()
            .map_err(|_| Error::MalformedLease(format!("expected an IPv4 address: {}", tokens[1])))?;
        let expires_at = DateTime::parse_from_rfc3339(tokens[2])
            .map_err(|_| {
                Error::MalformedLease(format!("expected an RFC 3339 expiration: {}", tokens[2]))
            })?
            .with_timezone(&Utc);

        if expires_at > now {
            records.push(JournalRecord { hw, ip, expires_at });
        }
    }

    Ok(records)
}

/// Reads the journal at `path`, creating an empty file (mode 0644) when
/// absent.
pub fn load(path: &Path, now: DateTime<Utc>) -> Result<Vec<JournalRecord>> {
    if !path.exists() {
        fs::write(path, "").map_err(|error| {
            Error::Persistence(format!("create lease file {}: {error}", path.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o644)).map_err(|error| {
                Error::Persistence(format!("chmod lease file {}: {error}", path.display()))
            })?;
        }
        return Ok(Vec::new());
    }

    let text = fs::read_to_string(path).map_err(|error| {
        Error::Persistence(format!("read lease file {}: {error}", path.display()))
    })?;
    decode(&text, now)
}

/// Replaces the journal at `path` with a fresh snapshot of `leases`.
///
/// The snapshot is written to a temporary sibling and renamed into place
/// so readers never observe a partial file.
pub fn write_atomic<'a, I>(path: &Path, leases: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Lease>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    fs::write(tmp, encode(leases)).map_err(|error| {
        Error::Persistence(format!("write lease file {}: {error}", tmp.display()))
    })?;
    fs::rename(tmp, path).map_err(|error| {
        Error::Persistence(format!(
            "rename {} to {}: {error}",
            tmp.display(),
            path.display()
        ))
    })?;

    Ok(())
}

/// One entry of an external daemon's lease dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    pub hw: HwAddr,
    pub ip: Ipv4Addr,
    pub host: String,
    pub expires_at: DateTime<Utc>,
}

/// Parses the space-separated dump an external DHCP daemon emits:
/// a header line, then `hw ip host` followed by an ANSI C timestamp
/// (8 whitespace-separated fields per record).
pub fn decode_daemon_dump(text: &str) -> Result<Vec<DumpRecord>> {
    let mut records = Vec::new();

    for line in text.lines().skip(1) {
        if line.is_empty() {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 8 {
            return Err(Error::MalformedLease(format!(
                "want 8 fields, got {}: {line}",
                tokens.len()
            )));
        }

        let hw: HwAddr = tokens[0].parse()?;
        let ip: Ipv4Addr = tokens[1]
            .parse()
            .map_err(|_| Error::MalformedLease(format!("expected an IPv4 address: {}", tokens[1])))?;
        let timestamp = tokens[3..].join(" ");
        let expires_at = NaiveDateTime::parse_from_str(&timestamp, DUMP_TIME_FORMAT)
            .map_err(|_| Error::MalformedLease(format!("malformed expiration time: {timestamp}")))?
            .and_utc();

        records.push(DumpRecord {
            hw,
            ip,
            host: tokens[2].to_string(),
            expires_at,
        });
    }

    Ok(records)
}
