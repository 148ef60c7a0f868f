//! SQLite-backed lease store.
//!
//! Same contract as the journal-backed store, with durability delegated to
//! the database: every mutation is one committed transaction, so
//! [`SqliteStore::flush`] has nothing to do. Expirations are stored as
//! whole unix seconds.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::{HwAddr, Lease};
use crate::store::LeaseStore;

/// Attempts at the expiry sweep before reporting concurrent modification.
const DELETE_EXPIRED_ATTEMPTS: u32 = 3;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS leases (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    hw         TEXT NOT NULL UNIQUE,
    ip         TEXT NOT NULL UNIQUE,
    host       TEXT,
    feeder     TEXT NOT NULL DEFAULT '',
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS leases_expires_at ON leases(expires_at);
";

type LeaseRow = (i64, String, String, Option<String>, String, i64);

const LEASE_COLUMNS: &str = "id, hw, ip, host, feeder, expires_at";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and purges rows already
    /// expired at `now`.
    pub fn open<P: AsRef<Path>>(path: P, now: DateTime<Utc>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, now)
    }

    /// In-memory database, mainly for tests and embedders that persist
    /// elsewhere.
    pub fn open_in_memory(now: DateTime<Utc>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, now)
    }

    fn init(conn: Connection, now: DateTime<Utc>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let purged = conn.execute(
            "DELETE FROM leases WHERE expires_at <= ?1",
            params![now.timestamp()],
        )?;
        if purged > 0 {
            debug!(purged, "dropped stale leases on startup");
        }
        Ok(Self { conn })
    }

    fn lease_from_row(row: LeaseRow) -> Result<Lease> {
        let (id, hw, ip, host, feeder, expires_at) = row;
        Ok(Lease {
            id,
            hw: hw.parse()?,
            ip: ip
                .parse()
                .map_err(|_| Error::MalformedLease(format!("expected an IPv4 address: {ip}")))?,
            host,
            feeder,
            expires_at: DateTime::from_timestamp(expires_at, 0)
                .ok_or_else(|| Error::MalformedLease(format!("bad expiration: {expires_at}")))?,
        })
    }

    fn query_leases(&self, sql: &str, filter: Option<&str>) -> Result<Vec<Lease>> {
        let mut statement = self.conn.prepare(sql)?;
        let rows: Vec<LeaseRow> = match filter {
            Some(value) => statement.query_map(params![value], row_tuple)?,
            None => statement.query_map([], row_tuple)?,
        }
        .collect::<rusqlite::Result<_>>()?;

        rows.into_iter().map(Self::lease_from_row).collect()
    }
}

fn row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeaseRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn commit_error(error: rusqlite::Error) -> Error {
    Error::Persistence(format!("commit lease transaction: {error}"))
}

impl LeaseStore for SqliteStore {
    fn upsert(
        &mut self,
        hw: HwAddr,
        ip: Ipv4Addr,
        expires_at: DateTime<Utc>,
        host: Option<String>,
        feeder: &str,
    ) -> Result<Lease> {
        let expires = expires_at.timestamp();
        let tx = self.conn.transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, ip FROM leases WHERE hw = ?1",
                params![hw.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let lease = match existing {
            Some((id, stored_ip)) => {
                tx.execute(
                    "UPDATE leases SET expires_at = ?1, host = ?2, feeder = ?3 WHERE id = ?4",
                    params![expires, host, feeder, id],
                )?;
                Lease {
                    id,
                    hw,
                    ip: stored_ip.parse().map_err(|_| {
                        Error::MalformedLease(format!("expected an IPv4 address: {stored_ip}"))
                    })?,
                    host,
                    feeder: feeder.to_string(),
                    expires_at: DateTime::from_timestamp(expires, 0).unwrap_or(expires_at),
                }
            }
            None => {
                let holder: Option<String> = tx
                    .query_row(
                        "SELECT hw FROM leases WHERE ip = ?1",
                        params![ip.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(holder) = holder {
                    return Err(Error::Conflict { ip, holder });
                }

                tx.execute(
                    "INSERT INTO leases (hw, ip, host, feeder, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![hw.to_string(), ip.to_string(), host, feeder, expires],
                )?;
                Lease {
                    id: tx.last_insert_rowid(),
                    hw,
                    ip,
                    host,
                    feeder: feeder.to_string(),
                    expires_at: DateTime::from_timestamp(expires, 0).unwrap_or(expires_at),
                }
            }
        };

        tx.commit().map_err(commit_error)?;
        Ok(lease)
    }

    fn renew(
        &mut self,
        hw: HwAddr,
        now: DateTime<Utc>,
        lease_time: Duration,
    ) -> Result<(Ipv4Addr, bool)> {
        let tx = self.conn.transaction()?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT ip, expires_at FROM leases WHERE hw = ?1",
                params![hw.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (stored_ip, stored_expires) =
            row.ok_or_else(|| Error::NotFound(hw.to_string()))?;

        let candidate = now.timestamp() + lease_time.as_secs() as i64;
        let extended = candidate > stored_expires;
        if extended {
            tx.execute(
                "UPDATE leases SET expires_at = ?1 WHERE hw = ?2",
                params![candidate, hw.to_string()],
            )?;
        }

        tx.commit().map_err(commit_error)?;

        let ip = stored_ip.parse().map_err(|_| {
            Error::MalformedLease(format!("expected an IPv4 address: {stored_ip}"))
        })?;
        Ok((ip, extended))
    }

    fn delete_by_hw(&mut self, hw: HwAddr) -> Result<Ipv4Addr> {
        let tx = self.conn.transaction()?;

        let stored_ip: Option<String> = tx
            .query_row(
                "SELECT ip FROM leases WHERE hw = ?1",
                params![hw.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let stored_ip = stored_ip.ok_or_else(|| Error::NotFound(hw.to_string()))?;

        tx.execute("DELETE FROM leases WHERE hw = ?1", params![hw.to_string()])?;
        tx.commit().map_err(commit_error)?;

        stored_ip.parse().map_err(|_| {
            Error::MalformedLease(format!("expected an IPv4 address: {stored_ip}"))
        })
    }

    fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<(HwAddr, Ipv4Addr)>> {
        let cutoff = now.timestamp();

        for _attempt in 0..DELETE_EXPIRED_ATTEMPTS {
            let tx = self.conn.transaction()?;

            let rows: Vec<(String, String)> = tx
                .prepare("SELECT hw, ip FROM leases WHERE expires_at <= ?1")?
                .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            let deleted = tx.execute(
                "DELETE FROM leases WHERE expires_at <= ?1",
                params![cutoff],
            )?;

            // The delete must cover exactly the rows just selected;
            // anything else means the table moved underneath the sweep.
            if deleted != rows.len() {
                drop(tx);
                continue;
            }

            tx.commit().map_err(commit_error)?;

            return rows
                .into_iter()
                .map(|(hw, ip)| {
                    Ok((
                        hw.parse()?,
                        ip.parse().map_err(|_| {
                            Error::MalformedLease(format!("expected an IPv4 address: {ip}"))
                        })?,
                    ))
                })
                .collect();
        }

        Err(Error::ConcurrentModification)
    }

    fn get(&self, hw: HwAddr) -> Result<Option<Lease>> {
        let row: Option<LeaseRow> = self
            .conn
            .query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE hw = ?1"),
                params![hw.to_string()],
                row_tuple,
            )
            .optional()?;
        row.map(Self::lease_from_row).transpose()
    }

    fn find_by_id(&self, id: i64) -> Result<Option<Lease>> {
        let row: Option<LeaseRow> = self
            .conn
            .query_row(
                &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = ?1"),
                params![id],
                row_tuple,
            )
            .optional()?;
        row.map(Self::lease_from_row).transpose()
    }

    fn find_by_feeder(&self, feeder: &str) -> Result<Vec<Lease>> {
        self.query_leases(
            &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE feeder = ?1"),
            Some(feeder),
        )
    }

    fn list(&self) -> Result<Vec<Lease>> {
        self.query_leases(&format!("SELECT {LEASE_COLUMNS} FROM leases"), None)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn hw(last: u8) -> HwAddr {
        HwAddr::new([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, last])
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 0, last)
    }

    fn test_store() -> (SqliteStore, DateTime<Utc>) {
        let now = crate::lease::whole_seconds(Utc::now());
        (SqliteStore::open_in_memory(now).unwrap(), now)
    }

    #[test]
    fn test_upsert_insert_and_update() {
        let (mut store, now) = test_store();
        let later = now + TimeDelta::seconds(60);

        let created = store
            .upsert(hw(1), ip(1), later, Some("printer".to_string()), "")
            .unwrap();
        assert_eq!(created.ip, ip(1));
        assert_eq!(created.host.as_deref(), Some("printer"));

        let updated = store
            .upsert(hw(1), ip(9), later + TimeDelta::seconds(30), None, "lab")
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.ip, ip(1));
        assert_eq!(updated.host, None);
        assert_eq!(updated.feeder, "lab");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_rejects_taken_ip() {
        let (mut store, now) = test_store();
        let later = now + TimeDelta::seconds(60);

        store.upsert(hw(1), ip(1), later, None, "").unwrap();
        let result = store.upsert(hw(2), ip(1), later, None, "");
        assert!(matches!(result, Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_renew_is_monotone() {
        let (mut store, now) = test_store();
        store
            .upsert(hw(1), ip(1), now + TimeDelta::seconds(60), None, "")
            .unwrap();

        let (addr, extended) = store
            .renew(hw(1), now + TimeDelta::seconds(30), Duration::from_secs(60))
            .unwrap();
        assert_eq!(addr, ip(1));
        assert!(extended);

        let (_, extended) = store.renew(hw(1), now, Duration::from_secs(10)).unwrap();
        assert!(!extended);

        let lease = store.get(hw(1)).unwrap().unwrap();
        assert_eq!(lease.expires_at, now + TimeDelta::seconds(90));

        assert!(matches!(
            store.renew(hw(7), now, Duration::from_secs(60)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_by_hw() {
        let (mut store, now) = test_store();
        store
            .upsert(hw(1), ip(1), now + TimeDelta::seconds(60), None, "")
            .unwrap();

        assert_eq!(store.delete_by_hw(hw(1)).unwrap(), ip(1));
        assert!(store.get(hw(1)).unwrap().is_none());
        assert!(matches!(
            store.delete_by_hw(hw(1)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_expired() {
        let (mut store, now) = test_store();
        store
            .upsert(hw(1), ip(1), now + TimeDelta::seconds(1), None, "")
            .unwrap();
        store
            .upsert(hw(2), ip(2), now + TimeDelta::seconds(600), None, "")
            .unwrap();

        let removed = store.delete_expired(now + TimeDelta::seconds(2)).unwrap();
        assert_eq!(removed, vec![(hw(1), ip(1))]);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(
            store
                .delete_expired(now + TimeDelta::seconds(2))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_startup_purges_stale_rows() {
        let path = std::env::temp_dir().join("rangelease_sqlite_purge.db");
        let _ = std::fs::remove_file(&path);
        let now = crate::lease::whole_seconds(Utc::now());

        {
            let mut store = SqliteStore::open(&path, now).unwrap();
            store
                .upsert(hw(1), ip(1), now + TimeDelta::seconds(1), None, "")
                .unwrap();
            store
                .upsert(hw(2), ip(2), now + TimeDelta::seconds(600), None, "")
                .unwrap();
        }

        let store = SqliteStore::open(&path, now + TimeDelta::seconds(10)).unwrap();
        let leases = store.list().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].hw, hw(2));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_find_queries() {
        let (mut store, now) = test_store();
        let later = now + TimeDelta::seconds(60);
        let created = store.upsert(hw(1), ip(1), later, None, "feed-a").unwrap();
        store.upsert(hw(2), ip(2), later, None, "feed-b").unwrap();

        assert_eq!(store.find_by_id(created.id).unwrap().unwrap().hw, hw(1));
        assert!(store.find_by_id(999).unwrap().is_none());

        let tagged = store.find_by_feeder("feed-b").unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].hw, hw(2));
    }
}
