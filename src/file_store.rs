//! Journal-backed lease store.
//!
//! The map in memory is authoritative; the journal on disk is a rewritten
//! snapshot. Mutations that create or remove a lease persist before they
//! return and roll the map back when the write fails. Renewals only mark
//! the store dirty; [`FileStore::flush`] (driven by confirmed requests
//! and the expiry sweep) writes them out.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, Result};
use crate::journal;
use crate::lease::{HwAddr, Lease, whole_seconds};
use crate::store::LeaseStore;

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    leases: HashMap<HwAddr, Lease>,
    next_id: i64,
    dirty: bool,
}

impl FileStore {
    /// Opens the journal at `path`, creating it when absent, and loads
    /// every record still live at `now`.
    pub fn open<P: Into<PathBuf>>(path: P, now: DateTime<Utc>) -> Result<Self> {
        let path = path.into();
        let records = journal::load(&path, now)?;

        let mut leases = HashMap::with_capacity(records.len());
        let mut next_id = 1;
        for record in records {
            leases.insert(
                record.hw,
                Lease {
                    id: next_id,
                    hw: record.hw,
                    ip: record.ip,
                    host: None,
                    feeder: String::new(),
                    expires_at: record.expires_at,
                },
            );
            next_id += 1;
        }

        Ok(Self {
            path,
            leases,
            next_id,
            dirty: false,
        })
    }

    fn persist(&mut self) -> Result<()> {
        journal::write_atomic(&self.path, self.leases.values())?;
        self.dirty = false;
        Ok(())
    }
}

impl LeaseStore for FileStore {
    fn upsert(
        &mut self,
        hw: HwAddr,
        ip: Ipv4Addr,
        expires_at: DateTime<Utc>,
        host: Option<String>,
        feeder: &str,
    ) -> Result<Lease> {
        let expires_at = whole_seconds(expires_at);

        if let Some(existing) = self.leases.get(&hw) {
            let mut updated = existing.clone();
            updated.expires_at = expires_at;
            updated.host = host;
            updated.feeder = feeder.to_string();

            let previous = self.leases.insert(hw, updated.clone());
            if let Err(error) = self.persist() {
                if let Some(previous) = previous {
                    self.leases.insert(hw, previous);
                }
                return Err(error);
            }
            return Ok(updated);
        }

        if let Some(holder) = self.leases.values().find(|lease| lease.ip == ip) {
            return Err(Error::Conflict {
                ip,
                holder: holder.hw.to_string(),
            });
        }

        let lease = Lease {
            id: self.next_id,
            hw,
            ip,
            host,
            feeder: feeder.to_string(),
            expires_at,
        };
        self.leases.insert(hw, lease.clone());
        if let Err(error) = self.persist() {
            self.leases.remove(&hw);
            return Err(error);
        }
        self.next_id += 1;

        Ok(lease)
    }

    fn renew(
        &mut self,
        hw: HwAddr,
        now: DateTime<Utc>,
        lease_time: Duration,
    ) -> Result<(Ipv4Addr, bool)> {
        let lease = self
            .leases
            .get_mut(&hw)
            .ok_or_else(|| Error::NotFound(hw.to_string()))?;

        let candidate = whole_seconds(now + TimeDelta::seconds(lease_time.as_secs() as i64));
        let extended = candidate > lease.expires_at;
        if extended {
            lease.expires_at = candidate;
            self.dirty = true;
        }

        Ok((lease.ip, extended))
    }

    fn delete_by_hw(&mut self, hw: HwAddr) -> Result<Ipv4Addr> {
        let lease = self
            .leases
            .remove(&hw)
            .ok_or_else(|| Error::NotFound(hw.to_string()))?;

        if let Err(error) = self.persist() {
            self.leases.insert(hw, lease);
            return Err(error);
        }

        Ok(lease.ip)
    }

    fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<(HwAddr, Ipv4Addr)>> {
        let expired: Vec<HwAddr> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired_at(now))
            .map(|lease| lease.hw)
            .collect();

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut removed = Vec::with_capacity(expired.len());
        for hw in expired {
            if let Some(lease) = self.leases.remove(&hw) {
                removed.push(lease);
            }
        }

        if let Err(error) = self.persist() {
            // All or none: put every reaped entry back.
            for lease in removed {
                self.leases.insert(lease.hw, lease);
            }
            return Err(error);
        }

        Ok(removed
            .into_iter()
            .map(|lease| (lease.hw, lease.ip))
            .collect())
    }

    fn get(&self, hw: HwAddr) -> Result<Option<Lease>> {
        Ok(self.leases.get(&hw).cloned())
    }

    fn find_by_id(&self, id: i64) -> Result<Option<Lease>> {
        Ok(self.leases.values().find(|lease| lease.id == id).cloned())
    }

    fn find_by_feeder(&self, feeder: &str) -> Result<Vec<Lease>> {
        Ok(self
            .leases
            .values()
            .filter(|lease| lease.feeder == feeder)
            .cloned()
            .collect())
    }

    fn list(&self) -> Result<Vec<Lease>> {
        Ok(self.leases.values().cloned().collect())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGuard(PathBuf);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn test_store(name: &str) -> (FileStore, TestGuard, DateTime<Utc>) {
        let path = std::env::temp_dir().join(format!("rangelease_filestore_{name}.txt"));
        let _ = std::fs::remove_file(&path);
        let now = crate::lease::whole_seconds(Utc::now());
        let store = FileStore::open(&path, now).unwrap();
        (store, TestGuard(path), now)
    }

    fn hw(last: u8) -> HwAddr {
        HwAddr::new([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, last])
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 0, last)
    }

    fn data_lines(path: &PathBuf) -> usize {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|line| !line.is_empty())
            .count()
    }

    #[test]
    fn test_upsert_persists_one_line_per_lease() {
        let (mut store, guard, now) = test_store("upsert");
        let later = now + TimeDelta::seconds(60);

        store.upsert(hw(1), ip(1), later, None, "").unwrap();
        store
            .upsert(hw(2), ip(2), later, Some("printer".to_string()), "")
            .unwrap();

        assert_eq!(data_lines(&guard.0), 2);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_is_idempotent_by_hw() {
        let (mut store, _guard, now) = test_store("idempotent");
        let later = now + TimeDelta::seconds(60);

        let first = store.upsert(hw(1), ip(1), later, None, "").unwrap();
        // A second upsert keeps the original address and id, even when the
        // caller names a different address.
        let second = store
            .upsert(
                hw(1),
                ip(9),
                later + TimeDelta::seconds(30),
                Some("host".to_string()),
                "lab",
            )
            .unwrap();

        assert_eq!(second.ip, first.ip);
        assert_eq!(second.id, first.id);
        assert_eq!(second.expires_at, later + TimeDelta::seconds(30));
        assert_eq!(second.host.as_deref(), Some("host"));
        assert_eq!(second.feeder, "lab");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_rejects_taken_ip() {
        let (mut store, _guard, now) = test_store("conflict");
        let later = now + TimeDelta::seconds(60);

        store.upsert(hw(1), ip(1), later, None, "").unwrap();
        let result = store.upsert(hw(2), ip(1), later, None, "");
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_renew_is_monotone_and_lazy() {
        let (mut store, guard, now) = test_store("renew");
        let later = now + TimeDelta::seconds(60);
        store.upsert(hw(1), ip(1), later, None, "").unwrap();
        let lines_before = data_lines(&guard.0);

        let (addr, extended) = store
            .renew(hw(1), now + TimeDelta::seconds(30), Duration::from_secs(60))
            .unwrap();
        assert_eq!(addr, ip(1));
        assert!(extended);
        // Lazy: nothing hits the disk until a flush.
        assert_eq!(data_lines(&guard.0), lines_before);

        // A renewal that would shorten the lease leaves it untouched.
        let (_, extended) = store
            .renew(hw(1), now, Duration::from_secs(10))
            .unwrap();
        assert!(!extended);
        let lease = store.get(hw(1)).unwrap().unwrap();
        assert_eq!(lease.expires_at, now + TimeDelta::seconds(90));

        store.flush().unwrap();
        let reloaded = journal::load(&guard.0, now).unwrap();
        assert_eq!(reloaded[0].expires_at, now + TimeDelta::seconds(90));
    }

    #[test]
    fn test_renew_unknown_hw() {
        let (mut store, _guard, now) = test_store("renew_missing");
        let result = store.renew(hw(1), now, Duration::from_secs(60));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_by_hw() {
        let (mut store, guard, now) = test_store("delete");
        let later = now + TimeDelta::seconds(60);
        store.upsert(hw(1), ip(1), later, None, "").unwrap();

        let freed = store.delete_by_hw(hw(1)).unwrap();
        assert_eq!(freed, ip(1));
        assert_eq!(data_lines(&guard.0), 0);

        assert!(matches!(
            store.delete_by_hw(hw(1)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_expired_reaps_only_stale_leases() {
        let (mut store, guard, now) = test_store("expire");
        store
            .upsert(hw(1), ip(1), now + TimeDelta::seconds(1), None, "")
            .unwrap();
        store
            .upsert(hw(2), ip(2), now + TimeDelta::seconds(600), None, "")
            .unwrap();

        let removed = store.delete_expired(now + TimeDelta::seconds(2)).unwrap();
        assert_eq!(removed, vec![(hw(1), ip(1))]);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(data_lines(&guard.0), 1);

        // Nothing stale: no-op, no write.
        let removed = store.delete_expired(now + TimeDelta::seconds(2)).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_reload_from_journal() {
        let path = std::env::temp_dir().join("rangelease_filestore_reload.txt");
        let _ = std::fs::remove_file(&path);
        let _guard = TestGuard(path.clone());
        let now = crate::lease::whole_seconds(Utc::now());
        let later = now + TimeDelta::seconds(300);

        {
            let mut store = FileStore::open(&path, now).unwrap();
            store.upsert(hw(1), ip(1), later, None, "").unwrap();
            store.upsert(hw(2), ip(2), later, None, "").unwrap();
        }

        let reopened = FileStore::open(&path, now).unwrap();
        let mut leases = reopened.list().unwrap();
        leases.sort_by_key(|lease| lease.ip);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hw, hw(1));
        assert_eq!(leases[0].expires_at, later);
        assert_eq!(leases[1].hw, hw(2));
    }

    #[test]
    fn test_find_queries() {
        let (mut store, _guard, now) = test_store("queries");
        let later = now + TimeDelta::seconds(60);
        let created = store
            .upsert(hw(1), ip(1), later, None, "feed-a")
            .unwrap();
        store.upsert(hw(2), ip(2), later, None, "feed-b").unwrap();

        assert_eq!(
            store.find_by_id(created.id).unwrap().unwrap().hw,
            hw(1)
        );
        assert!(store.find_by_id(999).unwrap().is_none());

        let tagged = store.find_by_feeder("feed-b").unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].hw, hw(2));

        assert!(store.get(hw(3)).unwrap().is_none());
    }
}
