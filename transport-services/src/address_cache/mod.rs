//! The live inventory of usable source addresses on the host.
//!
//! `AddressCache` is sans-IO: it is fed [`AddressEvent`]s from whatever
//! concrete [`AddressMonitor`] the embedding application chooses (a netlink
//! socket on Linux, a routing-socket listener on BSD/macOS, ...) and a
//! 1-second timer tick from the `Context`'s event loop. It never touches a
//! socket itself.

#[cfg(feature = "netlink-monitor")]
pub mod netlink;

use std::collections::HashMap;

use crate::address::{AddressRecord, AddressScope, Family, is_admissible};

/// A change reported by the host's address/route table.
#[derive(Debug, Clone)]
pub enum AddressEvent {
    Added(AddressRecord),
    Removed {
        family: Family,
        addr: std::net::IpAddr,
        ifindex: u32,
    },
}

/// The external port an `AddressMonitor` implementation provides:
/// a full dump on demand, plus a stream of deltas.
///
/// This is the "AddressMonitor" of `# 2 SYSTEM OVERVIEW` — an external
/// collaborator. The core only consumes [`AddressEvent`]s; how they are
/// produced (netlink, a routing socket, a mock for tests) is out of scope
/// for this crate's core and is a pluggable implementation detail.
pub trait AddressMonitor {
    /// A full, point-in-time dump of every address currently on the host.
    /// Called once, when the cache is initialized.
    fn snapshot(&mut self) -> Result<Vec<AddressRecord>, AddressMonitorError>;

    /// Drains whatever delta events have arrived since the last call.
    /// Returns an empty `Vec` if none are pending; never blocks.
    fn poll_events(&mut self) -> Result<Vec<AddressEvent>, AddressMonitorError>;
}

#[derive(Debug, thiserror::Error)]
#[error("address monitor error: {0}")]
pub struct AddressMonitorError(pub String);

/// A handler registered via [`AddressCache::subscribe`].
pub type Subscriber = Box<dyn FnMut(&AddressEvent) + Send>;

/// The canonical, live list of usable source addresses.
///
/// Per `# 4.1`: an `ADD` for a `(family, addr, ifindex)` already present
/// updates lifetimes in place rather than duplicating the record; a `DEL`
/// removes the matching record; every record with a finite `valid_lifetime`
/// is decremented once per tick and removed (with a synthetic
/// [`AddressEvent::Removed`] fired to subscribers) when it reaches zero.
pub struct AddressCache {
    records: HashMap<(Family, std::net::IpAddr, u32), AddressRecord>,
    subscribers: Vec<Subscriber>,
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    /// Seeds the cache from a monitor's initial snapshot. Logs and
    /// continues on a monitor error, per `# 4.1`'s failure semantics: the
    /// cache serves whatever it has, empty or not.
    pub fn bootstrap(&mut self, monitor: &mut dyn AddressMonitor) {
        match monitor.snapshot() {
            Ok(records) => {
                for record in records {
                    if !is_admissible(record.family, record.addr, record.scope) {
                        tracing::trace!(addr = %record.addr, "dropping inadmissible address record");
                        continue;
                    }
                    self.insert_or_update(record);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "address monitor snapshot failed; starting with an empty cache");
            }
        }
    }

    /// Applies one `ADD`/`REMOVE` delta from the monitor, filtering out
    /// inadmissible records (loopback, non-universe non-ULA IPv6) per
    /// `# 3 DATA MODEL`.
    pub fn apply(&mut self, event: AddressEvent) {
        match event {
            AddressEvent::Added(record) => {
                if !is_admissible(record.family, record.addr, record.scope) {
                    tracing::trace!(addr = %record.addr, "dropping inadmissible address record");
                    return;
                }
                self.insert_or_update(record);
            }
            AddressEvent::Removed {
                family,
                addr,
                ifindex,
            } => {
                self.remove(family, addr, ifindex);
            }
        }
    }

    fn insert_or_update(&mut self, record: AddressRecord) {
        let key = record.key();
        let is_new = !self.records.contains_key(&key);
        self.records.insert(key, record.clone());

        if is_new {
            self.notify(&AddressEvent::Added(record));
        }
    }

    fn remove(&mut self, family: Family, addr: std::net::IpAddr, ifindex: u32) {
        if self.records.remove(&(family, addr, ifindex)).is_some() {
            self.notify(&AddressEvent::Removed {
                family,
                addr,
                ifindex,
            });
        }
    }

    /// Advances every finite-lifetime record by one tick (`# 4.1`: intended
    /// to be called once per second by the `Context`'s event loop). Expired
    /// records are removed and a synthetic `Removed` event is emitted.
    pub fn tick(&mut self) {
        let expired: Vec<(Family, std::net::IpAddr, u32)> = self
            .records
            .iter_mut()
            .filter_map(|(key, record)| record.tick().then_some(*key))
            .collect();

        for (family, addr, ifindex) in expired {
            self.records.remove(&(family, addr, ifindex));
            self.notify(&AddressEvent::Removed {
                family,
                addr,
                ifindex,
            });
        }
    }

    fn notify(&mut self, event: &AddressEvent) {
        for subscriber in &mut self.subscribers {
            subscriber(event);
        }
    }

    /// Registers a handler invoked on every admitted `Added`/`Removed`
    /// event, including synthetic removals from lifetime expiry.
    pub fn subscribe(&mut self, handler: Subscriber) {
        self.subscribers.push(handler);
    }

    /// An immutable snapshot of every address record currently cached.
    pub fn snapshot(&self) -> Vec<AddressRecord> {
        self.records.values().cloned().collect()
    }

    /// Every cached record whose family matches `family`, used by the
    /// resolver to enumerate `(src, server)` pairs.
    pub fn matching(&self, family: Family) -> impl Iterator<Item = &AddressRecord> {
        self.records.values().filter(move |r| r.family == family)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::INFINITE_LIFETIME;
    use std::net::IpAddr;

    fn record(addr: &str, ifindex: u32, valid: u32) -> AddressRecord {
        let addr: IpAddr = addr.parse().unwrap();
        AddressRecord {
            family: Family::of(addr),
            addr,
            ifindex,
            scope: AddressScope::Universe,
            preferred_lifetime: valid,
            valid_lifetime: valid,
        }
    }

    #[test]
    fn add_of_existing_key_updates_rather_than_duplicates() {
        let mut cache = AddressCache::new();
        cache.apply(AddressEvent::Added(record("192.0.2.1", 1, 100)));
        cache.apply(AddressEvent::Added(record("192.0.2.1", 1, 50)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot()[0].valid_lifetime, 50);
    }

    #[test]
    fn del_removes_matching_record() {
        let mut cache = AddressCache::new();
        cache.apply(AddressEvent::Added(record("192.0.2.1", 1, 100)));
        cache.apply(AddressEvent::Removed {
            family: Family::V4,
            addr: "192.0.2.1".parse().unwrap(),
            ifindex: 1,
        });

        assert!(cache.is_empty());
    }

    #[test]
    fn expiry_emits_removed_and_drops_the_record() {
        let mut cache = AddressCache::new();
        cache.apply(AddressEvent::Added(record("192.0.2.1", 1, 2)));

        let removed = std::sync::Arc::new(std::sync::Mutex::new(false));
        let removed_clone = removed.clone();
        cache.subscribe(Box::new(move |event| {
            if matches!(event, AddressEvent::Removed { .. }) {
                *removed_clone.lock().unwrap() = true;
            }
        }));

        cache.tick();
        assert!(!*removed.lock().unwrap());
        assert_eq!(cache.len(), 1);

        cache.tick();
        assert!(*removed.lock().unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn infinite_lifetime_survives_many_ticks() {
        let mut cache = AddressCache::new();
        cache.apply(AddressEvent::Added(record("192.0.2.1", 1, INFINITE_LIFETIME)));

        for _ in 0..1000 {
            cache.tick();
        }

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn inadmissible_records_are_dropped_on_add() {
        let mut cache = AddressCache::new();
        cache.apply(AddressEvent::Added(record("127.0.0.1", 1, 100)));
        assert!(cache.is_empty());
    }

    struct SnapshotOnlyMonitor(Vec<AddressRecord>);

    impl AddressMonitor for SnapshotOnlyMonitor {
        fn snapshot(&mut self) -> Result<Vec<AddressRecord>, AddressMonitorError> {
            Ok(std::mem::take(&mut self.0))
        }

        fn poll_events(&mut self) -> Result<Vec<AddressEvent>, AddressMonitorError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn bootstrap_filters_inadmissible_records_same_as_apply() {
        let mut cache = AddressCache::new();
        let mut monitor = SnapshotOnlyMonitor(vec![
            record("127.0.0.1", 1, 100),
            record("192.0.2.1", 2, 100),
        ]);

        cache.bootstrap(&mut monitor);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.snapshot()[0].addr, "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn matching_filters_by_family() {
        let mut cache = AddressCache::new();
        cache.apply(AddressEvent::Added(record("192.0.2.1", 1, 100)));
        cache.apply(AddressEvent::Added(record("2001:db8::1", 2, 100)));

        assert_eq!(cache.matching(Family::V4).count(), 1);
        assert_eq!(cache.matching(Family::V6).count(), 1);
    }
}
