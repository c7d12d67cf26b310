//! Published offers and the claim operation.

use super::{Fd, Pid, Process};
use crate::error::{Error, Result};
use crate::memory::{Region, RegionHandle, RegionId};
use crate::observability;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

/// Publisher-chosen name for an offer.
///
/// The single handoff slot of a one-producer/one-consumer setup is
/// [`HandoffKey::DEFAULT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandoffKey(u64);

impl HandoffKey {
    /// The default slot.
    pub const DEFAULT: HandoffKey = HandoffKey(0);

    /// A specific slot.
    pub const fn new(key: u64) -> Self {
        Self(key)
    }

    /// The raw key.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl Default for HandoffKey {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for HandoffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key {}", self.0)
    }
}

/// One published region.
///
/// The offer does not keep the region alive: the publisher stays
/// responsible for its own reference.
#[derive(Debug, Clone)]
struct Offer {
    region: Weak<Region>,
    id: RegionId,
    publisher: Pid,
}

/// Table of published regions, keyed by [`HandoffKey`].
///
/// The lock covers only reading and writing offers; the slower installation
/// into the claimer's table happens after it is released.
///
/// # Example
///
/// ```rust
/// use ashfile::ServiceConfig;
/// use ashfile::handoff::{HandoffKey, HandoffRegistry, Pid, Process};
/// use ashfile::memory::RegionStore;
///
/// let config = ServiceConfig::testing();
/// let store = RegionStore::new(&config);
/// let registry = HandoffRegistry::new();
/// let producer = Process::new(Pid::from_raw(1), &config);
/// let consumer = Process::new(Pid::from_raw(2), &config);
///
/// let region = store.create("shared", 4096).unwrap();
/// registry.publish(HandoffKey::DEFAULT, &producer, &region);
///
/// let fd = registry.claim(&consumer, HandoffKey::DEFAULT).unwrap();
/// assert_eq!(consumer.resolve(fd).unwrap().id(), region.id());
/// ```
#[derive(Debug, Default)]
pub struct HandoffRegistry {
    offers: Mutex<HashMap<HandoffKey, Offer>>,
}

impl HandoffRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn offers(&self) -> MutexGuard<'_, HashMap<HandoffKey, Offer>> {
        self.offers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer `region` under `key`, replacing any previous offer.
    pub fn publish(&self, key: HandoffKey, publisher: &Process, region: &RegionHandle) {
        let offer = Offer {
            region: RegionHandle::downgrade(region),
            id: region.id(),
            publisher: publisher.pid(),
        };
        let previous = self.offers().insert(key, offer);
        observability::record_published();
        tracing::debug!(
            %key,
            region = %region.id(),
            pid = %publisher.pid(),
            replaced = previous.is_some(),
            "region published"
        );
    }

    /// Install the region offered under `key` into the caller's own table.
    ///
    /// The new handle is close-on-exec. The offer stays in place, so every
    /// claim until the next publish observes the same region.
    pub fn claim(&self, caller: &Process, key: HandoffKey) -> Result<Fd> {
        let offer = self
            .offers()
            .get(&key)
            .cloned()
            .ok_or(Error::NoResourcePublished)?;
        let region = offer.region.upgrade().ok_or(Error::NotFound(offer.id))?;

        let table = caller.table();
        let fd = table.alloc()?;
        if let Err(e) = table.install(fd, region, true) {
            table.unreserve(fd);
            return Err(e);
        }
        observability::record_claimed();

        tracing::debug!(
            %key,
            region = %offer.id,
            publisher = %offer.publisher,
            pid = %caller.pid(),
            fd = fd.as_raw(),
            "handoff claimed"
        );
        Ok(fd)
    }

    /// Remove the offer under `key`. Returns true if there was one.
    pub fn withdraw(&self, key: HandoffKey) -> bool {
        self.offers().remove(&key).is_some()
    }

    /// True if something is published under `key`.
    pub fn is_published(&self, key: HandoffKey) -> bool {
        self.offers().contains_key(&key)
    }

    /// Who published the current offer under `key`.
    pub fn publisher(&self, key: HandoffKey) -> Option<Pid> {
        self.offers().get(&key).map(|offer| offer.publisher)
    }

    /// Id of the region currently offered under `key`.
    pub fn offered(&self, key: HandoffKey) -> Option<RegionId> {
        self.offers().get(&key).map(|offer| offer.id)
    }

    /// Drop every offer.
    pub fn clear(&self) {
        self.offers().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::memory::RegionStore;
    use std::sync::Arc;
    use std::thread;

    fn setup() -> (ServiceConfig, RegionStore, HandoffRegistry) {
        let config = ServiceConfig::testing();
        let store = RegionStore::new(&config);
        (config, store, HandoffRegistry::new())
    }

    #[test]
    fn test_claim_without_publish() {
        let (config, _store, registry) = setup();
        let consumer = Process::new(Pid::from_raw(2), &config);
        assert!(matches!(
            registry.claim(&consumer, HandoffKey::DEFAULT),
            Err(Error::NoResourcePublished)
        ));
        assert!(consumer.table().is_empty());
    }

    #[test]
    fn test_repeated_claims_share_region() {
        let (config, store, registry) = setup();
        let producer = Process::new(Pid::from_raw(1), &config);
        let consumer = Process::new(Pid::from_raw(2), &config);
        let region = store.create("shared", 4096).unwrap();
        registry.publish(HandoffKey::DEFAULT, &producer, &region);

        let a = registry.claim(&consumer, HandoffKey::DEFAULT).unwrap();
        let b = registry.claim(&consumer, HandoffKey::DEFAULT).unwrap();
        assert_ne!(a, b);
        assert!(Arc::ptr_eq(&consumer.resolve(a).unwrap(), &region));
        assert!(Arc::ptr_eq(&consumer.resolve(b).unwrap(), &region));
        assert!(consumer.table().is_cloexec(a).unwrap());
        assert_eq!(registry.publisher(HandoffKey::DEFAULT), Some(producer.pid()));
    }

    #[test]
    fn test_publish_overwrites() {
        let (config, store, registry) = setup();
        let producer = Process::new(Pid::from_raw(1), &config);
        let consumer = Process::new(Pid::from_raw(2), &config);
        let first = store.create("first", 4096).unwrap();
        let second = store.create("second", 4096).unwrap();

        registry.publish(HandoffKey::DEFAULT, &producer, &first);
        registry.publish(HandoffKey::DEFAULT, &producer, &second);
        let fd = registry.claim(&consumer, HandoffKey::DEFAULT).unwrap();
        assert_eq!(consumer.resolve(fd).unwrap().id(), second.id());
    }

    #[test]
    fn test_keys_are_independent() {
        let (config, store, registry) = setup();
        let producer = Process::new(Pid::from_raw(1), &config);
        let consumer = Process::new(Pid::from_raw(2), &config);
        let a = store.create("a", 4096).unwrap();
        let b = store.create("b", 4096).unwrap();

        registry.publish(HandoffKey::new(1), &producer, &a);
        registry.publish(HandoffKey::new(2), &producer, &b);

        let fd = registry.claim(&consumer, HandoffKey::new(2)).unwrap();
        assert_eq!(consumer.resolve(fd).unwrap().id(), b.id());
        assert!(matches!(
            registry.claim(&consumer, HandoffKey::DEFAULT),
            Err(Error::NoResourcePublished)
        ));

        assert!(registry.withdraw(HandoffKey::new(1)));
        assert!(!registry.is_published(HandoffKey::new(1)));
    }

    #[test]
    fn test_claim_after_release_not_found() {
        let (config, store, registry) = setup();
        let producer = Process::new(Pid::from_raw(1), &config);
        let consumer = Process::new(Pid::from_raw(2), &config);
        let region = store.create("gone", 4096).unwrap();
        registry.publish(HandoffKey::DEFAULT, &producer, &region);
        store.release(region);

        assert!(matches!(
            registry.claim(&consumer, HandoffKey::DEFAULT),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_claim_at_ceiling() {
        let (config, store, registry) = setup();
        let producer = Process::new(Pid::from_raw(1), &config);
        let consumer = Process::with_limits(Pid::from_raw(2), 1, 1);
        let region = store.create("full", 4096).unwrap();
        consumer.table().open(Arc::clone(&region), false).unwrap();
        registry.publish(HandoffKey::DEFAULT, &producer, &region);

        assert!(matches!(
            registry.claim(&consumer, HandoffKey::DEFAULT),
            Err(Error::TooManyOpenHandles { limit: 1 })
        ));
        assert_eq!(consumer.table().len(), 1);
        assert_eq!(store.len(), 1);
        assert!(registry.is_published(HandoffKey::DEFAULT));
    }

    #[test]
    fn test_concurrent_publish_and_claim() {
        let (config, store, registry) = setup();
        let registry = Arc::new(registry);
        let producer = Arc::new(Process::new(Pid::from_raw(1), &config));
        let regions: Vec<_> = (0..4)
            .map(|i| store.create(&format!("r{i}"), 4096).unwrap())
            .collect();
        let ids: Vec<_> = regions.iter().map(|r| r.id()).collect();
        registry.publish(HandoffKey::DEFAULT, &producer, &regions[0]);

        let publisher = {
            let registry = Arc::clone(&registry);
            let producer = Arc::clone(&producer);
            let regions = regions.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    registry.publish(HandoffKey::DEFAULT, &producer, &regions[i % 4]);
                }
            })
        };

        let claimers: Vec<_> = (0..4)
            .map(|n| {
                let registry = Arc::clone(&registry);
                let ids = ids.clone();
                thread::spawn(move || {
                    let consumer = Process::with_limits(Pid::from_raw(10 + n), 8, 1000);
                    for _ in 0..100 {
                        let fd = registry.claim(&consumer, HandoffKey::DEFAULT).unwrap();
                        let region = consumer.table().close(fd).unwrap();
                        assert!(ids.contains(&region.id()));
                    }
                })
            })
            .collect();

        publisher.join().unwrap();
        for c in claimers {
            c.join().unwrap();
        }
    }
}
