use crate::store::VehicleStore;
use crate::vehicle::{DeviceHandle, Vehicle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Consumer-chosen tracking key, e.g. the id of a placed visual entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerKey(String);

impl ConsumerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Allocation {
    Allocated(Vehicle),
    /// Every known vehicle is already claimed.
    NoneAvailable,
}

impl Allocation {
    pub fn vehicle(&self) -> Option<&Vehicle> {
        match self {
            Allocation::Allocated(vehicle) => Some(vehicle),
            Allocation::NoneAvailable => None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self, Allocation::Allocated(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClaimStats {
    pub total_allocated: u32,
    pub total_exhausted: u32,
    pub total_released: u32,
    pub total_evicted: u32,
    pub currently_claimed: u16,
}

/// Exclusive bindings from consumer keys to vehicles.
///
/// Candidates are the store's vehicles in creation order; the first one
/// without a claim wins.
#[derive(Debug, Default)]
pub struct ClaimAllocator {
    by_consumer: HashMap<ConsumerKey, DeviceHandle>,
    by_handle: HashMap<DeviceHandle, ConsumerKey>,
    stats: ClaimStats,
}

impl ClaimAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the first unclaimed vehicle for `key`. A key that already
    /// holds a claim gets its current vehicle back.
    pub fn allocate(&mut self, key: &ConsumerKey, store: &VehicleStore) -> Allocation {
        if let Some(handle) = self.by_consumer.get(key) {
            if let Some(vehicle) = store.get(handle) {
                return Allocation::Allocated(vehicle);
            }
            // Vehicle vanished without an eviction notice; drop the stale claim.
            let handle = handle.clone();
            self.remove_claim(key, &handle);
        }

        let snapshot = store.snapshot();
        let Some(vehicle) = snapshot
            .iter()
            .find(|vehicle| !self.by_handle.contains_key(vehicle.handle()))
        else {
            self.stats.total_exhausted += 1;
            return Allocation::NoneAvailable;
        };

        let handle = vehicle.handle().clone();
        debug!(consumer = %key, %handle, "claim allocated");
        self.by_consumer.insert(key.clone(), handle.clone());
        self.by_handle.insert(handle, key.clone());
        self.stats.total_allocated += 1;
        self.update_claimed_count();

        debug_assert_eq!(self.by_consumer.len(), self.by_handle.len());
        Allocation::Allocated(vehicle.clone())
    }

    /// Removes the claim held by `key`, if any.
    pub fn release(&mut self, key: &ConsumerKey) -> Option<DeviceHandle> {
        let handle = self.by_consumer.get(key)?.clone();
        self.remove_claim(key, &handle);
        self.stats.total_released += 1;
        debug!(consumer = %key, %handle, "claim released");
        Some(handle)
    }

    /// Removes the claim on an evicted vehicle, if any.
    pub fn release_handle(&mut self, handle: &DeviceHandle) -> Option<ConsumerKey> {
        let key = self.by_handle.get(handle)?.clone();
        self.remove_claim(&key, handle);
        self.stats.total_evicted += 1;
        debug!(consumer = %key, %handle, "claim dropped with evicted vehicle");
        Some(key)
    }

    pub fn claim_for(&self, key: &ConsumerKey) -> Option<&DeviceHandle> {
        self.by_consumer.get(key)
    }

    pub fn is_claimed(&self, handle: &DeviceHandle) -> bool {
        self.by_handle.contains_key(handle)
    }

    /// Every live claim with a fresh copy of its vehicle, in vehicle creation order.
    pub fn claimed(&self, store: &VehicleStore) -> Vec<(ConsumerKey, Vehicle)> {
        store
            .snapshot()
            .iter()
            .filter_map(|vehicle| {
                self.by_handle
                    .get(vehicle.handle())
                    .map(|key| (key.clone(), vehicle.clone()))
            })
            .collect()
    }

    /// Drops claims whose vehicle is no longer in `store`.
    pub fn retain_known(&mut self, store: &VehicleStore) -> usize {
        let stale: Vec<DeviceHandle> = self
            .by_handle
            .keys()
            .filter(|handle| !store.contains(handle))
            .cloned()
            .collect();
        for handle in &stale {
            self.release_handle(handle);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.by_consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_consumer.is_empty()
    }

    pub fn get_stats(&self) -> &ClaimStats {
        &self.stats
    }

    fn remove_claim(&mut self, key: &ConsumerKey, handle: &DeviceHandle) {
        self.by_consumer.remove(key);
        self.by_handle.remove(handle);
        self.update_claimed_count();
    }

    fn update_claimed_count(&mut self) {
        self.stats.currently_claimed = self.by_consumer.len() as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::Direction;

    fn store_with(handles: &[&str]) -> VehicleStore {
        let store = VehicleStore::new();
        for handle in handles {
            store.create_if_absent(&DeviceHandle::new(*handle), Direction::Up);
        }
        store
    }

    #[test]
    fn test_allocate_in_creation_order() {
        let store = store_with(&["b", "a"]);
        let mut claims = ClaimAllocator::new();

        let first = claims.allocate(&"node-1".into(), &store);
        let second = claims.allocate(&"node-2".into(), &store);

        assert_eq!(first.vehicle().unwrap().handle().as_str(), "b");
        assert_eq!(second.vehicle().unwrap().handle().as_str(), "a");
    }

    #[test]
    fn test_exhaustion_returns_none_available() {
        let store = store_with(&["a", "b"]);
        let mut claims = ClaimAllocator::new();

        let results: Vec<Allocation> = (0..5)
            .map(|i| claims.allocate(&ConsumerKey::new(format!("node-{}", i)), &store))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_allocated()).count(), 2);
        assert_eq!(
            results.iter().filter(|r| **r == Allocation::NoneAvailable).count(),
            3
        );
        assert_eq!(claims.get_stats().total_exhausted, 3);
    }

    #[test]
    fn test_same_key_keeps_its_vehicle() {
        let store = store_with(&["a", "b"]);
        let mut claims = ClaimAllocator::new();
        let key = ConsumerKey::new("node");

        let first = claims.allocate(&key, &store);
        let again = claims.allocate(&key, &store);

        assert_eq!(first, again);
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn test_release_makes_vehicle_available() {
        let store = store_with(&["a"]);
        let mut claims = ClaimAllocator::new();
        let a = ConsumerKey::new("a");
        let b = ConsumerKey::new("b");

        assert!(claims.allocate(&a, &store).is_allocated());
        assert_eq!(claims.allocate(&b, &store), Allocation::NoneAvailable);
        assert_eq!(claims.release(&a), Some(DeviceHandle::new("a")));
        assert_eq!(claims.release(&a), None);
        assert_eq!(
            claims.allocate(&b, &store).vehicle().map(|v| v.handle().clone()),
            Some(DeviceHandle::new("a"))
        );
    }

    #[test]
    fn test_eviction_releases_claim() {
        let store = store_with(&["a", "b"]);
        let mut claims = ClaimAllocator::new();
        let key = ConsumerKey::new("node");
        let _ = claims.allocate(&key, &store);

        store.remove(&DeviceHandle::new("a"));
        assert_eq!(claims.release_handle(&DeviceHandle::new("a")), Some(key.clone()));
        assert!(claims.claim_for(&key).is_none());
        assert_eq!(claims.get_stats().total_evicted, 1);
    }

    #[test]
    fn test_retain_known_drops_stale_claims() {
        let store = store_with(&["a", "b"]);
        let mut claims = ClaimAllocator::new();
        let _ = claims.allocate(&"x".into(), &store);
        let _ = claims.allocate(&"y".into(), &store);

        store.remove(&DeviceHandle::new("b"));

        assert_eq!(claims.retain_known(&store), 1);
        assert!(claims.is_claimed(&DeviceHandle::new("a")));
        assert!(!claims.is_claimed(&DeviceHandle::new("b")));
        assert_eq!(claims.claimed(&store).len(), 1);
    }
}
