use crate::codec::{AttributeUpdate, VehicleField};
use crate::vehicle::{DeviceHandle, Direction, Vehicle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("no vehicle bound to device {0}")]
    UnknownHandle(DeviceHandle),
}

#[derive(Debug, Default)]
struct StoreInner {
    vehicles: HashMap<DeviceHandle, Vehicle>,
    next_sequence: u64,
}

/// Handle-to-vehicle map and the only mutation path for vehicle state.
///
/// One lock guards the whole map, so every `apply` is serialized and a
/// snapshot never observes a half-written record.
#[derive(Debug, Default)]
pub struct VehicleStore {
    inner: RwLock<StoreInner>,
}

impl VehicleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the vehicle bound to `handle`, creating it with default
    /// values if absent. `direction` only applies on creation.
    pub fn create_if_absent(&self, handle: &DeviceHandle, direction: Direction) -> Vehicle {
        let mut inner = self.write();
        if let Some(existing) = inner.vehicles.get(handle) {
            return existing.clone();
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let vehicle = Vehicle::new(handle.clone(), sequence, direction);
        inner.vehicles.insert(handle.clone(), vehicle.clone());
        vehicle
    }

    /// Writes the single field named by `update`. Never creates a vehicle.
    ///
    /// Speed and heading are clamped into `-1.0..=1.0`; non-finite values
    /// are written as `0.0`.
    pub fn apply(&self, handle: &DeviceHandle, update: AttributeUpdate) -> Result<(), ApplyError> {
        let update = update.normalized();
        let mut inner = self.write();
        let vehicle = inner
            .vehicles
            .get_mut(handle)
            .ok_or_else(|| ApplyError::UnknownHandle(handle.clone()))?;

        match update {
            AttributeUpdate::Id(id) => vehicle.id = id,
            AttributeUpdate::Speed(speed) => vehicle.speed = speed,
            AttributeUpdate::Heading(heading) => vehicle.heading = heading,
            AttributeUpdate::Distance(distance) => vehicle.front_sensor_value = distance,
        }

        debug_assert!(
            (-1.0..=1.0).contains(&vehicle.speed) && (-1.0..=1.0).contains(&vehicle.heading),
            "speed {} / heading {} out of range after {:?} update",
            vehicle.speed,
            vehicle.heading,
            update.field()
        );
        Ok(())
    }

    pub fn get(&self, handle: &DeviceHandle) -> Option<Vehicle> {
        self.read().vehicles.get(handle).cloned()
    }

    pub fn contains(&self, handle: &DeviceHandle) -> bool {
        self.read().vehicles.contains_key(handle)
    }

    /// Drops the vehicle of an evicted device.
    pub fn remove(&self, handle: &DeviceHandle) -> Option<Vehicle> {
        self.write().vehicles.remove(handle)
    }

    pub fn len(&self) -> usize {
        self.read().vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().vehicles.is_empty()
    }

    /// Point-in-time copy of every vehicle, ordered by creation.
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut vehicles: Vec<Vehicle> = self.read().vehicles.values().cloned().collect();
        vehicles.sort_by_key(Vehicle::sequence);
        StoreSnapshot { vehicles }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        // Writes are single-field assignments, so poisoning is harmless.
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreSnapshot {
    vehicles: Vec<Vehicle>,
}

impl StoreSnapshot {
    pub fn get(&self, handle: &DeviceHandle) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.handle() == handle)
    }

    /// Vehicles in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.iter()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    pub fn field_value(&self, handle: &DeviceHandle, field: VehicleField) -> Option<f64> {
        self.get(handle).map(|v| match field {
            VehicleField::Id => v.id as f64,
            VehicleField::Speed => v.speed,
            VehicleField::Heading => v.heading,
            VehicleField::Distance => v.front_sensor_value as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::{NO_FRONT_READING, UNKNOWN_VEHICLE_ID};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_create_if_absent_is_idempotent() {
        let store = VehicleStore::new();
        let handle = DeviceHandle::new("D1");

        let first = store.create_if_absent(&handle, Direction::Up);
        let second = store.create_if_absent(&handle, Direction::Down);

        assert_eq!(first.sequence(), second.sequence());
        assert_eq!(second.direction(), Direction::Up);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_apply_updates_single_field() {
        let store = VehicleStore::new();
        let handle = DeviceHandle::new("D1");
        store.create_if_absent(&handle, Direction::Up);

        store.apply(&handle, AttributeUpdate::Speed(0.75)).unwrap();

        let vehicle = store.get(&handle).unwrap();
        assert_eq!(vehicle.speed, 0.75);
        assert_eq!(vehicle.heading, 0.0);
        assert_eq!(vehicle.id, UNKNOWN_VEHICLE_ID);
        assert_eq!(vehicle.front_sensor_value, NO_FRONT_READING);
    }

    #[test]
    fn test_apply_bounds_out_of_range_values() {
        let store = VehicleStore::new();
        let handle = DeviceHandle::new("D1");
        store.create_if_absent(&handle, Direction::Up);

        store.apply(&handle, AttributeUpdate::Speed(1.5)).unwrap();
        store.apply(&handle, AttributeUpdate::Heading(-3.0)).unwrap();
        let vehicle = store.get(&handle).unwrap();
        assert_eq!(vehicle.speed, 1.0);
        assert_eq!(vehicle.heading, -1.0);

        store.apply(&handle, AttributeUpdate::Speed(f64::NAN)).unwrap();
        store.apply(&handle, AttributeUpdate::Heading(f64::INFINITY)).unwrap();
        let vehicle = store.get(&handle).unwrap();
        assert_eq!(vehicle.speed, 0.0);
        assert_eq!(vehicle.heading, 0.0);
        assert_eq!(vehicle.id, UNKNOWN_VEHICLE_ID);
    }

    #[test]
    fn test_apply_unknown_handle_creates_nothing() {
        let store = VehicleStore::new();
        let handle = DeviceHandle::new("ghost");

        let result = store.apply(&handle, AttributeUpdate::Id(9));

        assert_eq!(result, Err(ApplyError::UnknownHandle(handle.clone())));
        assert!(store.is_empty());
        assert!(!store.contains(&handle));
    }

    #[test]
    fn test_apply_after_remove_fails() {
        let store = VehicleStore::new();
        let handle = DeviceHandle::new("D1");
        store.create_if_absent(&handle, Direction::Up);

        assert!(store.remove(&handle).is_some());
        assert!(store.apply(&handle, AttributeUpdate::Distance(10)).is_err());
    }

    #[test]
    fn test_snapshot_ordered_by_creation() {
        let store = VehicleStore::new();
        for name in ["zeta", "alpha", "mid"] {
            store.create_if_absent(&DeviceHandle::new(name), Direction::Up);
        }

        let snapshot = store.snapshot();
        let order: Vec<&str> = snapshot.iter().map(|v| v.handle().as_str()).collect();
        assert_eq!(order, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            snapshot.field_value(&DeviceHandle::new("mid"), VehicleField::Speed),
            Some(0.0)
        );
    }

    #[test]
    fn test_concurrent_apply_keeps_records_separate() {
        let store = Arc::new(VehicleStore::new());
        let left = DeviceHandle::new("left");
        let right = DeviceHandle::new("right");
        store.create_if_absent(&left, Direction::Left);
        store.create_if_absent(&right, Direction::Right);

        let workers: Vec<_> = [(left.clone(), 1_i64), (right.clone(), 2_i64)]
            .into_iter()
            .map(|(handle, id)| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for distance in 0..500 {
                        store.apply(&handle, AttributeUpdate::Id(id)).unwrap();
                        store.apply(&handle, AttributeUpdate::Distance(distance)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.get(&left).unwrap().id, 1);
        assert_eq!(snapshot.get(&right).unwrap().id, 2);
        assert_eq!(snapshot.get(&left).unwrap().front_sensor_value, 499);
        assert_eq!(snapshot.get(&right).unwrap().front_sensor_value, 499);
    }
}
