use serde::{Deserialize, Serialize};
use std::fmt;

/// Self-reported id before the device has sent one.
pub const UNKNOWN_VEHICLE_ID: i64 = -1;
/// Front sensor value before the first distance frame arrives.
pub const NO_FRONT_READING: i64 = i64::MAX;

/// Opaque transport-level reference to one physical device for one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(String);

impl DeviceHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceHandle {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Up,
    Down,
    Left,
    Right,
}

/// Logical record of one device's reported state.
///
/// Values are copied out of the store; mutation only happens inside
/// [`crate::store::VehicleStore::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    handle: DeviceHandle,
    sequence: u64,
    direction: Direction,

    /// Id reported by the device itself, [`UNKNOWN_VEHICLE_ID`] until known.
    pub id: i64,
    /// Right turn positive, range `-1.0..=1.0`.
    pub heading: f64,
    /// Forward positive, range `-1.0..=1.0`.
    pub speed: f64,
    /// Distance from the front ultrasonic sensor, [`NO_FRONT_READING`] until known.
    pub front_sensor_value: i64,
}

impl Vehicle {
    pub(crate) fn new(handle: DeviceHandle, sequence: u64, direction: Direction) -> Self {
        Self {
            handle,
            sequence,
            direction,
            id: UNKNOWN_VEHICLE_ID,
            heading: 0.0,
            speed: 0.0,
            front_sensor_value: NO_FRONT_READING,
        }
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Creation order within the store. Two values with the same sequence
    /// describe the same vehicle.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn has_front_reading(&self) -> bool {
        self.front_sensor_value != NO_FRONT_READING
    }

    pub fn reading(&self) -> VehicleReading {
        VehicleReading {
            id: self.id,
            speed: self.speed,
            heading: self.heading,
            front_sensor_value: self.front_sensor_value,
        }
    }
}

/// Per-tick values the display layer reads for a claimed vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleReading {
    pub id: i64,
    pub speed: f64,
    pub heading: f64,
    pub front_sensor_value: i64,
}

impl fmt::Display for VehicleReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.front_sensor_value == NO_FRONT_READING {
            write!(f, "v = {:.2} h = {:.2} d = -", self.speed, self.heading)
        } else {
            write!(
                f,
                "v = {:.2} h = {:.2} d = {}",
                self.speed, self.heading, self.front_sensor_value
            )
        }
    }
}
