//! Deterministic fake fleet for running the pipeline without radio hardware.
//!
//! The fleet answers transport requests the way real devices do, including
//! the flaky parts: partial service and characteristic lists, garbage
//! frames, unrelated advertisers and devices that drop off and come back.

use crate::codec::{VehicleField, CHANNEL_BINDINGS};
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::vehicle::DeviceHandle;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

const DEFAULT_DEVICE_COUNT: usize = 3;
const DEFAULT_STRANGER_COUNT: usize = 2;
const DEFAULT_SERVICE_ID: &str = "fff0";
const UNRELATED_SERVICE_ID: &str = "180a";

// Per-request probabilities of a transient failure
const PARTIAL_SERVICES_PERCENT: f32 = 20.0;
const PARTIAL_CHARACTERISTICS_PERCENT: f32 = 25.0;
// Per-frame probability of sending garbage
const MALFORMED_FRAME_PERCENT: f32 = 2.0;
// Per-tick, per-device probability of dropping the connection
const DISCONNECT_PERCENT: f32 = 0.5;
const MIN_OFFLINE_TICKS: u32 = 3;
const MAX_OFFLINE_TICKS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub device_count: usize,
    /// Advertisers that do not match the device name prefix.
    pub stranger_count: usize,
    pub name_prefix: String,
    pub service_id: String,
    pub partial_services_percent: f32,
    pub partial_characteristics_percent: f32,
    pub malformed_frame_percent: f32,
    pub disconnect_percent: f32,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            device_count: DEFAULT_DEVICE_COUNT,
            stranger_count: DEFAULT_STRANGER_COUNT,
            name_prefix: "rasp".to_string(),
            service_id: DEFAULT_SERVICE_ID.to_string(),
            partial_services_percent: PARTIAL_SERVICES_PERCENT,
            partial_characteristics_percent: PARTIAL_CHARACTERISTICS_PERCENT,
            malformed_frame_percent: MALFORMED_FRAME_PERCENT,
            disconnect_percent: DISCONNECT_PERCENT,
            seed: 0x1234_5678_9ABC_DEF0,
        }
    }
}

impl SimulationConfig {
    /// A fleet that never misbehaves.
    pub fn reliable(device_count: usize) -> Self {
        Self {
            device_count,
            stranger_count: 0,
            partial_services_percent: 0.0,
            partial_characteristics_percent: 0.0,
            malformed_frame_percent: 0.0,
            disconnect_percent: 0.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SimulationStats {
    pub ticks: u64,
    pub advertisements: u32,
    pub partial_service_lists: u32,
    pub partial_characteristic_lists: u32,
    pub frames_sent: u64,
    pub malformed_frames: u32,
    pub disconnects: u32,
}

#[derive(Debug, Clone)]
struct SimulatedDevice {
    handle: DeviceHandle,
    name: String,
    matches_prefix: bool,
    reported_id: i64,
    speed: f64,
    heading: f64,
    distance: i64,
    connected: bool,
    subscribed: Vec<String>,
    offline_ticks: Option<u32>,
}

impl SimulatedDevice {
    fn frame(&self, field: VehicleField) -> String {
        match field {
            VehicleField::Id => format!("{}\r", self.reported_id),
            VehicleField::Speed => format!("{:.3}\r", self.speed),
            VehicleField::Heading => format!("{:.3}\r", self.heading),
            VehicleField::Distance => format!("{}\r\0", self.distance),
        }
    }
}

#[derive(Debug)]
pub struct SimulatedFleet {
    config: SimulationConfig,
    devices: Vec<SimulatedDevice>,
    scanning: bool,
    stats: SimulationStats,

    // Linear congruential generator, fixed seed for reproducible runs
    rng_state: u64,
}

impl SimulatedFleet {
    pub fn new(config: SimulationConfig) -> Self {
        let mut devices = Vec::with_capacity(config.device_count + config.stranger_count);
        for index in 0..config.device_count {
            devices.push(SimulatedDevice {
                handle: DeviceHandle::new(format!("sim-{:04x}", index + 1)),
                name: format!("{}-{:02}", config.name_prefix, index + 1),
                matches_prefix: true,
                reported_id: index as i64 + 1,
                speed: 0.0,
                heading: 0.0,
                distance: 200,
                connected: false,
                subscribed: Vec::new(),
                offline_ticks: None,
            });
        }
        for index in 0..config.stranger_count {
            devices.push(SimulatedDevice {
                handle: DeviceHandle::new(format!("ext-{:04x}", index + 1)),
                name: format!("speaker-{}", index + 1),
                matches_prefix: false,
                reported_id: -1,
                speed: 0.0,
                heading: 0.0,
                distance: 0,
                connected: false,
                subscribed: Vec::new(),
                offline_ticks: None,
            });
        }

        Self {
            rng_state: config.seed,
            config,
            devices,
            scanning: false,
            stats: SimulationStats::default(),
        }
    }

    pub fn start_scan(&mut self) -> Vec<TransportEvent> {
        self.scanning = true;
        let events: Vec<TransportEvent> = self
            .devices
            .iter()
            .filter(|device| device.offline_ticks.is_none())
            .map(|device| TransportEvent::Discovered {
                handle: device.handle.clone(),
                name: Some(device.name.clone()),
            })
            .collect();
        self.stats.advertisements += events.len() as u32;
        events
    }

    pub fn connect(&mut self, handle: &DeviceHandle) -> Result<Vec<TransportEvent>, TransportError> {
        let device = self.device_mut(handle)?;
        if device.offline_ticks.is_some() {
            return Ok(Vec::new());
        }
        device.connected = true;
        Ok(vec![TransportEvent::Connected { handle: handle.clone() }])
    }

    pub fn discover_services(&mut self, handle: &DeviceHandle) -> Result<Vec<TransportEvent>, TransportError> {
        self.connected_device(handle)?;

        let partial = self.roll(self.config.partial_services_percent);
        let mut service_ids = vec![UNRELATED_SERVICE_ID.to_string()];
        if partial {
            self.stats.partial_service_lists += 1;
        } else {
            service_ids.push(self.config.service_id.clone());
        }

        Ok(vec![TransportEvent::ServicesDiscovered {
            handle: handle.clone(),
            service_ids,
        }])
    }

    pub fn discover_characteristics(
        &mut self,
        handle: &DeviceHandle,
        service_id: &str,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        self.connected_device(handle)?;

        let available = if self.roll(self.config.partial_characteristics_percent) {
            self.stats.partial_characteristic_lists += 1;
            2
        } else {
            CHANNEL_BINDINGS.len()
        };
        let channels = CHANNEL_BINDINGS
            .iter()
            .take(available)
            .map(|(key, _)| key.to_uppercase())
            .collect();

        Ok(vec![TransportEvent::CharacteristicsDiscovered {
            handle: handle.clone(),
            service_id: service_id.to_string(),
            channels,
        }])
    }

    pub fn subscribe(&mut self, handle: &DeviceHandle, channel: &str) -> Result<Vec<TransportEvent>, TransportError> {
        let device = self.connected_device(handle)?;
        let channel = channel.to_ascii_lowercase();
        if !device.subscribed.contains(&channel) {
            device.subscribed.push(channel);
        }
        Ok(Vec::new())
    }

    pub fn read_once(&mut self, handle: &DeviceHandle, channel: &str) -> Result<Vec<TransportEvent>, TransportError> {
        let channel = channel.to_ascii_lowercase();
        let index = self.index_of(handle)?;
        if !self.devices[index].connected {
            return Err(TransportError::RequestFailed(format!("{} is not connected", handle)));
        }
        Ok(self.notification(index, &channel).into_iter().collect())
    }

    pub fn unsubscribe_all(&mut self, handle: &DeviceHandle) -> Result<Vec<TransportEvent>, TransportError> {
        self.device_mut(handle)?.subscribed.clear();
        Ok(Vec::new())
    }

    /// Advances the fleet by one step and returns the events it produced.
    pub fn tick(&mut self) -> Vec<TransportEvent> {
        self.stats.ticks += 1;
        let mut events = Vec::new();

        for index in 0..self.devices.len() {
            if !self.devices[index].matches_prefix {
                continue;
            }

            if let Some(remaining) = self.devices[index].offline_ticks {
                if remaining == 0 {
                    self.devices[index].offline_ticks = None;
                    if self.scanning {
                        self.stats.advertisements += 1;
                        let device = &self.devices[index];
                        events.push(TransportEvent::Discovered {
                            handle: device.handle.clone(),
                            name: Some(device.name.clone()),
                        });
                    }
                } else {
                    self.devices[index].offline_ticks = Some(remaining - 1);
                }
                continue;
            }

            if !self.devices[index].connected {
                continue;
            }

            if self.roll(self.config.disconnect_percent) {
                let offline = self.random_offline_ticks();
                let device = &mut self.devices[index];
                device.connected = false;
                device.subscribed.clear();
                device.offline_ticks = Some(offline);
                self.stats.disconnects += 1;
                events.push(TransportEvent::Disconnected {
                    handle: device.handle.clone(),
                });
                continue;
            }

            self.drive_device(index);
            let subscribed = self.devices[index].subscribed.clone();
            for channel in subscribed {
                events.extend(self.notification(index, &channel));
            }
        }

        events
    }

    pub fn get_stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn get_config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn connected_count(&self) -> usize {
        self.devices.iter().filter(|device| device.connected).count()
    }

    fn drive_device(&mut self, index: usize) {
        let speed_step = self.random_signed() * 0.1;
        let heading_step = self.random_signed() * 0.2;
        let distance_step = (self.random_signed() * 15.0) as i64;

        let device = &mut self.devices[index];
        device.speed = (device.speed + speed_step).clamp(-1.0, 1.0);
        device.heading = (device.heading * 0.8 + heading_step).clamp(-1.0, 1.0);
        device.distance = (device.distance + distance_step).clamp(5, 400);
    }

    fn notification(&mut self, index: usize, channel: &str) -> Option<TransportEvent> {
        let field = CHANNEL_BINDINGS
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(channel))
            .map(|&(_, field)| field)?;

        let payload = if self.roll(self.config.malformed_frame_percent) {
            self.stats.malformed_frames += 1;
            b"#?\r".to_vec()
        } else {
            self.devices[index].frame(field).into_bytes()
        };
        self.stats.frames_sent += 1;

        Some(TransportEvent::Notification {
            handle: self.devices[index].handle.clone(),
            channel: channel.to_string(),
            payload,
        })
    }

    fn index_of(&self, handle: &DeviceHandle) -> Result<usize, TransportError> {
        self.devices
            .iter()
            .position(|device| &device.handle == handle)
            .ok_or_else(|| TransportError::UnknownDevice(handle.clone()))
    }

    fn device_mut(&mut self, handle: &DeviceHandle) -> Result<&mut SimulatedDevice, TransportError> {
        let index = self.index_of(handle)?;
        Ok(&mut self.devices[index])
    }

    fn connected_device(&mut self, handle: &DeviceHandle) -> Result<&mut SimulatedDevice, TransportError> {
        let device = self.device_mut(handle)?;
        if device.connected {
            Ok(device)
        } else {
            Err(TransportError::RequestFailed(format!("{} is not connected", handle)))
        }
    }

    fn roll(&mut self, percent: f32) -> bool {
        percent > 0.0 && self.random_float() < f64::from(percent) / 100.0
    }

    fn random_offline_ticks(&mut self) -> u32 {
        let range = MAX_OFFLINE_TICKS - MIN_OFFLINE_TICKS;
        MIN_OFFLINE_TICKS + (self.next_random() >> 33) as u32 % range
    }

    fn next_random(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.rng_state
    }

    /// Uniform in `0.0..1.0`.
    fn random_float(&mut self) -> f64 {
        (self.next_random() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in `-1.0..1.0`.
    fn random_signed(&mut self) -> f64 {
        self.random_float() * 2.0 - 1.0
    }
}

/// [`Transport`] backed by a shared [`SimulatedFleet`]; completions are
/// posted to an unbounded event channel.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    fleet: Arc<Mutex<SimulatedFleet>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl SimulatedTransport {
    pub fn new(fleet: Arc<Mutex<SimulatedFleet>>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { fleet, events }
    }

    fn post<F>(&self, request: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut SimulatedFleet) -> Result<Vec<TransportEvent>, TransportError>,
    {
        let produced = {
            let mut fleet = self.fleet.lock().unwrap_or_else(PoisonError::into_inner);
            request(&mut *fleet)?
        };
        for event in produced {
            self.events
                .send(event)
                .map_err(|_| TransportError::RequestFailed("event channel closed".to_string()))?;
        }
        Ok(())
    }
}

impl Transport for SimulatedTransport {
    fn start_scan(&mut self, _service_filter: Option<&str>) -> Result<(), TransportError> {
        self.post(|fleet| Ok(fleet.start_scan()))
    }

    fn connect(&mut self, handle: &DeviceHandle) -> Result<(), TransportError> {
        self.post(|fleet| fleet.connect(handle))
    }

    fn discover_services(&mut self, handle: &DeviceHandle) -> Result<(), TransportError> {
        self.post(|fleet| fleet.discover_services(handle))
    }

    fn discover_characteristics(&mut self, handle: &DeviceHandle, service_id: &str) -> Result<(), TransportError> {
        self.post(|fleet| fleet.discover_characteristics(handle, service_id))
    }

    fn subscribe(&mut self, handle: &DeviceHandle, channel: &str) -> Result<(), TransportError> {
        self.post(|fleet| fleet.subscribe(handle, channel))
    }

    fn read_once(&mut self, handle: &DeviceHandle, channel: &str) -> Result<(), TransportError> {
        self.post(|fleet| fleet.read_once(handle, channel))
    }

    fn unsubscribe_all(&mut self, handle: &DeviceHandle) -> Result<(), TransportError> {
        self.post(|fleet| fleet.unsubscribe_all(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_fleet() -> (SimulatedFleet, DeviceHandle) {
        let mut fleet = SimulatedFleet::new(SimulationConfig::reliable(1));
        let handle = DeviceHandle::new("sim-0001");
        fleet.start_scan();
        fleet.connect(&handle).unwrap();
        (fleet, handle)
    }

    #[test]
    fn test_scan_advertises_every_device() {
        let config = SimulationConfig {
            stranger_count: 2,
            ..SimulationConfig::reliable(3)
        };
        let mut fleet = SimulatedFleet::new(config);

        let events = fleet.start_scan();
        assert_eq!(events.len(), 5);
        let strangers = events
            .iter()
            .filter(|event| match event {
                TransportEvent::Discovered { name, .. } => {
                    name.as_deref().map_or(false, |n| n.starts_with("speaker"))
                }
                _ => false,
            })
            .count();
        assert_eq!(strangers, 2);
    }

    #[test]
    fn test_reliable_discovery_is_complete() {
        let (mut fleet, handle) = connected_fleet();

        match &fleet.discover_services(&handle).unwrap()[0] {
            TransportEvent::ServicesDiscovered { service_ids, .. } => {
                assert!(service_ids.iter().any(|id| id == "fff0"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &fleet.discover_characteristics(&handle, "fff0").unwrap()[0] {
            TransportEvent::CharacteristicsDiscovered { channels, .. } => {
                assert_eq!(channels.len(), 4);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_flaky_characteristics_are_partial() {
        let config = SimulationConfig {
            partial_characteristics_percent: 100.0,
            ..SimulationConfig::reliable(1)
        };
        let mut fleet = SimulatedFleet::new(config);
        let handle = DeviceHandle::new("sim-0001");
        fleet.connect(&handle).unwrap();

        match &fleet.discover_characteristics(&handle, "fff0").unwrap()[0] {
            TransportEvent::CharacteristicsDiscovered { channels, .. } => {
                assert_eq!(channels.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(fleet.get_stats().partial_characteristic_lists, 1);
    }

    #[test]
    fn test_tick_notifies_subscribed_channels() {
        let (mut fleet, handle) = connected_fleet();
        fleet.subscribe(&handle, "FFF2").unwrap();
        fleet.subscribe(&handle, "fff4").unwrap();

        let events = fleet.tick();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, TransportEvent::Notification { .. })));
    }

    #[test]
    fn test_read_once_produces_frame() {
        let (mut fleet, handle) = connected_fleet();

        let events = fleet.read_once(&handle, "fff1").unwrap();
        assert_eq!(
            events,
            vec![TransportEvent::Notification {
                handle,
                channel: "fff1".to_string(),
                payload: b"1\r".to_vec(),
            }]
        );
    }

    #[test]
    fn test_requests_for_unknown_device_fail() {
        let mut fleet = SimulatedFleet::new(SimulationConfig::reliable(1));
        let ghost = DeviceHandle::new("ghost");

        assert_eq!(
            fleet.connect(&ghost),
            Err(TransportError::UnknownDevice(ghost.clone()))
        );
        assert!(fleet.discover_services(&DeviceHandle::new("sim-0001")).is_err());
    }

    #[test]
    fn test_random_float_range() {
        let mut fleet = SimulatedFleet::new(SimulationConfig::default());
        for _ in 0..1000 {
            let value = fleet.random_float();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_transport_posts_events() {
        let fleet = Arc::new(Mutex::new(SimulatedFleet::new(SimulationConfig::reliable(2))));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::new(fleet, tx);

        transport.start_scan(None).unwrap();

        let mut discovered = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, TransportEvent::Discovered { .. }));
            discovered += 1;
        }
        assert_eq!(discovered, 2);
    }
}
