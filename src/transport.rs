//! Interface to the wireless transport.
//!
//! Every request is fire-and-forget: completions come back later as
//! [`TransportEvent`]s on the caller's event stream.

use crate::vehicle::DeviceHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    Discovered {
        handle: DeviceHandle,
        name: Option<String>,
    },
    Connected {
        handle: DeviceHandle,
    },
    ServicesDiscovered {
        handle: DeviceHandle,
        service_ids: Vec<String>,
    },
    CharacteristicsDiscovered {
        handle: DeviceHandle,
        service_id: String,
        channels: Vec<String>,
    },
    Notification {
        handle: DeviceHandle,
        channel: String,
        payload: Vec<u8>,
    },
    Disconnected {
        handle: DeviceHandle,
    },
}

impl TransportEvent {
    pub fn handle(&self) -> &DeviceHandle {
        match self {
            TransportEvent::Discovered { handle, .. }
            | TransportEvent::Connected { handle }
            | TransportEvent::ServicesDiscovered { handle, .. }
            | TransportEvent::CharacteristicsDiscovered { handle, .. }
            | TransportEvent::Notification { handle, .. }
            | TransportEvent::Disconnected { handle } => handle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not powered on")]
    NotReady,
    #[error("device {0} is not known to the transport")]
    UnknownDevice(DeviceHandle),
    #[error("request failed: {0}")]
    RequestFailed(String),
}

pub trait Transport {
    fn start_scan(&mut self, service_filter: Option<&str>) -> Result<(), TransportError>;
    fn connect(&mut self, handle: &DeviceHandle) -> Result<(), TransportError>;
    fn discover_services(&mut self, handle: &DeviceHandle) -> Result<(), TransportError>;
    fn discover_characteristics(
        &mut self,
        handle: &DeviceHandle,
        service_id: &str,
    ) -> Result<(), TransportError>;
    fn subscribe(&mut self, handle: &DeviceHandle, channel: &str) -> Result<(), TransportError>;
    /// Requests the current value once; it arrives as a notification.
    fn read_once(&mut self, handle: &DeviceHandle, channel: &str) -> Result<(), TransportError>;
    /// Drops every subscription of a disconnected device.
    fn unsubscribe_all(&mut self, handle: &DeviceHandle) -> Result<(), TransportError>;
}
