//! # VANET
//!
//! Live model of vehicles whose state is streamed from wireless telemetry
//! devices. Each device exposes the same four text channels (id, speed,
//! heading, front distance); this crate discovers the devices, binds each one
//! to a logical vehicle record, decodes channel notifications into typed
//! field writes and hands vehicles out to display consumers.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tokio::sync::mpsc;
//! use vanet::simulation::{SimulatedFleet, SimulatedTransport, SimulationConfig};
//! use vanet::{ConsumerKey, ReconciliationLoop, VanetConfig};
//!
//! let fleet = Arc::new(Mutex::new(SimulatedFleet::new(SimulationConfig::reliable(1))));
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let mut reconciler =
//!     ReconciliationLoop::new(VanetConfig::default(), SimulatedTransport::new(fleet, tx));
//!
//! reconciler.start().unwrap();
//! while let Ok(event) = rx.try_recv() {
//!     reconciler.handle_event(event);
//! }
//!
//! let allocation = reconciler.allocate(&ConsumerKey::new("node-1"));
//! assert!(allocation.is_allocated());
//! ```
//!
//! ## Architecture
//!
//! - [`codec`] - channel payload decoding into [`codec::AttributeUpdate`]s
//! - [`registry`] - device discovery/connection state machine
//! - [`store`] - handle-to-vehicle map, the only mutation path for vehicle state
//! - [`claims`] - exclusive vehicle claims for display consumers
//! - [`reconcile`] - event loop tying the above to a [`transport::Transport`]
//! - [`simulation`] - deterministic fake fleet implementing the transport
//! - [`config`] - runtime settings

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod claims;
pub mod codec;
pub mod config;
pub mod reconcile;
pub mod registry;
pub mod simulation;
pub mod store;
pub mod transport;
pub mod vehicle;

// Re-export main public types for convenience
pub use claims::{Allocation, ClaimAllocator, ConsumerKey};
pub use codec::{decode, AttributeUpdate, DecodeError};
pub use config::VanetConfig;
pub use reconcile::{EventOutcome, ReconciliationLoop};
pub use registry::{DeviceRegistry, DeviceState};
pub use store::{ApplyError, VehicleStore};
pub use transport::{Transport, TransportEvent};
pub use vehicle::{DeviceHandle, Direction, Vehicle};
