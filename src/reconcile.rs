use crate::claims::{Allocation, ClaimAllocator, ConsumerKey};
use crate::codec::{self, DecodeError, VehicleField};
use crate::config::VanetConfig;
use crate::registry::{DeviceRegistry, DiscoveryDecision, Transition};
use crate::store::{ApplyError, StoreSnapshot, VehicleStore};
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::vehicle::{DeviceHandle, Vehicle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconcileStats {
    pub events_handled: u64,
    pub vehicles_created: u32,
    pub updates_applied: u64,
    pub unknown_channel_drops: u32,
    pub unknown_handle_drops: u32,
    pub transport_failures: u32,
    pub devices_abandoned: u32,
    pub devices_evicted: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownChannel(String),
    UnknownHandle,
    TransportFailure(TransportError),
    Stopped,
}

/// What handling one transport event did.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Ignored,
    ConnectRequested,
    DiscoveryRequested,
    VehicleCreated(Vehicle),
    Applied {
        handle: DeviceHandle,
        field: VehicleField,
    },
    Abandoned,
    Evicted {
        handle: DeviceHandle,
        released: Option<ConsumerKey>,
    },
    Dropped(DropReason),
}

/// Turns transport events into vehicle state.
///
/// This is the only caller of [`VehicleStore::create_if_absent`] and
/// [`VehicleStore::apply`]. Each notification is applied at most once;
/// resending lost frames is the transport's job.
pub struct ReconciliationLoop<T: Transport> {
    config: VanetConfig,
    registry: DeviceRegistry,
    store: Arc<VehicleStore>,
    claims: ClaimAllocator,
    transport: T,
    running: bool,
    stats: ReconcileStats,
}

impl<T: Transport> ReconciliationLoop<T> {
    pub fn new(config: VanetConfig, transport: T) -> Self {
        let registry = DeviceRegistry::new(&config);
        Self::with_registry(config, registry, transport)
    }

    pub fn with_registry(config: VanetConfig, registry: DeviceRegistry, transport: T) -> Self {
        Self {
            config,
            registry,
            store: Arc::new(VehicleStore::new()),
            claims: ClaimAllocator::new(),
            transport,
            running: false,
            stats: ReconcileStats::default(),
        }
    }

    /// Starts scanning. Events are only handled while running.
    pub fn start(&mut self) -> Result<(), TransportError> {
        info!(
            prefix = %self.config.device_name_prefix,
            service_id = %self.config.service_id,
            "starting device scan"
        );
        self.transport
            .start_scan(self.config.scan_service_filter.as_deref())?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        info!("reconciliation stopped");
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> EventOutcome {
        if !self.running {
            return EventOutcome::Dropped(DropReason::Stopped);
        }
        self.stats.events_handled += 1;

        match event {
            TransportEvent::Discovered { handle, name } => self.on_discovered(handle, name),
            TransportEvent::Connected { handle } => {
                let transition = self.registry.on_connected(&handle);
                self.follow(&handle, transition)
            }
            TransportEvent::ServicesDiscovered { handle, service_ids } => {
                let transition = self.registry.on_services_discovered(&handle, &service_ids);
                self.follow(&handle, transition)
            }
            TransportEvent::CharacteristicsDiscovered {
                handle, channels, ..
            } => {
                let transition = self.registry.on_characteristics_discovered(&handle, &channels);
                self.follow(&handle, transition)
            }
            TransportEvent::Notification {
                handle,
                channel,
                payload,
            } => self.on_notification(handle, &channel, &payload),
            TransportEvent::Disconnected { handle } => self.on_disconnected(handle),
        }
    }

    pub fn allocate(&mut self, key: &ConsumerKey) -> Allocation {
        self.claims.allocate(key, &self.store)
    }

    pub fn release(&mut self, key: &ConsumerKey) -> Option<DeviceHandle> {
        self.claims.release(key)
    }

    /// Per-tick read of every claimed vehicle.
    pub fn claimed(&self) -> Vec<(ConsumerKey, Vehicle)> {
        self.claims.claimed(&self.store)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    /// Shared read access for consumers that outlive a borrow of the loop.
    pub fn store(&self) -> Arc<VehicleStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn claims(&self) -> &ClaimAllocator {
        &self.claims
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &VanetConfig {
        &self.config
    }

    pub fn get_stats(&self) -> &ReconcileStats {
        &self.stats
    }

    fn on_discovered(&mut self, handle: DeviceHandle, name: Option<String>) -> EventOutcome {
        match self.registry.on_discovered(&handle, name.as_deref()) {
            DiscoveryDecision::Ignore => EventOutcome::Ignored,
            DiscoveryDecision::Connect => match self.transport.connect(&handle) {
                Ok(()) => {
                    self.registry.on_connect_requested(&handle);
                    EventOutcome::ConnectRequested
                }
                Err(e) => self.transport_failure(&handle, e),
            },
        }
    }

    fn follow(&mut self, handle: &DeviceHandle, transition: Transition) -> EventOutcome {
        match transition {
            Transition::Unchanged => EventOutcome::Ignored,
            Transition::DiscoverServices => match self.transport.discover_services(handle) {
                Ok(()) => EventOutcome::DiscoveryRequested,
                Err(e) => self.transport_failure(handle, e),
            },
            Transition::DiscoverCharacteristics { service_id } => {
                match self.transport.discover_characteristics(handle, &service_id) {
                    Ok(()) => EventOutcome::DiscoveryRequested,
                    Err(e) => self.transport_failure(handle, e),
                }
            }
            Transition::Abandoned => {
                self.stats.devices_abandoned += 1;
                EventOutcome::Abandoned
            }
            Transition::DeviceReady { channels } => {
                let vehicle = self
                    .store
                    .create_if_absent(handle, self.config.default_direction);
                self.stats.vehicles_created += 1;
                info!(%handle, sequence = vehicle.sequence(), "vehicle created");

                for channel in &channels {
                    if let Err(e) = self.transport.read_once(handle, channel) {
                        self.transport_failure(handle, e);
                    }
                    if let Err(e) = self.transport.subscribe(handle, channel) {
                        self.transport_failure(handle, e);
                    }
                }
                EventOutcome::VehicleCreated(vehicle)
            }
        }
    }

    fn on_notification(&mut self, handle: DeviceHandle, channel: &str, payload: &[u8]) -> EventOutcome {
        let update = match codec::decode(channel, payload) {
            Ok(update) => update,
            Err(DecodeError::UnknownChannel(key)) => {
                warn!(%handle, channel = %key, "notification on unknown channel dropped");
                self.stats.unknown_channel_drops += 1;
                return EventOutcome::Dropped(DropReason::UnknownChannel(key));
            }
            Err(e @ DecodeError::MalformedValue { .. }) => {
                // decode() resolves these to fallbacks; kept for exhaustiveness.
                warn!(%handle, error = %e, "notification dropped");
                return EventOutcome::Ignored;
            }
        };

        match self.store.apply(&handle, update) {
            Ok(()) => {
                debug!(%handle, ?update, "update applied");
                self.stats.updates_applied += 1;
                EventOutcome::Applied {
                    handle,
                    field: update.field(),
                }
            }
            Err(ApplyError::UnknownHandle(_)) => {
                warn!(%handle, channel, "update for unbound device dropped");
                self.stats.unknown_handle_drops += 1;
                EventOutcome::Dropped(DropReason::UnknownHandle)
            }
        }
    }

    fn on_disconnected(&mut self, handle: DeviceHandle) -> EventOutcome {
        if !self.registry.on_disconnected(&handle) {
            return EventOutcome::Ignored;
        }

        let removed = self.store.remove(&handle).is_some();
        let released = self.claims.release_handle(&handle);
        if let Err(e) = self.transport.unsubscribe_all(&handle) {
            self.transport_failure(&handle, e);
        }

        self.stats.devices_evicted += 1;
        info!(%handle, removed, released = ?released, "device disconnected");
        EventOutcome::Evicted { handle, released }
    }

    fn transport_failure(&mut self, handle: &DeviceHandle, error: TransportError) -> EventOutcome {
        warn!(%handle, %error, "transport request failed");
        self.stats.transport_failures += 1;
        EventOutcome::Dropped(DropReason::TransportFailure(error))
    }
}

/// Feeds events from `events` into the shared loop until the sender side
/// closes or the loop is stopped. Returns the final statistics.
pub async fn drive<T: Transport>(
    shared: Arc<Mutex<ReconciliationLoop<T>>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> ReconcileStats {
    while let Some(event) = events.recv().await {
        let mut reconciler = shared.lock().await;
        if !reconciler.is_running() {
            break;
        }
        let outcome = reconciler.handle_event(event);
        debug!(?outcome, "event handled");
    }

    let reconciler = shared.lock().await;
    reconciler.get_stats().clone()
}
