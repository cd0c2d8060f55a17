//! Device discovery and connection lifecycle.
//!
//! The registry is a pure state machine: each transport callback goes in,
//! a [`DiscoveryDecision`] or [`Transition`] comes out, and the caller turns
//! that into the next transport request. Partial service or characteristic
//! lists are retried until the per-device attempt budget runs out.

use crate::codec::{CHANNEL_BINDINGS, EXPECTED_CHANNEL_COUNT};
use crate::config::VanetConfig;
use crate::vehicle::DeviceHandle;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type NameMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type ChannelList = BoundedVec<String, EXPECTED_CHANNEL_COUNT>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Discovered,
    Connecting,
    ServicesPending,
    CharacteristicsPending,
    Ready,
    /// Discovery retries exhausted; silent until the device disconnects.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryDecision {
    Connect,
    Ignore,
}

/// What the caller must do next for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    DiscoverServices,
    DiscoverCharacteristics { service_id: String },
    /// Emitted at most once per handle.
    DeviceReady { channels: ChannelList },
    Abandoned,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryStats {
    pub total_discovered: u32,
    pub total_ignored: u32,
    pub total_retries: u32,
    pub total_ready: u32,
    pub total_abandoned: u32,
    pub total_restarted: u32,
    pub total_evicted: u32,
    pub currently_known: u16,
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    name: String,
    state: DeviceState,
    attempts: u8,
    service_id: Option<String>,
}

pub struct DeviceRegistry {
    devices: HashMap<DeviceHandle, DeviceEntry>,
    matcher: NameMatcher,
    service_id: String,
    max_attempts: u8,
    stats: RegistryStats,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices)
            .field("service_id", &self.service_id)
            .field("max_attempts", &self.max_attempts)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Registry accepting devices whose name starts with the configured prefix.
    pub fn new(config: &VanetConfig) -> Self {
        let prefix = config.device_name_prefix.clone();
        Self::with_matcher(config, move |name: &str| name.starts_with(prefix.as_str()))
    }

    pub fn with_matcher<F>(config: &VanetConfig, matcher: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            devices: HashMap::new(),
            matcher: Arc::new(matcher),
            service_id: config.service_id.clone(),
            max_attempts: config.max_discovery_attempts,
            stats: RegistryStats::default(),
        }
    }

    pub fn on_discovered(&mut self, handle: &DeviceHandle, name: Option<&str>) -> DiscoveryDecision {
        let Some(name) = name.filter(|name| (self.matcher)(*name)) else {
            self.stats.total_ignored += 1;
            return DiscoveryDecision::Ignore;
        };

        match self.devices.get_mut(handle) {
            None => {
                info!(%handle, name, "discovered device");
                self.devices.insert(
                    handle.clone(),
                    DeviceEntry {
                        name: name.to_string(),
                        state: DeviceState::Discovered,
                        attempts: 0,
                        service_id: None,
                    },
                );
                self.stats.total_discovered += 1;
                self.update_known_count();
                DiscoveryDecision::Connect
            }
            Some(entry) => {
                if entry.state == DeviceState::Abandoned {
                    info!(%handle, name, "abandoned device advertised again, restarting discovery");
                    entry.state = DeviceState::Discovered;
                    entry.attempts = 0;
                    entry.service_id = None;
                    self.stats.total_restarted += 1;
                }
                DiscoveryDecision::Connect
            }
        }
    }

    /// Records that a connection request went out for `handle`.
    pub fn on_connect_requested(&mut self, handle: &DeviceHandle) {
        if let Some(entry) = self.devices.get_mut(handle) {
            if entry.state == DeviceState::Discovered {
                entry.state = DeviceState::Connecting;
            }
        }
    }

    pub fn on_connected(&mut self, handle: &DeviceHandle) -> Transition {
        let Some(entry) = self.devices.get_mut(handle) else {
            warn!(%handle, "connection reported for unknown device");
            return Transition::Unchanged;
        };

        match entry.state {
            DeviceState::Discovered | DeviceState::Connecting => {
                info!(%handle, name = %entry.name, "connected");
                entry.state = DeviceState::ServicesPending;
                Transition::DiscoverServices
            }
            _ => Transition::Unchanged,
        }
    }

    /// Handles a service list; a list without the expected service is
    /// treated as transient and re-requested.
    pub fn on_services_discovered<S: AsRef<str>>(
        &mut self,
        handle: &DeviceHandle,
        service_ids: &[S],
    ) -> Transition {
        let Some(entry) = self.devices.get(handle) else {
            warn!(%handle, "services reported for unknown device");
            return Transition::Unchanged;
        };
        if entry.state != DeviceState::ServicesPending {
            return Transition::Unchanged;
        }

        let found = service_ids
            .iter()
            .map(|id| id.as_ref())
            .find(|id| id.eq_ignore_ascii_case(&self.service_id));

        match found {
            Some(service_id) => {
                let service_id = service_id.to_string();
                if let Some(entry) = self.devices.get_mut(handle) {
                    entry.state = DeviceState::CharacteristicsPending;
                    entry.service_id = Some(service_id.clone());
                }
                debug!(%handle, %service_id, "service found");
                Transition::DiscoverCharacteristics { service_id }
            }
            None => self.retry(handle, Transition::DiscoverServices),
        }
    }

    /// Handles a characteristic list; only a list holding exactly the bound
    /// channel keys passes the gate.
    pub fn on_characteristics_discovered<S: AsRef<str>>(
        &mut self,
        handle: &DeviceHandle,
        channels: &[S],
    ) -> Transition {
        let Some(entry) = self.devices.get(handle) else {
            warn!(%handle, "characteristics reported for unknown device");
            return Transition::Unchanged;
        };
        if entry.state != DeviceState::CharacteristicsPending {
            return Transition::Unchanged;
        }

        let covers_bindings = CHANNEL_BINDINGS
            .iter()
            .all(|(key, _)| channels.iter().any(|channel| channel.as_ref().eq_ignore_ascii_case(key)));
        if channels.len() != EXPECTED_CHANNEL_COUNT || !covers_bindings {
            debug!(
                %handle,
                found = channels.len(),
                expected = EXPECTED_CHANNEL_COUNT,
                covers_bindings,
                "incomplete characteristic list"
            );
            let service_id = entry
                .service_id
                .clone()
                .unwrap_or_else(|| self.service_id.clone());
            return self.retry(handle, Transition::DiscoverCharacteristics { service_id });
        }

        let mut ready_channels = ChannelList::new();
        for channel in channels {
            // Length checked above, so this cannot overflow.
            let _ = ready_channels.push(channel.as_ref().to_ascii_lowercase());
        }

        if let Some(entry) = self.devices.get_mut(handle) {
            entry.state = DeviceState::Ready;
        }
        self.stats.total_ready += 1;
        info!(%handle, "device ready");
        Transition::DeviceReady { channels: ready_channels }
    }

    /// Evicts a device. Returns whether it was known.
    pub fn on_disconnected(&mut self, handle: &DeviceHandle) -> bool {
        match self.devices.remove(handle) {
            Some(entry) => {
                info!(%handle, name = %entry.name, state = ?entry.state, "device evicted");
                self.stats.total_evicted += 1;
                self.update_known_count();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, handle: &DeviceHandle) -> Option<DeviceState> {
        self.devices.get(handle).map(|entry| entry.state)
    }

    pub fn name(&self, handle: &DeviceHandle) -> Option<&str> {
        self.devices.get(handle).map(|entry| entry.name.as_str())
    }

    pub fn ready_handles(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices
            .iter()
            .filter(|(_, entry)| entry.state == DeviceState::Ready)
            .map(|(handle, _)| handle)
    }

    pub fn get_stats(&self) -> &RegistryStats {
        &self.stats
    }

    fn retry(&mut self, handle: &DeviceHandle, next: Transition) -> Transition {
        let Some(entry) = self.devices.get_mut(handle) else {
            return Transition::Unchanged;
        };

        entry.attempts = entry.attempts.saturating_add(1);
        if entry.attempts > self.max_attempts {
            warn!(%handle, attempts = entry.attempts, "discovery retries exhausted, abandoning device");
            entry.state = DeviceState::Abandoned;
            self.stats.total_abandoned += 1;
            return Transition::Abandoned;
        }

        debug!(%handle, attempt = entry.attempts, ?next, "re-issuing discovery");
        self.stats.total_retries += 1;
        next
    }

    fn update_known_count(&mut self) {
        self.stats.currently_known = self.devices.len() as u16;
    }
}
