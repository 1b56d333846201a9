//! Device enumeration and the per-device capability cache.
//!
//! Capabilities are probed lazily and stored as an immutable map behind an
//! `Arc`. Invalidation swaps the whole map, so a record handed out is always
//! one consistent probe.

use crate::address::{DeviceId, PropertyAddress, Scope};
use crate::bridge::{ChangeEvent, EventCallback, NotificationBridge, SubscriptionHandle};
use crate::error::{HalError, HalResult};
use crate::mutex::{read, write};
use crate::provider::HalProvider;
use crate::selector::{self, DEVICES_ADDRESS, PROBE_ADDRESSES};
use crate::session::{fetch, provider_error};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

pub type Capabilities = HashMap<PropertyAddress, bool>;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: Option<String>,
    pub capabilities: Arc<Capabilities>,
}

impl DeviceRecord {
    /// `None` when the address was not found on the device.
    pub fn settable(&self, address: &PropertyAddress) -> Option<bool> {
        self.capabilities.get(address).copied()
    }

    pub fn supports(&self, address: &PropertyAddress) -> bool {
        self.capabilities.contains_key(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub uid: Option<String>,
    pub input_streams: usize,
    pub output_streams: usize,
    pub is_input: bool,
    pub is_output: bool,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    name: Option<String>,
    capabilities: Arc<Capabilities>,
    // Set once the full probe list has been stored.
    complete: bool,
    generation: u64,
}

pub struct DeviceRegistry {
    provider: Arc<dyn HalProvider>,
    entries: RwLock<HashMap<DeviceId, Entry>>,
}

impl DeviceRegistry {
    pub fn new(provider: Arc<dyn HalProvider>) -> Self {
        Self {
            provider,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Enumerate devices in provider order and refresh the known set.
    pub fn list_devices(&self) -> HalResult<Vec<DeviceId>> {
        let value = fetch(self.provider.as_ref(), DeviceId::SYSTEM, &DEVICES_ADDRESS)?;
        let ids = value
            .as_device_ids()
            .map(<[DeviceId]>::to_vec)
            .unwrap_or_default();

        let mut entries = write(&self.entries);
        entries.retain(|id, _| ids.contains(id));
        for id in &ids {
            entries.entry(*id).or_default();
        }
        tracing::debug!("enumerated {} audio devices", ids.len());
        Ok(ids)
    }

    pub fn is_known(&self, id: DeviceId) -> bool {
        read(&self.entries).contains_key(&id)
    }

    fn ensure_known(&self, id: DeviceId) -> HalResult<()> {
        if id.is_unknown() {
            return Err(HalError::UnknownDevice(id));
        }
        if self.is_known(id) {
            return Ok(());
        }
        if self.list_devices()?.contains(&id) {
            Ok(())
        } else {
            Err(HalError::UnknownDevice(id))
        }
    }

    pub fn describe(&self, id: DeviceId) -> HalResult<DeviceRecord> {
        self.ensure_known(id)?;
        let snapshot = read(&self.entries).get(&id).cloned();
        let Some(entry) = snapshot else {
            return Err(HalError::UnknownDevice(id));
        };
        if entry.complete {
            return Ok(DeviceRecord {
                id,
                name: entry.name,
                capabilities: entry.capabilities,
            });
        }

        let name = match entry.name {
            Some(name) => Some(name),
            None => fetch(self.provider.as_ref(), id, &selector::NAME_ADDRESS)
                .ok()
                .and_then(|value| value.as_str().map(str::to_owned)),
        };
        let capabilities = Arc::new(self.probe(id));

        let mut entries = write(&self.entries);
        if let Some(current) = entries.get_mut(&id) {
            current.name = name.clone();
            if current.generation == entry.generation {
                current.capabilities = capabilities.clone();
                current.complete = true;
            } else {
                tracing::debug!("device {id} invalidated while probing, not caching");
            }
        }
        Ok(DeviceRecord {
            id,
            name,
            capabilities,
        })
    }

    fn probe(&self, id: DeviceId) -> Capabilities {
        let mut capabilities = Capabilities::new();
        for address in PROBE_ADDRESSES {
            if !self.provider.has_property(id, address) {
                continue;
            }
            let settable = self.provider.is_settable(id, address).unwrap_or(false);
            capabilities.insert(*address, settable);
        }
        tracing::debug!(
            "probed device {id}: {} of {} addresses present",
            capabilities.len(),
            PROBE_ADDRESSES.len()
        );
        capabilities
    }

    /// Cached settability, probing just this address on a miss.
    ///
    /// Global properties of the system object are answered by the provider
    /// directly, since the system object is not part of the device list.
    pub fn settable(&self, id: DeviceId, address: &PropertyAddress) -> HalResult<bool> {
        match self.ensure_known(id) {
            Ok(()) => {}
            Err(HalError::UnknownDevice(_))
                if id == DeviceId::SYSTEM && address.scope == Scope::Global =>
            {
                return self.query_settable(id, address);
            }
            Err(e) => return Err(e),
        }
        let snapshot = read(&self.entries).get(&id).cloned().unwrap_or_default();
        if let Some(settable) = snapshot.capabilities.get(address) {
            return Ok(*settable);
        }

        let settable = self.query_settable(id, address)?;

        let mut entries = write(&self.entries);
        if let Some(current) = entries.get_mut(&id) {
            if current.generation == snapshot.generation {
                let mut merged = (*current.capabilities).clone();
                merged.insert(*address, settable);
                current.capabilities = Arc::new(merged);
            }
        }
        Ok(settable)
    }

    fn query_settable(&self, id: DeviceId, address: &PropertyAddress) -> HalResult<bool> {
        if !self.provider.has_property(id, address) {
            return Err(HalError::UnsupportedProperty {
                device: id,
                address: *address,
            });
        }
        self.provider
            .is_settable(id, address)
            .map_err(|e| provider_error(e, id, address, "settability query"))
    }

    /// Drop the cached capabilities of one device. The name is kept.
    pub fn invalidate(&self, id: DeviceId) {
        if let Some(entry) = write(&self.entries).get_mut(&id) {
            entry.capabilities = Arc::default();
            entry.complete = false;
            entry.generation += 1;
        }
    }

    pub fn invalidate_all(&self) {
        let mut entries = write(&self.entries);
        for entry in entries.values_mut() {
            entry.capabilities = Arc::default();
            entry.complete = false;
            entry.generation += 1;
        }
        tracing::debug!("invalidated {} device records", entries.len());
    }

    /// Invalidate the cache and re-enumerate whenever the device list changes.
    ///
    /// The work runs on whichever thread drains `bridge`.
    pub fn watch_topology(
        self: &Arc<Self>,
        bridge: &NotificationBridge,
    ) -> HalResult<SubscriptionHandle> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let callback: EventCallback = Arc::new(move |event: &ChangeEvent| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            tracing::debug!("device topology changed ({})", event.address);
            registry.invalidate_all();
            if let Err(e) = registry.list_devices() {
                tracing::warn!("re-enumeration after topology change failed: {e}");
            }
        });
        bridge.subscribe(DeviceId::SYSTEM, DEVICES_ADDRESS, callback)
    }

    /// Name, maker, uid and stream layout. Unreadable strings are `None`.
    pub fn summary(&self, id: DeviceId) -> HalResult<DeviceSummary> {
        self.ensure_known(id)?;
        let text = |address: &PropertyAddress| {
            fetch(self.provider.as_ref(), id, address)
                .ok()
                .and_then(|value| value.as_str().map(str::to_owned))
        };
        let input_streams = self.stream_count(id, Scope::Input)?;
        let output_streams = self.stream_count(id, Scope::Output)?;
        Ok(DeviceSummary {
            id,
            name: text(&selector::NAME_ADDRESS),
            manufacturer: text(&selector::MANUFACTURER_ADDRESS),
            uid: text(&selector::UID_ADDRESS),
            input_streams,
            output_streams,
            is_input: input_streams > 0,
            is_output: output_streams > 0,
        })
    }

    fn stream_count(&self, id: DeviceId, scope: Scope) -> HalResult<usize> {
        let address = PropertyAddress::new(selector::STREAMS, scope);
        match fetch(self.provider.as_ref(), id, &address) {
            Ok(value) => Ok(value.as_device_ids().map_or(0, <[DeviceId]>::len)),
            Err(HalError::UnsupportedProperty { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }
}
