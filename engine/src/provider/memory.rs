//! An in-process stand-in for the HAL.
//!
//! Objects hold raw property cells exactly as the HAL would hand them out, so
//! everything above the provider boundary (size queries, short reads, codec,
//! listeners) runs the same code path as against CoreAudio. Used by the test
//! suite and by the command-line `--simulated` mode.

use super::{HalProvider, ListenerFn, ListenerToken, ProviderError};
use crate::address::{DeviceId, PropertyAddress, Scope};
use crate::codec::{self, PropertyValue, StreamFormat};
use crate::error::{HalResult, ILLEGAL_OPERATION};
use crate::mutex::lock;
use crate::selector::{self, DEVICES_ADDRESS};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct Cell {
    bytes: Vec<u8>,
    settable: bool,
    reject_status: Option<i32>,
    short_by: usize,
}

impl Cell {
    fn read_only(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            settable: false,
            reject_status: None,
            short_by: 0,
        }
    }
}

fn store(props: &mut HashMap<PropertyAddress, Cell>, address: PropertyAddress, bytes: Vec<u8>) {
    match props.get_mut(&address) {
        Some(cell) => cell.bytes = bytes,
        None => {
            props.insert(address, Cell::read_only(bytes));
        }
    }
}

#[derive(Default)]
struct State {
    objects: HashMap<DeviceId, HashMap<PropertyAddress, Cell>>,
    listeners: HashMap<u64, (DeviceId, PropertyAddress, ListenerFn)>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub size_queries: usize,
    pub reads: usize,
    pub writes: usize,
    pub settable_queries: usize,
}

pub struct MemoryProvider {
    state: Mutex<State>,
    next_token: AtomicU64,
    size_queries: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    settable_queries: AtomicUsize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// A HAL with only the system object and an empty device list.
    pub fn new() -> Self {
        let provider = Self {
            state: Mutex::new(State::default()),
            next_token: AtomicU64::new(1),
            size_queries: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            settable_queries: AtomicUsize::new(0),
        };
        {
            let mut state = lock(&provider.state);
            let system = state.objects.entry(DeviceId::SYSTEM).or_default();
            system.insert(DEVICES_ADDRESS, Cell::read_only(Vec::new()));
        }
        provider
    }

    /// Two devices resembling a laptop: built-in speakers and a USB interface.
    pub fn demo() -> Self {
        let provider = Self::new();
        let speakers = DeviceId(73);
        let usb = DeviceId(81);
        for (id, name, maker, uid, channels) in [
            (speakers, "MacBook Pro Speakers", "Apple Inc.", "BuiltInSpeakerDevice", 2u32),
            (usb, "USB Audio Interface", "Focusrite", "AppleUSBAudioEngine:1", 4u32),
        ] {
            provider.add_device(id);
            let _ = provider.set_value(
                id,
                selector::NAME_ADDRESS,
                &PropertyValue::CString(name.into()),
            );
            let _ = provider.set_value(
                id,
                selector::MANUFACTURER_ADDRESS,
                &PropertyValue::CString(maker.into()),
            );
            let _ = provider.set_value(
                id,
                selector::UID_ADDRESS,
                &PropertyValue::CString(uid.into()),
            );
            let _ = provider.set_value(
                id,
                selector::SAMPLE_RATE_ADDRESS,
                &PropertyValue::Float64(48_000.0),
            );
            provider.set_settable(id, selector::SAMPLE_RATE_ADDRESS, true);
            let format = StreamFormat::float32_interleaved(48_000.0, channels);
            let _ = provider.set_value(
                id,
                PropertyAddress::new(selector::STREAM_FORMAT, Scope::Output),
                &PropertyValue::StreamFormat(format),
            );
            let _ = provider.set_value(
                id,
                PropertyAddress::new(selector::STREAMS, Scope::Output),
                &PropertyValue::DeviceIdList(vec![DeviceId(id.0 + 1)]),
            );
            for element in 0..=channels {
                let volume = selector::OUTPUT_VOLUME_ADDRESS.with_element(element);
                let _ = provider.set_value(id, volume, &PropertyValue::Float64(0.5));
                provider.set_settable(id, volume, true);
            }
            let _ = provider.set_value(
                id,
                selector::OUTPUT_MUTE_ADDRESS,
                &PropertyValue::Int32(0),
            );
            provider.set_settable(id, selector::OUTPUT_MUTE_ADDRESS, true);
        }
        let _ = provider.set_value(
            usb,
            PropertyAddress::new(selector::STREAMS, Scope::Input),
            &PropertyValue::DeviceIdList(vec![DeviceId(90)]),
        );
        let _ = provider.set_value(
            DeviceId::SYSTEM,
            selector::DEFAULT_OUTPUT_ADDRESS,
            &PropertyValue::Int32(speakers.0 as i32),
        );
        provider.set_settable(DeviceId::SYSTEM, selector::DEFAULT_OUTPUT_ADDRESS, true);
        let _ = provider.set_value(
            DeviceId::SYSTEM,
            selector::DEFAULT_INPUT_ADDRESS,
            &PropertyValue::Int32(usb.0 as i32),
        );
        provider.set_settable(DeviceId::SYSTEM, selector::DEFAULT_INPUT_ADDRESS, true);
        provider
    }

    /// Append a device to the system device list and fire `devices`.
    pub fn add_device(&self, id: DeviceId) {
        {
            let mut state = lock(&self.state);
            state.objects.entry(id).or_default();
            let ids = Self::device_ids(&state);
            if !ids.contains(&id) {
                let mut ids = ids;
                ids.push(id);
                Self::store_device_ids(&mut state, &ids);
            }
        }
        self.notify(DeviceId::SYSTEM, DEVICES_ADDRESS);
    }

    /// Remove a device and all its properties, then fire `devices`.
    pub fn remove_device(&self, id: DeviceId) {
        {
            let mut state = lock(&self.state);
            if id != DeviceId::SYSTEM {
                state.objects.remove(&id);
            }
            let ids: Vec<DeviceId> = Self::device_ids(&state)
                .into_iter()
                .filter(|existing| *existing != id)
                .collect();
            Self::store_device_ids(&mut state, &ids);
        }
        self.notify(DeviceId::SYSTEM, DEVICES_ADDRESS);
    }

    fn device_ids(state: &State) -> Vec<DeviceId> {
        state
            .objects
            .get(&DeviceId::SYSTEM)
            .and_then(|props| props.get(&DEVICES_ADDRESS))
            .and_then(|cell| codec::decode(&DEVICES_ADDRESS, &cell.bytes, cell.bytes.len()).ok())
            .and_then(|value| value.as_device_ids().map(<[DeviceId]>::to_vec))
            .unwrap_or_default()
    }

    fn store_device_ids(state: &mut State, ids: &[DeviceId]) {
        let value = PropertyValue::DeviceIdList(ids.to_vec());
        if let Ok(bytes) = codec::encode(&DEVICES_ADDRESS, &value) {
            let system = state.objects.entry(DeviceId::SYSTEM).or_default();
            store(system, DEVICES_ADDRESS, bytes);
        }
    }

    /// Store a typed value, creating the property (read-only) if needed.
    pub fn set_value(
        &self,
        id: DeviceId,
        address: PropertyAddress,
        value: &PropertyValue,
    ) -> HalResult<()> {
        let bytes = codec::encode(&address, value)?;
        self.set_raw(id, address, bytes);
        Ok(())
    }

    /// Store a raw payload verbatim, for malformed-provider scenarios.
    pub fn set_raw(&self, id: DeviceId, address: PropertyAddress, bytes: Vec<u8>) {
        let mut state = lock(&self.state);
        store(state.objects.entry(id).or_default(), address, bytes);
    }

    pub fn set_settable(&self, id: DeviceId, address: PropertyAddress, settable: bool) {
        self.with_cell(id, address, |cell| cell.settable = settable);
    }

    /// Make writes to the property fail with a native status.
    pub fn reject_writes(&self, id: DeviceId, address: PropertyAddress, status: i32) {
        self.with_cell(id, address, |cell| cell.reject_status = Some(status));
    }

    /// Make reads write `missing` fewer bytes than the size query reports.
    pub fn short_read(&self, id: DeviceId, address: PropertyAddress, missing: usize) {
        self.with_cell(id, address, |cell| cell.short_by = missing);
    }

    pub fn remove_property(&self, id: DeviceId, address: PropertyAddress) {
        let mut state = lock(&self.state);
        if let Some(props) = state.objects.get_mut(&id) {
            props.remove(&address);
        }
    }

    fn with_cell(&self, id: DeviceId, address: PropertyAddress, f: impl FnOnce(&mut Cell)) {
        let mut state = lock(&self.state);
        if let Some(cell) = state.objects.get_mut(&id).and_then(|p| p.get_mut(&address)) {
            f(cell);
        }
    }

    /// Fire the listeners of `(id, address)` on the calling thread.
    ///
    /// Listeners on the wildcard element of the same selector and scope fire
    /// as well.
    pub fn notify(&self, id: DeviceId, address: PropertyAddress) {
        let listeners: Vec<ListenerFn> = {
            let state = lock(&self.state);
            state
                .listeners
                .values()
                .filter(|(object, key, _)| {
                    *object == id
                        && key.selector == address.selector
                        && key.scope == address.scope
                        && (key.element == address.element || key.is_wildcard_element())
                })
                .map(|(_, _, listener)| listener.clone())
                .collect()
        };
        for listener in listeners {
            listener(id, &[address]);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            size_queries: self.size_queries.load(Ordering::SeqCst),
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            settable_queries: self.settable_queries.load(Ordering::SeqCst),
        }
    }

    fn cell(&self, id: DeviceId, address: &PropertyAddress) -> Result<Cell, ProviderError> {
        let state = lock(&self.state);
        let props = state.objects.get(&id).ok_or(ProviderError::UnknownObject)?;
        props.get(address).cloned().ok_or(ProviderError::Unsupported)
    }
}

impl HalProvider for MemoryProvider {
    fn has_property(&self, object: DeviceId, address: &PropertyAddress) -> bool {
        self.cell(object, address).is_ok()
    }

    fn query_size(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
    ) -> Result<usize, ProviderError> {
        self.size_queries.fetch_add(1, Ordering::SeqCst);
        self.cell(object, address).map(|cell| cell.bytes.len())
    }

    fn read_bytes(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        buf: &mut [u8],
    ) -> Result<usize, ProviderError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let cell = self.cell(object, address)?;
        let available = cell.bytes.len().saturating_sub(cell.short_by);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&cell.bytes[..n]);
        Ok(n)
    }

    fn write_bytes(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        data: &[u8],
    ) -> Result<(), ProviderError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            let props = state
                .objects
                .get_mut(&object)
                .ok_or(ProviderError::UnknownObject)?;
            let cell = props.get_mut(address).ok_or(ProviderError::Unsupported)?;
            if let Some(status) = cell.reject_status {
                return Err(ProviderError::Native(status));
            }
            if !cell.settable {
                return Err(ProviderError::Native(ILLEGAL_OPERATION));
            }
            cell.bytes = data.to_vec();
        }
        self.notify(object, *address);
        Ok(())
    }

    fn is_settable(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
    ) -> Result<bool, ProviderError> {
        self.settable_queries.fetch_add(1, Ordering::SeqCst);
        self.cell(object, address).map(|cell| cell.settable)
    }

    fn register_listener(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        listener: ListenerFn,
    ) -> Result<ListenerToken, ProviderError> {
        let mut state = lock(&self.state);
        if !state.objects.contains_key(&object) {
            return Err(ProviderError::UnknownObject);
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        state.listeners.insert(token, (object, *address, listener));
        Ok(ListenerToken(token))
    }

    fn deregister_listener(&self, token: ListenerToken) -> Result<(), ProviderError> {
        let mut state = lock(&self.state);
        state
            .listeners
            .remove(&token.0)
            .map(|_| ())
            .ok_or(ProviderError::Native(ILLEGAL_OPERATION))
    }
}
