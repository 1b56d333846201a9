//! The request/response and callback surface of the audio HAL.

#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod memory;

use crate::address::{DeviceId, PropertyAddress};
use std::fmt;
use std::sync::Arc;

#[cfg(target_os = "macos")]
pub use self::coreaudio::CoreAudioProvider;
pub use self::memory::MemoryProvider;

/// Called on a provider-owned thread with the object and the addresses that
/// changed.
pub type ListenerFn = Arc<dyn Fn(DeviceId, &[PropertyAddress]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    /// The address is not valid for the object.
    Unsupported,
    /// The object does not exist (any more).
    UnknownObject,
    Native(i32),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unsupported => f.write_str("unsupported property"),
            ProviderError::UnknownObject => f.write_str("unknown object"),
            ProviderError::Native(status) => f.write_str(&crate::error::os_status(*status)),
        }
    }
}

impl ProviderError {
    /// Classify a native status the way the HAL reports addressing failures.
    pub fn from_status(status: i32) -> ProviderError {
        match status {
            crate::error::UNKNOWN_PROPERTY => ProviderError::Unsupported,
            crate::error::BAD_OBJECT | crate::error::BAD_DEVICE => ProviderError::UnknownObject,
            other => ProviderError::Native(other),
        }
    }
}

/// Everything the binding needs from the audio HAL.
///
/// Calls are synchronous and may block for a kernel round trip. Listeners
/// fire on threads the provider owns, possibly concurrently with requests.
pub trait HalProvider: Send + Sync {
    fn has_property(&self, object: DeviceId, address: &PropertyAddress) -> bool;

    fn query_size(&self, object: DeviceId, address: &PropertyAddress)
    -> Result<usize, ProviderError>;

    /// Fill `buf` and return how many bytes were written.
    fn read_bytes(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        buf: &mut [u8],
    ) -> Result<usize, ProviderError>;

    fn write_bytes(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        data: &[u8],
    ) -> Result<(), ProviderError>;

    fn is_settable(&self, object: DeviceId, address: &PropertyAddress)
    -> Result<bool, ProviderError>;

    fn register_listener(
        &self,
        object: DeviceId,
        address: &PropertyAddress,
        listener: ListenerFn,
    ) -> Result<ListenerToken, ProviderError>;

    fn deregister_listener(&self, token: ListenerToken) -> Result<(), ProviderError>;
}
