use crate::address::{DeviceId, PropertyAddress};
use crate::codec::{self, PropertyValue};
use crate::error::{HalError, HalResult};
use crate::provider::{HalProvider, ProviderError};
use crate::registry::DeviceRegistry;
use std::sync::Arc;

pub(crate) fn provider_error(
    err: ProviderError,
    device: DeviceId,
    address: &PropertyAddress,
    operation: &'static str,
) -> HalError {
    match err {
        ProviderError::Unsupported => HalError::UnsupportedProperty {
            device,
            address: *address,
        },
        ProviderError::UnknownObject => HalError::UnknownDevice(device),
        ProviderError::Native(status) => HalError::RejectedBySystem { operation, status },
    }
}

/// A decoded value and the payload length the provider reported for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: PropertyValue,
    pub len: usize,
}

pub(crate) fn fetch(
    provider: &dyn HalProvider,
    device: DeviceId,
    address: &PropertyAddress,
) -> HalResult<PropertyValue> {
    fetch_reading(provider, device, address).map(|reading| reading.value)
}

/// Size query, exact-size read and decode of one property.
pub(crate) fn fetch_reading(
    provider: &dyn HalProvider,
    device: DeviceId,
    address: &PropertyAddress,
) -> HalResult<Reading> {
    if device.is_unknown() {
        return Err(HalError::UnknownDevice(device));
    }
    let size = provider
        .query_size(device, address)
        .map_err(|e| provider_error(e, device, address, "size query"))?;
    let mut buf = vec![0u8; size];
    let written = provider
        .read_bytes(device, address, &mut buf)
        .map_err(|e| provider_error(e, device, address, "read"))?;
    if written < size {
        return Err(HalError::ShortRead {
            address: *address,
            expected: size,
            actual: written,
        });
    }
    tracing::debug!("read {address} on device {device}: {size} bytes");
    let value = codec::decode(address, &buf, size)?;
    Ok(Reading { value, len: size })
}

/// Typed get/set against one provider.
///
/// Every call blocks for the provider round trip. There is no timeout and
/// nothing can be cancelled once issued.
pub struct PropertySession {
    provider: Arc<dyn HalProvider>,
    registry: Arc<DeviceRegistry>,
}

impl PropertySession {
    pub fn new(provider: Arc<dyn HalProvider>, registry: Arc<DeviceRegistry>) -> Self {
        Self { provider, registry }
    }

    pub fn provider(&self) -> &Arc<dyn HalProvider> {
        &self.provider
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn get(&self, device: DeviceId, address: &PropertyAddress) -> HalResult<PropertyValue> {
        fetch(self.provider.as_ref(), device, address)
    }

    /// [`PropertySession::get`] that also returns the reported byte length.
    pub fn read(&self, device: DeviceId, address: &PropertyAddress) -> HalResult<Reading> {
        fetch_reading(self.provider.as_ref(), device, address)
    }

    /// Write `value` after checking its shape and the property's settability.
    pub fn set(
        &self,
        device: DeviceId,
        address: &PropertyAddress,
        value: &PropertyValue,
    ) -> HalResult<()> {
        let bytes = codec::encode(address, value)?;
        if !self.registry.settable(device, address)? {
            return Err(HalError::PropertyNotSettable {
                device,
                address: *address,
            });
        }
        self.write(device, address, &bytes)
    }

    pub fn is_supported(&self, device: DeviceId, address: &PropertyAddress) -> bool {
        !device.is_unknown() && self.provider.has_property(device, address)
    }

    /// Read up to `capacity` bytes without size validation or decoding.
    pub fn read_raw(
        &self,
        device: DeviceId,
        address: &PropertyAddress,
        capacity: usize,
    ) -> HalResult<Vec<u8>> {
        if device.is_unknown() {
            return Err(HalError::UnknownDevice(device));
        }
        let mut buf = vec![0u8; capacity];
        let written = self
            .provider
            .read_bytes(device, address, &mut buf)
            .map_err(|e| provider_error(e, device, address, "read"))?;
        buf.truncate(written);
        Ok(buf)
    }

    /// Like [`PropertySession::set`] without asking whether the property is
    /// settable. The provider still has the final word.
    pub fn set_unchecked(
        &self,
        device: DeviceId,
        address: &PropertyAddress,
        value: &PropertyValue,
    ) -> HalResult<()> {
        let bytes = codec::encode(address, value)?;
        if device.is_unknown() {
            return Err(HalError::UnknownDevice(device));
        }
        self.write(device, address, &bytes)
    }

    fn write(&self, device: DeviceId, address: &PropertyAddress, bytes: &[u8]) -> HalResult<()> {
        self.provider
            .write_bytes(device, address, bytes)
            .map_err(|e| provider_error(e, device, address, "set"))?;
        tracing::debug!("wrote {address} on device {device}: {} bytes", bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UNSUPPORTED_FORMAT;
    use crate::provider::MemoryProvider;
    use crate::selector::{NAME_ADDRESS, OUTPUT_VOLUME_ADDRESS, SAMPLE_RATE_ADDRESS};

    fn session() -> (Arc<MemoryProvider>, PropertySession) {
        let provider = Arc::new(MemoryProvider::demo());
        let registry = Arc::new(DeviceRegistry::new(provider.clone()));
        let session = PropertySession::new(provider.clone(), registry);
        (provider, session)
    }

    #[test]
    fn get_decodes_text_and_volume() {
        let (_, session) = session();
        assert_eq!(
            session.get(DeviceId(73), &NAME_ADDRESS).unwrap(),
            PropertyValue::CString("MacBook Pro Speakers".into())
        );
        assert_eq!(
            session.get(DeviceId(73), &OUTPUT_VOLUME_ADDRESS).unwrap(),
            PropertyValue::Float64(0.5)
        );
    }

    #[test]
    fn reading_keeps_reported_length() {
        let (_, session) = session();
        let reading = session.read(DeviceId(73), &NAME_ADDRESS).unwrap();
        assert_eq!(reading.len, "MacBook Pro Speakers".len() + 1);
        assert_eq!(reading.value.as_str(), Some("MacBook Pro Speakers"));
        assert_eq!(session.read(DeviceId(73), &SAMPLE_RATE_ADDRESS).unwrap().len, 8);
    }

    #[test]
    fn absent_object_is_an_unknown_device() {
        let (provider, session) = session();
        assert_eq!(
            session.get(DeviceId(9999), &OUTPUT_VOLUME_ADDRESS),
            Err(HalError::UnknownDevice(DeviceId(9999)))
        );
        assert_eq!(provider.calls().reads, 0);
    }

    #[test]
    fn unsupported_get_never_reads() {
        let (provider, session) = session();
        let address = OUTPUT_VOLUME_ADDRESS.with_element(40);
        assert_eq!(
            session.get(DeviceId(73), &address),
            Err(HalError::UnsupportedProperty {
                device: DeviceId(73),
                address,
            })
        );
        assert_eq!(provider.calls().reads, 0);
    }

    #[test]
    fn short_read_is_a_hard_failure() {
        let (provider, session) = session();
        provider.short_read(DeviceId(73), SAMPLE_RATE_ADDRESS, 3);
        assert_eq!(
            session.get(DeviceId(73), &SAMPLE_RATE_ADDRESS),
            Err(HalError::ShortRead {
                address: SAMPLE_RATE_ADDRESS,
                expected: 8,
                actual: 5,
            })
        );
    }

    #[test]
    fn mistyped_set_makes_no_native_call() {
        let (provider, session) = session();
        let before = provider.calls();
        let err = session
            .set(
                DeviceId(73),
                &OUTPUT_VOLUME_ADDRESS,
                &PropertyValue::CString("loud".into()),
            )
            .unwrap_err();
        assert!(matches!(err, HalError::TypeMismatch { .. }));
        assert_eq!(provider.calls(), before);
    }

    #[test]
    fn read_only_set_never_writes() {
        let (provider, session) = session();
        let err = session
            .set(
                DeviceId(73),
                &NAME_ADDRESS,
                &PropertyValue::CString("Renamed".into()),
            )
            .unwrap_err();
        assert_eq!(
            err,
            HalError::PropertyNotSettable {
                device: DeviceId(73),
                address: NAME_ADDRESS,
            }
        );
        assert_eq!(provider.calls().writes, 0);
    }

    #[test]
    fn native_rejection_keeps_status() {
        let (provider, session) = session();
        provider.reject_writes(DeviceId(73), SAMPLE_RATE_ADDRESS, UNSUPPORTED_FORMAT);
        let err = session
            .set(
                DeviceId(73),
                &SAMPLE_RATE_ADDRESS,
                &PropertyValue::Float64(12_345.0),
            )
            .unwrap_err();
        assert_eq!(err.status(), Some(UNSUPPORTED_FORMAT));
    }

    #[test]
    fn unknown_device_sentinel_is_rejected_locally() {
        let (provider, session) = session();
        assert_eq!(
            session.get(DeviceId::UNKNOWN, &NAME_ADDRESS),
            Err(HalError::UnknownDevice(DeviceId::UNKNOWN))
        );
        assert!(!session.is_supported(DeviceId::UNKNOWN, &NAME_ADDRESS));
        assert_eq!(provider.calls().size_queries, 0);
    }

    #[test]
    fn raw_access_skips_validation() {
        let (provider, session) = session();
        provider.short_read(DeviceId(73), SAMPLE_RATE_ADDRESS, 3);
        assert_eq!(
            session
                .read_raw(DeviceId(73), &SAMPLE_RATE_ADDRESS, 16)
                .unwrap()
                .len(),
            5
        );

        let err = session
            .set_unchecked(
                DeviceId(73),
                &NAME_ADDRESS,
                &PropertyValue::CString("Renamed".into()),
            )
            .unwrap_err();
        assert_eq!(err.status(), Some(crate::error::ILLEGAL_OPERATION));
        assert_eq!(provider.calls().writes, 1);
    }
}
