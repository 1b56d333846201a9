//! Default device lookup and per-channel volume and mute.

use crate::address::{DeviceId, PropertyAddress, Scope};
use crate::codec::PropertyValue;
use crate::error::{HalError, HalResult};
use crate::selector::{self, DEFAULT_INPUT_ADDRESS, DEFAULT_OUTPUT_ADDRESS};
use crate::session::PropertySession;

fn device_at(session: &PropertySession, address: &PropertyAddress) -> HalResult<DeviceId> {
    let value = session.get(DeviceId::SYSTEM, address)?;
    match value.as_device_id() {
        Some(id) if !id.is_unknown() => Ok(id),
        Some(id) => Err(HalError::UnknownDevice(id)),
        None => Err(HalError::TypeMismatch {
            address: *address,
            expected: "Int32",
            found: value.kind(),
        }),
    }
}

pub fn default_output_device(session: &PropertySession) -> HalResult<DeviceId> {
    device_at(session, &DEFAULT_OUTPUT_ADDRESS)
}

pub fn default_input_device(session: &PropertySession) -> HalResult<DeviceId> {
    device_at(session, &DEFAULT_INPUT_ADDRESS)
}

pub fn set_default_output_device(session: &PropertySession, device: DeviceId) -> HalResult<()> {
    session.set(
        DeviceId::SYSTEM,
        &DEFAULT_OUTPUT_ADDRESS,
        &PropertyValue::Int32(device.raw() as i32),
    )
}

/// The channels of one scope that carry a volume control.
pub struct ChannelControl<'a> {
    session: &'a PropertySession,
    device: DeviceId,
    scope: Scope,
    channels: Vec<u32>,
}

impl<'a> ChannelControl<'a> {
    /// Walk elements 0, 1, 2... and keep those with a volume scalar.
    /// The walk ends once `max_failures` elements were missing.
    pub fn discover(
        session: &'a PropertySession,
        device: DeviceId,
        scope: Scope,
        max_failures: u32,
    ) -> HalResult<Self> {
        if device.is_unknown() {
            return Err(HalError::UnknownDevice(device));
        }
        let base = PropertyAddress::new(selector::VOLUME_SCALAR, scope);
        let mut channels = Vec::new();
        let mut misses = 0;
        let mut element = 0u32;
        while misses < max_failures {
            if session.is_supported(device, &base.with_element(element)) {
                channels.push(element);
            } else {
                misses += 1;
            }
            element += 1;
        }
        tracing::debug!("device {device} {scope} volume channels: {channels:?}");
        Ok(Self {
            session,
            device,
            scope,
            channels,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn channels(&self) -> &[u32] {
        &self.channels
    }

    fn volume_address(&self) -> PropertyAddress {
        PropertyAddress::new(selector::VOLUME_SCALAR, self.scope)
    }

    fn mute_address(&self) -> PropertyAddress {
        PropertyAddress::new(selector::MUTE, self.scope)
    }

    fn require_channels(&self) -> HalResult<()> {
        if self.channels.is_empty() {
            return Err(HalError::UnsupportedProperty {
                device: self.device,
                address: self.volume_address(),
            });
        }
        Ok(())
    }

    /// Mean scalar over all channels, as a rounded percentage.
    pub fn volume_percent(&self) -> HalResult<u32> {
        self.require_channels()?;
        let base = self.volume_address();
        let mut sum = 0.0;
        for channel in &self.channels {
            let address = base.with_element(*channel);
            let value = self.session.get(self.device, &address)?;
            sum += value.as_f64().ok_or(HalError::TypeMismatch {
                address,
                expected: "Float64",
                found: value.kind(),
            })?;
        }
        let mean = sum / self.channels.len() as f64;
        Ok((mean * 100.0).round().clamp(0.0, 100.0) as u32)
    }

    /// Write the same scalar to every channel. All channels are attempted;
    /// the first failure is returned.
    pub fn set_volume_percent(&self, percent: u32) -> HalResult<()> {
        if percent > 100 {
            return Err(HalError::OutOfRange {
                what: "volume percent",
                value: percent as i64,
            });
        }
        self.require_channels()?;
        let value = PropertyValue::Float64(percent as f64 / 100.0);
        let base = self.volume_address();
        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = self.session.set(self.device, &base.with_element(*channel), &value) {
                tracing::debug!("volume of channel {channel} on device {}: {e}", self.device);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn mute_states(&self, elements: &[u32]) -> HalResult<Vec<bool>> {
        let base = self.mute_address();
        elements
            .iter()
            .map(|element| {
                let value = self.session.get(self.device, &base.with_element(*element))?;
                Ok(value.as_u32().is_some_and(|v| v != 0))
            })
            .collect()
    }

    /// True when every channel is muted. Devices that only expose mute on
    /// the main element are read there.
    pub fn is_muted(&self) -> HalResult<bool> {
        let states = match self.mute_states(&self.channels) {
            Ok(states) if !states.is_empty() => states,
            _ => self.mute_states(&[0])?,
        };
        Ok(states.iter().all(|muted| *muted))
    }

    /// Every channel is attempted. If any of them fails, or there are no
    /// channels, the main element is written as well.
    pub fn set_muted(&self, muted: bool) -> HalResult<()> {
        let value = PropertyValue::from_bool(muted);
        let base = self.mute_address();
        let mut failed = 0;
        for channel in &self.channels {
            if let Err(e) = self.session.set(self.device, &base.with_element(*channel), &value) {
                tracing::debug!("mute of channel {channel} on device {}: {e}", self.device);
                failed += 1;
            }
        }
        if failed == 0 && !self.channels.is_empty() {
            return Ok(());
        }
        self.session.set(self.device, &base, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use crate::registry::DeviceRegistry;
    use std::sync::Arc;

    const SPEAKERS: DeviceId = DeviceId(73);
    const USB: DeviceId = DeviceId(81);

    fn session() -> (Arc<MemoryProvider>, PropertySession) {
        let provider = Arc::new(MemoryProvider::demo());
        let registry = Arc::new(DeviceRegistry::new(provider.clone()));
        (provider.clone(), PropertySession::new(provider, registry))
    }

    #[test]
    fn default_devices_come_from_the_system_object() {
        let (_, session) = session();
        assert_eq!(default_output_device(&session), Ok(SPEAKERS));
        assert_eq!(default_input_device(&session), Ok(USB));

        set_default_output_device(&session, USB).unwrap();
        assert_eq!(default_output_device(&session), Ok(USB));
    }

    #[test]
    fn discovery_stops_after_max_failures() {
        let (provider, session) = session();
        let control = ChannelControl::discover(&session, USB, Scope::Output, 3).unwrap();
        assert_eq!(control.channels(), &[0, 1, 2, 3, 4]);

        // A gap shorter than the failure budget is skipped over.
        provider.remove_property(
            USB,
            selector::OUTPUT_VOLUME_ADDRESS.with_element(2),
        );
        let control = ChannelControl::discover(&session, USB, Scope::Output, 3).unwrap();
        assert_eq!(control.channels(), &[0, 1, 3, 4]);

        let control = ChannelControl::discover(&session, USB, Scope::Output, 1).unwrap();
        assert_eq!(control.channels(), &[0, 1]);
    }

    #[test]
    fn volume_percent_averages_channels() {
        let (provider, session) = session();
        provider
            .set_value(
                SPEAKERS,
                selector::OUTPUT_VOLUME_ADDRESS.with_element(1),
                &PropertyValue::Float64(0.25),
            )
            .unwrap();
        let control = ChannelControl::discover(&session, SPEAKERS, Scope::Output, 3).unwrap();
        // (0.5 + 0.25 + 0.5) / 3
        assert_eq!(control.volume_percent(), Ok(42));

        control.set_volume_percent(80).unwrap();
        assert_eq!(control.volume_percent(), Ok(80));
    }

    #[test]
    fn volume_above_100_is_rejected() {
        let (provider, session) = session();
        let control = ChannelControl::discover(&session, SPEAKERS, Scope::Output, 3).unwrap();
        assert_eq!(
            control.set_volume_percent(101),
            Err(HalError::OutOfRange {
                what: "volume percent",
                value: 101,
            })
        );
        assert_eq!(provider.calls().writes, 0);
    }

    #[test]
    fn mute_falls_back_to_the_main_element() {
        let (_, session) = session();
        let control = ChannelControl::discover(&session, SPEAKERS, Scope::Output, 3).unwrap();
        assert_eq!(control.is_muted(), Ok(false));
        control.set_muted(true).unwrap();
        assert_eq!(control.is_muted(), Ok(true));
        control.set_muted(false).unwrap();
        assert_eq!(control.is_muted(), Ok(false));
    }

    #[test]
    fn mute_tries_every_channel_before_falling_back() {
        let (provider, session) = session();
        for element in [1, 3] {
            let mute = selector::OUTPUT_MUTE_ADDRESS.with_element(element);
            provider
                .set_value(USB, mute, &PropertyValue::Int32(0))
                .unwrap();
            provider.set_settable(USB, mute, true);
        }
        let control = ChannelControl::discover(&session, USB, Scope::Output, 3).unwrap();
        assert_eq!(control.channels(), &[0, 1, 2, 3, 4]);

        control.set_muted(true).unwrap();
        for element in [0, 1, 3] {
            assert_eq!(
                session
                    .get(USB, &selector::OUTPUT_MUTE_ADDRESS.with_element(element))
                    .unwrap(),
                PropertyValue::Int32(1),
                "element {element}"
            );
        }
    }

    #[test]
    fn device_without_volume_has_no_channels() {
        let (_, session) = session();
        let control = ChannelControl::discover(&session, USB, Scope::Input, 3).unwrap();
        assert!(control.channels().is_empty());
        assert!(matches!(
            control.volume_percent(),
            Err(HalError::UnsupportedProperty { .. })
        ));
    }
}
