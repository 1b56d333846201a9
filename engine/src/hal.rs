use crate::address::{DeviceId, PropertyAddress, Scope};
use crate::bridge::{EventCallback, NotificationBridge, SubscriptionHandle};
use crate::codec::PropertyValue;
use crate::controls::{self, ChannelControl};
use crate::error::HalResult;
use crate::options::HalOptions;
use crate::provider::{HalProvider, MemoryProvider};
use crate::registry::{DeviceRecord, DeviceRegistry, DeviceSummary};
use crate::session::{PropertySession, Reading};
use std::sync::Arc;

/// Registry, session and notification bridge over one provider.
///
/// The registry follows device topology changes whenever the bridge is
/// drained.
pub struct AudioHal {
    registry: Arc<DeviceRegistry>,
    session: PropertySession,
    bridge: Arc<NotificationBridge>,
    options: HalOptions,
    topology: Option<SubscriptionHandle>,
}

impl AudioHal {
    pub fn new(provider: Arc<dyn HalProvider>) -> Self {
        Self::with_options(provider, HalOptions::default())
    }

    pub fn with_options(provider: Arc<dyn HalProvider>, options: HalOptions) -> Self {
        let registry = Arc::new(DeviceRegistry::new(provider.clone()));
        let session = PropertySession::new(provider.clone(), registry.clone());
        let bridge = Arc::new(NotificationBridge::with_options(provider, &options));
        let topology = match registry.watch_topology(&bridge) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("device topology changes will not be tracked: {e}");
                None
            }
        };
        Self {
            registry,
            session,
            bridge,
            options,
            topology,
        }
    }

    /// The machine's CoreAudio HAL, configured from the environment.
    pub fn system() -> HalResult<Self> {
        Self::system_with(HalOptions::from_env())
    }

    #[cfg(target_os = "macos")]
    pub fn system_with(options: HalOptions) -> HalResult<Self> {
        let provider = Arc::new(crate::provider::CoreAudioProvider::new());
        Ok(Self::with_options(provider, options))
    }

    #[cfg(not(target_os = "macos"))]
    pub fn system_with(_options: HalOptions) -> HalResult<Self> {
        Err(crate::error::HalError::Unavailable(format!(
            "CoreAudio is not available on {}",
            std::env::consts::OS
        )))
    }

    /// An in-memory HAL with two demo devices.
    pub fn simulated(options: HalOptions) -> Self {
        Self::with_options(Arc::new(MemoryProvider::demo()), options)
    }

    pub fn options(&self) -> &HalOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &PropertySession {
        &self.session
    }

    pub fn bridge(&self) -> &Arc<NotificationBridge> {
        &self.bridge
    }

    pub fn is_tracking_topology(&self) -> bool {
        self.topology.is_some()
    }

    pub fn list_devices(&self) -> HalResult<Vec<DeviceId>> {
        self.registry.list_devices()
    }

    pub fn describe(&self, device: DeviceId) -> HalResult<DeviceRecord> {
        self.registry.describe(device)
    }

    pub fn summary(&self, device: DeviceId) -> HalResult<DeviceSummary> {
        self.registry.summary(device)
    }

    pub fn get(&self, device: DeviceId, address: &PropertyAddress) -> HalResult<PropertyValue> {
        self.session.get(device, address)
    }

    pub fn read(&self, device: DeviceId, address: &PropertyAddress) -> HalResult<Reading> {
        self.session.read(device, address)
    }

    pub fn set(
        &self,
        device: DeviceId,
        address: &PropertyAddress,
        value: &PropertyValue,
    ) -> HalResult<()> {
        self.session.set(device, address, value)
    }

    pub fn default_output_device(&self) -> HalResult<DeviceId> {
        controls::default_output_device(&self.session)
    }

    pub fn default_input_device(&self) -> HalResult<DeviceId> {
        controls::default_input_device(&self.session)
    }

    pub fn channels(&self, device: DeviceId, scope: Scope) -> HalResult<ChannelControl<'_>> {
        ChannelControl::discover(
            &self.session,
            device,
            scope,
            self.options.max_channel_failures,
        )
    }

    pub fn subscribe(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        callback: EventCallback,
    ) -> HalResult<SubscriptionHandle> {
        self.bridge.subscribe(device, address, callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> HalResult<()> {
        self.bridge.unsubscribe(handle)
    }

    pub fn drain_events(&self) -> usize {
        self.bridge.drain_events()
    }

    pub async fn run_dispatch(&self) {
        self.bridge.run().await
    }

    pub fn shutdown(&self) {
        self.bridge.shutdown()
    }
}
