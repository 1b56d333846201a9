pub mod address;
pub mod bridge;
pub mod codec;
pub mod controls;
pub mod error;
pub mod hal;
mod mutex;
pub mod options;
pub mod provider;
pub mod registry;
pub mod selector;
pub mod session;

pub use address::{DeviceId, ELEMENT_MAIN, ELEMENT_WILDCARD, PropertyAddress, Scope};
pub use bridge::{ChangeEvent, EventCallback, NotificationBridge, SubscriptionHandle};
pub use codec::{FormatFlags, PropertyValue, StreamFormat};
pub use controls::ChannelControl;
pub use error::{HalError, HalResult};
pub use hal::AudioHal;
pub use options::HalOptions;
pub use provider::{HalProvider, MemoryProvider};
pub use registry::{DeviceRecord, DeviceRegistry, DeviceSummary};
pub use session::{PropertySession, Reading};
