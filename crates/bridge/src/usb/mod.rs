//! USB subsystem
//!
//! - `device`: libusb-backed implementations of the device/handle traits
//! - `platform`: enumeration, filters and the hot-plug watcher thread
//! - `registry`: the set of devices currently open by the bridge
//! - `transfers`: execution of controller commands on an open handle

pub mod device;
pub mod platform;
pub mod registry;
pub mod transfers;

pub use device::{RusbDevice, RusbHandle};
pub use platform::{HotplugWatcher, RusbPlatform, UsbPlatform, filter_allows};
pub use registry::{AttachedDevice, DetachedDevice, DeviceRegistry, DeviceStatus, OpenDevice, RegistryError};
pub use transfers::{TransferError, TransferExecutor};
