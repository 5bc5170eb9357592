//! Common utilities for usb-bridge
//!
//! This crate provides the pieces shared between the bridge engine and its
//! platform integrations: USB device descriptors and handle abstractions,
//! the platform event channel, error handling, logging setup, and test
//! utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{PlatformEvent, PlatformEventReceiver, PlatformEventSender, create_platform_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    AttachRequest, DeviceKey, InterfaceInfo, Permission, PhysicalDevice, UsbDevice, UsbHandle,
};
