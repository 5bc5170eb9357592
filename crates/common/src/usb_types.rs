//! USB type abstractions
//!
//! The bridge engine never talks to libusb directly. Platform integrations
//! hand it [`UsbDevice`] values that can be opened into [`UsbHandle`]s, and
//! the engine drives transfers through those traits only.

use protocol::DeviceRegistration;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Stable identity of one attached USB device instance
///
/// Derived from the descriptor and the platform path, so it survives a
/// permission grant and matches the later detach event of the same plug-in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_path: String,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x}:{}",
            self.vendor_id, self.product_id, self.device_path
        )
    }
}

/// Descriptor of an attached device as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Platform path, e.g. `/dev/bus/usb/001/004`
    pub device_path: String,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_count: u8,
}

impl PhysicalDevice {
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_path: self.device_path.clone(),
        }
    }

    /// Body sent to the controller when registering this device
    pub fn registration(&self) -> DeviceRegistration {
        DeviceRegistration {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            manufacturer: self.manufacturer.clone(),
            product_name: self.product_name.clone(),
            serial_number: self.serial_number.clone(),
            device_class: self.device_class,
            device_subclass: self.device_subclass,
            device_protocol: self.device_protocol,
            interface_count: self.interface_count,
        }
    }

    /// Short display text, e.g. `Brother HL-L2350DW`
    pub fn description(&self) -> String {
        match (&self.manufacturer, &self.product_name) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// One interface of the active configuration and its endpoint addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    /// Endpoint addresses including the direction bit
    pub endpoints: Vec<u8>,
}

/// An open device handle
///
/// Transfer primitives return the number of bytes moved. Implementations
/// serialize access internally; the engine guarantees at most one transfer
/// in flight per handle.
pub trait UsbHandle: Send + Sync {
    /// Control transfer on endpoint 0
    ///
    /// Bit 7 of `request_type` selects the data stage direction. For IN the
    /// device fills `buffer`, for OUT `buffer` is sent.
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Bulk transfer; bit 7 of `endpoint` selects the direction
    fn bulk_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Interfaces of the active configuration
    fn interfaces(&self) -> Vec<InterfaceInfo>;

    /// Claim an interface, detaching any kernel driver first when `force` is set
    fn claim_interface(&self, interface: u8, force: bool) -> Result<(), rusb::Error>;

    /// Release everything and close the handle. Later transfers fail.
    fn close(&self) -> Result<(), rusb::Error>;
}

/// A device the platform can open
pub trait UsbDevice: Send + Sync {
    fn info(&self) -> &PhysicalDevice;

    fn open(&self) -> Result<Arc<dyn UsbHandle>, rusb::Error>;
}

/// Whether the process may open a device yet
pub enum Permission {
    Granted,
    /// The platform asked the user; resolves to `true` once granted
    Requested(oneshot::Receiver<bool>),
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Granted => write!(f, "Granted"),
            Permission::Requested(_) => write!(f, "Requested"),
        }
    }
}

/// Attach notification: a device plus its permission state
pub struct AttachRequest {
    pub device: Arc<dyn UsbDevice>,
    pub permission: Permission,
}

impl AttachRequest {
    pub fn granted(device: Arc<dyn UsbDevice>) -> Self {
        Self {
            device,
            permission: Permission::Granted,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.device.info().key()
    }
}

impl fmt::Debug for AttachRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRequest")
            .field("device", &self.key())
            .field("permission", &self.permission)
            .finish()
    }
}
