//! libusb-backed device and handle
//!
//! [`RusbDevice`] caches the descriptor information of one `rusb::Device`;
//! opening it yields a [`RusbHandle`] implementing the engine's handle trait.

use common::{InterfaceInfo, PhysicalDevice, UsbDevice, UsbHandle};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Platform path of a device, matching the Linux usbfs node
pub fn device_path(bus: u8, address: u8) -> String {
    format!("/dev/bus/usb/{:03}/{:03}", bus, address)
}

/// USB device wrapper with cached information
pub struct RusbDevice {
    device: Device<Context>,
    info: PhysicalDevice,
}

impl RusbDevice {
    /// Read and cache the descriptors of `device`
    ///
    /// String descriptors need a temporary open; they are left empty when
    /// the device cannot be opened yet.
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;

        let (manufacturer, product_name, serial_number) = device
            .open()
            .ok()
            .map(|handle| read_string_descriptors(&descriptor, &handle))
            .unwrap_or((None, None, None));

        let interface_count = device
            .active_config_descriptor()
            .or_else(|_| device.config_descriptor(0))
            .map(|config| config.num_interfaces())
            .unwrap_or(0);

        let info = PhysicalDevice {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device_path: device_path(device.bus_number(), device.address()),
            manufacturer,
            product_name,
            serial_number,
            device_class: descriptor.class_code(),
            device_subclass: descriptor.sub_class_code(),
            device_protocol: descriptor.protocol_code(),
            interface_count,
        };

        Ok(Self { device, info })
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }
}

impl UsbDevice for RusbDevice {
    fn info(&self) -> &PhysicalDevice {
        &self.info
    }

    fn open(&self) -> Result<Arc<dyn UsbHandle>, rusb::Error> {
        let handle = self.device.open().inspect_err(|e| {
            warn!("Failed to open device {}: {}", self.info.device_path, e);
        })?;

        let interfaces = match self.device.active_config_descriptor() {
            Ok(config) => config
                .interfaces()
                .map(|interface| {
                    let mut endpoints: Vec<u8> = interface
                        .descriptors()
                        .flat_map(|alt| {
                            alt.endpoint_descriptors()
                                .map(|ep| ep.address())
                                .collect::<Vec<_>>()
                        })
                        .collect();
                    endpoints.sort_unstable();
                    endpoints.dedup();
                    InterfaceInfo {
                        number: interface.number(),
                        endpoints,
                    }
                })
                .collect(),
            Err(e) => {
                warn!(
                    "Failed to get active config descriptor for {}: {}",
                    self.info.device_path, e
                );
                Vec::new()
            }
        };

        debug!(
            "Opened device {} with {} interface(s)",
            self.info.device_path,
            interfaces.len()
        );

        Ok(Arc::new(RusbHandle {
            path: self.info.device_path.clone(),
            interfaces,
            state: RwLock::new(Some(HandleState {
                handle,
                claimed: Vec::new(),
                detached_drivers: Vec::new(),
            })),
        }))
    }
}

struct HandleState {
    handle: DeviceHandle<Context>,
    /// Interfaces claimed by us
    claimed: Vec<u8>,
    /// Interfaces whose kernel driver we detached
    detached_drivers: Vec<u8>,
}

/// Open libusb handle
///
/// Transfers share a read lock; claiming and closing take the write lock,
/// so `close` waits for an in-flight transfer (bounded by its timeout).
pub struct RusbHandle {
    path: String,
    interfaces: Vec<InterfaceInfo>,
    state: RwLock<Option<HandleState>>,
}

impl RusbHandle {
    fn with_handle<T>(
        &self,
        f: impl FnOnce(&DeviceHandle<Context>) -> Result<T, rusb::Error>,
    ) -> Result<T, rusb::Error> {
        let state = self.state.read().map_err(|_| rusb::Error::Other)?;
        match state.as_ref() {
            Some(state) => f(&state.handle),
            None => Err(rusb::Error::NoDevice),
        }
    }
}

impl UsbHandle for RusbHandle {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.with_handle(|handle| {
            if request_type & 0x80 != 0 {
                handle.read_control(request_type, request, value, index, buffer, timeout)
            } else {
                handle.write_control(request_type, request, value, index, buffer, timeout)
            }
        })
    }

    fn bulk_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.with_handle(|handle| {
            if endpoint & 0x80 != 0 {
                handle.read_bulk(endpoint, buffer, timeout)
            } else {
                handle.write_bulk(endpoint, buffer, timeout)
            }
        })
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.clone()
    }

    fn claim_interface(&self, interface: u8, force: bool) -> Result<(), rusb::Error> {
        let mut guard = self.state.write().map_err(|_| rusb::Error::Other)?;
        let state = guard.as_mut().ok_or(rusb::Error::NoDevice)?;

        if state.claimed.contains(&interface) {
            return Ok(());
        }

        if force {
            match state.handle.kernel_driver_active(interface) {
                Ok(true) => {
                    debug!(
                        "Detaching kernel driver from interface {} on {}",
                        interface, self.path
                    );
                    state.handle.detach_kernel_driver(interface)?;
                    state.detached_drivers.push(interface);
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface, e
                    );
                }
            }
        }

        state.handle.claim_interface(interface)?;
        state.claimed.push(interface);
        debug!("Claimed interface {} on {}", interface, self.path);
        Ok(())
    }

    /// Release claimed interfaces and hand detached ones back to the kernel
    fn close(&self) -> Result<(), rusb::Error> {
        let mut guard = self.state.write().map_err(|_| rusb::Error::Other)?;
        let Some(mut state) = guard.take() else {
            return Ok(());
        };

        for interface in std::mem::take(&mut state.claimed) {
            if let Err(e) = state.handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }
        for interface in std::mem::take(&mut state.detached_drivers) {
            if let Err(e) = state.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }

        debug!("Closed device {}", self.path);
        Ok(())
    }
}

/// Read string descriptors from device
fn read_string_descriptors(
    descriptor: &DeviceDescriptor,
    handle: &DeviceHandle<Context>,
) -> (Option<String>, Option<String>, Option<String>) {
    let read = |index: Option<u8>| index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}
