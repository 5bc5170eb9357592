//! Platform USB integration
//!
//! Enumerates local devices through libusb and turns hot-plug notifications
//! into [`PlatformEvent`]s for the engine. libusb callbacks only queue raw
//! notifications; descriptors are read afterwards on the watcher thread,
//! since synchronous I/O inside a hot-plug callback can deadlock libusb.

use super::device::{RusbDevice, device_path};
use common::{AttachRequest, DeviceKey, PlatformEvent, PlatformEventSender, UsbDevice};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Linux Foundation vendor id, used by root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// USB hub device class
const HUB_CLASS: u8 = 9;

/// Source of the devices present when a session starts
pub trait UsbPlatform: Send + Sync {
    /// Devices currently plugged in and eligible for bridging
    fn enumerate(&self) -> Vec<AttachRequest>;
}

/// libusb-backed platform
pub struct RusbPlatform {
    context: Context,
    filters: Vec<String>,
}

impl RusbPlatform {
    /// Create a platform restricted to `filters` ("VID:PID", `*` wildcards)
    pub fn new(filters: Vec<String>) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        Ok(Self { context, filters })
    }

    /// Every non-root-hub device that passes the filters
    pub fn bridgeable_devices(&self) -> Result<Vec<RusbDevice>, rusb::Error> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            match bridgeable(device, &self.filters) {
                Ok(Some(device)) => found.push(device),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable device: {}", e),
            }
        }
        Ok(found)
    }

    /// Start the hot-plug watcher thread
    ///
    /// Returns `None` when libusb has no hot-plug support on this system;
    /// only devices present at connect time are bridged then.
    pub fn watch(&self, events: PlatformEventSender) -> std::io::Result<Option<HotplugWatcher>> {
        if !rusb::has_hotplug() {
            warn!("libusb hot-plug is not supported, device changes will not be seen");
            return Ok(None);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let filters = self.filters.clone();
        let flag = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run_watcher(context, filters, events, flag))?;

        Ok(Some(HotplugWatcher {
            shutdown,
            thread: Some(thread),
        }))
    }
}

impl UsbPlatform for RusbPlatform {
    fn enumerate(&self) -> Vec<AttachRequest> {
        match self.bridgeable_devices() {
            Ok(devices) => devices
                .into_iter()
                .map(|device| AttachRequest::granted(Arc::new(device)))
                .collect(),
            Err(e) => {
                error!("Failed to enumerate USB devices: {}", e);
                Vec::new()
            }
        }
    }
}

/// Running hot-plug thread; stopped on [`HotplugWatcher::stop`] or drop
pub struct HotplugWatcher {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    pub fn stop(mut self) {
        self.shutdown_thread();
    }

    fn shutdown_thread(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("USB hot-plug thread panicked");
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.shutdown_thread();
    }
}

/// Check a "VID:PID" filter list, hex with optional `0x`, `*` as wildcard
///
/// An empty list allows every device.
pub fn filter_allows(vendor_id: u16, product_id: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let matches = |pattern: &str, value: u16| {
        let pattern = pattern.trim();
        pattern == "*"
            || u16::from_str_radix(
                pattern.trim_start_matches("0x").trim_start_matches("0X"),
                16,
            )
            .is_ok_and(|v| v == value)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((vid, pid)) => matches(vid, vendor_id) && matches(pid, product_id),
        None => false,
    })
}

fn is_root_hub(vendor_id: u16, class_code: u8) -> bool {
    vendor_id == ROOT_HUB_VENDOR_ID && class_code == HUB_CLASS
}

fn bridgeable(device: Device<Context>, filters: &[String]) -> Result<Option<RusbDevice>, rusb::Error> {
    let descriptor = device.device_descriptor()?;

    if is_root_hub(descriptor.vendor_id(), descriptor.class_code()) {
        debug!(
            "Skipping root hub: bus={}, addr={}",
            device.bus_number(),
            device.address()
        );
        return Ok(None);
    }
    if !filter_allows(descriptor.vendor_id(), descriptor.product_id(), filters) {
        debug!(
            "Device {:04x}:{:04x} excluded by filters",
            descriptor.vendor_id(),
            descriptor.product_id()
        );
        return Ok(None);
    }

    RusbDevice::new(device).map(Some)
}

enum Notice {
    Arrived(Device<Context>),
    Left(Departure),
}

/// Identity of a device that went away, taken from its cached descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Departure {
    bus: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
    class_code: u8,
}

impl Departure {
    fn key(&self) -> DeviceKey {
        DeviceKey {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_path: device_path(self.bus, self.address),
        }
    }
}

/// Detach event for a departing device, unless it was never bridgeable
///
/// Works for devices found by enumeration as well as hot-plugged ones, so
/// the watcher keeps no record of what it announced.
fn departure_event(departure: &Departure, filters: &[String]) -> Option<PlatformEvent> {
    if is_root_hub(departure.vendor_id, departure.class_code)
        || !filter_allows(departure.vendor_id, departure.product_id, filters)
    {
        return None;
    }
    Some(PlatformEvent::Detached(departure.key()))
}

struct HotplugCallback {
    notices: mpsc::Sender<Notice>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notices.send(Notice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        // libusb caches the device descriptor, so this does no I/O
        match device.device_descriptor() {
            Ok(descriptor) => {
                let _ = self.notices.send(Notice::Left(Departure {
                    bus: device.bus_number(),
                    address: device.address(),
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                    class_code: descriptor.class_code(),
                }));
            }
            Err(e) => warn!("No descriptor for departing device: {}", e),
        }
    }
}

fn run_watcher(
    context: Context,
    filters: Vec<String>,
    events: PlatformEventSender,
    shutdown: Arc<AtomicBool>,
) {
    let (notice_tx, notice_rx) = mpsc::channel();
    let callback = HotplugCallback { notices: notice_tx };

    // Devices already present are picked up by the connect-time enumeration
    let _registration = match HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(callback))
    {
        Ok(registration) => registration,
        Err(e) => {
            error!("Failed to register hot-plug callback: {}", e);
            return;
        }
    };

    info!("USB hot-plug watcher started");

    while !shutdown.load(Ordering::SeqCst) && !events.is_closed() {
        match context.handle_events(Some(Duration::from_millis(100))) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        while let Ok(notice) = notice_rx.try_recv() {
            match notice {
                Notice::Arrived(device) => {
                    match bridgeable(device, &filters) {
                        Ok(Some(device)) => {
                            info!("Device attached: {}", device.info().description());
                            let request = AttachRequest::granted(Arc::new(device));
                            if let Err(e) = events.try_send(PlatformEvent::Attached(request)) {
                                warn!("Dropping attach event: {}", e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Failed to read arriving device: {}", e),
                    }
                }
                Notice::Left(departure) => {
                    if let Some(event) = departure_event(&departure, &filters) {
                        info!("Device detached: {}", departure.key());
                        if let Err(e) = events.try_send(event) {
                            warn!("Dropping detach event: {}", e);
                        }
                    }
                }
            }
        }
    }

    info!("USB hot-plug watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(filter_allows(0x1234, 0x5678, &filters));
        assert!(filter_allows(0xABCD, 0x1111, &filters));
        assert!(filter_allows(0xABCD, 0x9999, &filters));

        assert!(!filter_allows(0x1234, 0x9999, &filters));
        assert!(!filter_allows(0x9999, 0x5678, &filters));
        assert!(!filter_allows(0x0000, 0x0000, &filters));

        assert!(filter_allows(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_filter_without_prefix() {
        let filters = vec!["04b4:*".to_string(), "*:0002".to_string()];
        assert!(filter_allows(0x04b4, 0x1004, &filters));
        assert!(filter_allows(0x1111, 0x0002, &filters));
        assert!(!filter_allows(0x1111, 0x0003, &filters));
    }

    #[test]
    fn test_malformed_filter_matches_nothing() {
        let filters = vec!["1234".to_string(), "zz:*".to_string()];
        assert!(!filter_allows(0x1234, 0x0001, &filters));
    }

    #[test]
    fn test_root_hub_detection() {
        assert!(is_root_hub(0x1d6b, 9));
        assert!(!is_root_hub(0x1d6b, 0));
        assert!(!is_root_hub(0x04b4, 9));
    }

    fn departure(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> Departure {
        Departure {
            bus,
            address,
            vendor_id,
            product_id,
            class_code: 0,
        }
    }

    #[test]
    fn test_departure_matches_enumerated_key() {
        // Present at startup, so the watcher never saw it arrive
        let enumerated =
            common::test_utils::create_mock_physical_device("/dev/bus/usb/001/004", 0x04b4, 0x1004);

        match departure_event(&departure(1, 4, 0x04b4, 0x1004), &[]) {
            Some(PlatformEvent::Detached(key)) => assert_eq!(key, enumerated.key()),
            other => panic!("expected detach, got {:?}", other),
        }
    }

    #[test]
    fn test_departure_respects_filters_and_root_hubs() {
        let filters = vec!["0x04b4:*".to_string()];
        assert!(departure_event(&departure(1, 4, 0x04b4, 0x1004), &filters).is_some());
        assert!(departure_event(&departure(1, 5, 0x1234, 0x0001), &filters).is_none());

        let mut hub = departure(1, 1, ROOT_HUB_VENDOR_ID, 0x0002);
        hub.class_code = HUB_CLASS;
        assert!(departure_event(&hub, &[]).is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A device always passes the exact filter written for it
            #[test]
            fn prop_exact_filter_matches_itself(vid: u16, pid: u16, uppercase: bool) {
                let filter = if uppercase {
                    format!("0x{:04X}:0x{:04X}", vid, pid)
                } else {
                    format!("0x{:04x}:0x{:04x}", vid, pid)
                };
                prop_assert!(filter_allows(vid, pid, &[filter]));
            }

            /// A vendor wildcard ignores the product id
            #[test]
            fn prop_vendor_wildcard(vid: u16, pid: u16) {
                let filters = vec![format!("0x{:x}:*", vid)];
                prop_assert!(filter_allows(vid, pid, &filters));
                prop_assert!(!filter_allows(vid.wrapping_add(1), pid, &filters));
            }
        }
    }
}
