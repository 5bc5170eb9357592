//! Test utilities for usb-bridge
//!
//! Provides mock implementations of the USB platform traits and helper
//! functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::UsbHandle;
//! use common::test_utils::{MockUsbHandle, create_mock_physical_device};
//! use std::time::Duration;
//!
//! let device = create_mock_physical_device("/dev/bus/usb/001/004", 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//!
//! let handle = MockUsbHandle::new().with_control_result(Ok(4));
//! let mut buf = [0u8; 8];
//! let n = handle
//!     .control_transfer(0x80, 0x06, 0, 0, &mut buf, Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(n, 4);
//! ```

use crate::usb_types::{AttachRequest, InterfaceInfo, PhysicalDevice, UsbDevice, UsbHandle};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock PhysicalDevice for testing
///
/// # Arguments
/// * `path` - Platform device path
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_physical_device(path: &str, vendor_id: u16, product_id: u16) -> PhysicalDevice {
    PhysicalDevice {
        vendor_id,
        product_id,
        device_path: path.to_string(),
        manufacturer: Some("Test Manufacturer".to_string()),
        product_name: Some(format!("Test Product {:04x}", product_id)),
        serial_number: Some(format!("SN{:04x}{:04x}", vendor_id, product_id)),
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        interface_count: 1,
    }
}

/// Byte pattern the mock writes into IN buffers: `buf[i] = i + 1`
pub fn mock_read_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + 1) & 0xFF) as u8).collect()
}

/// One primitive invocation recorded by [`MockUsbHandle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        /// Buffer contents as handed to the primitive
        buffer: Vec<u8>,
        timeout: Duration,
    },
    Bulk {
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    },
    Claim {
        interface: u8,
        force: bool,
    },
    Close,
}

/// Scriptable in-memory device handle
///
/// Reads fill the buffer with [`mock_read_pattern`]. Transfers on a closed
/// handle fail with `NoDevice`.
pub struct MockUsbHandle {
    interfaces: Vec<InterfaceInfo>,
    control_result: Mutex<Result<usize, rusb::Error>>,
    bulk_result: Mutex<Result<usize, rusb::Error>>,
    delay: Duration,
    close_delay: Duration,
    calls: Mutex<Vec<MockCall>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl Default for MockUsbHandle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockUsbHandle {
    /// Handle whose transfers move the full buffer and which has no interfaces
    pub fn new() -> Self {
        Self {
            interfaces: Vec::new(),
            control_result: Mutex::new(Ok(usize::MAX)),
            bulk_result: Mutex::new(Ok(usize::MAX)),
            delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Add an interface with the given endpoint addresses
    pub fn with_interface(mut self, number: u8, endpoints: &[u8]) -> Self {
        self.interfaces.push(InterfaceInfo {
            number,
            endpoints: endpoints.to_vec(),
        });
        self
    }

    /// Result of every control transfer; `Ok(n)` is clamped to the buffer size
    pub fn with_control_result(self, result: Result<usize, rusb::Error>) -> Self {
        *lock(&self.control_result) = result;
        self
    }

    /// Result of every bulk transfer; `Ok(n)` is clamped to the buffer size
    pub fn with_bulk_result(self, result: Result<usize, rusb::Error>) -> Self {
        *lock(&self.bulk_result) = result;
        self
    }

    /// Make every transfer block for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make close block for `delay`, like a close waiting on a transfer
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Number of control and bulk transfers attempted
    pub fn transfer_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, MockCall::Control { .. } | MockCall::Bulk { .. }))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn complete(
        &self,
        result: &Mutex<Result<usize, rusb::Error>>,
        is_in: bool,
        buffer: &mut [u8],
    ) -> Result<usize, rusb::Error> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.is_closed() {
            return Err(rusb::Error::NoDevice);
        }

        let n = (*lock(result))?.min(buffer.len());
        if is_in {
            buffer[..n].copy_from_slice(&mock_read_pattern(n));
        }
        Ok(n)
    }
}

impl UsbHandle for MockUsbHandle {
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        lock(&self.calls).push(MockCall::Control {
            request_type,
            request,
            value,
            index,
            buffer: buffer.to_vec(),
            timeout,
        });
        self.complete(&self.control_result, request_type & 0x80 != 0, buffer)
    }

    fn bulk_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        lock(&self.calls).push(MockCall::Bulk {
            endpoint,
            buffer: buffer.to_vec(),
            timeout,
        });
        self.complete(&self.bulk_result, endpoint & 0x80 != 0, buffer)
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.clone()
    }

    fn claim_interface(&self, interface: u8, force: bool) -> Result<(), rusb::Error> {
        lock(&self.calls).push(MockCall::Claim { interface, force });
        if self.is_closed() {
            return Err(rusb::Error::NoDevice);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), rusb::Error> {
        if !self.close_delay.is_zero() {
            std::thread::sleep(self.close_delay);
        }
        lock(&self.calls).push(MockCall::Close);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock platform device backed by a shared [`MockUsbHandle`]
pub struct MockUsbDevice {
    info: PhysicalDevice,
    handle: Arc<MockUsbHandle>,
    open_error: Option<rusb::Error>,
    open_count: AtomicUsize,
}

impl MockUsbDevice {
    pub fn new(info: PhysicalDevice, handle: Arc<MockUsbHandle>) -> Self {
        Self {
            info,
            handle,
            open_error: None,
            open_count: AtomicUsize::new(0),
        }
    }

    /// Device whose `open` always fails with `error`
    pub fn failing(info: PhysicalDevice, error: rusb::Error) -> Self {
        Self {
            info,
            handle: Arc::new(MockUsbHandle::new()),
            open_error: Some(error),
            open_count: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self) -> Arc<MockUsbHandle> {
        self.handle.clone()
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Wrap into a granted attach request
    pub fn attach_request(self: &Arc<Self>) -> AttachRequest {
        AttachRequest::granted(self.clone())
    }
}

impl UsbDevice for MockUsbDevice {
    fn info(&self) -> &PhysicalDevice {
        &self.info
    }

    fn open(&self) -> Result<Arc<dyn UsbHandle>, rusb::Error> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.open_error {
            return Err(err);
        }
        self.handle.reopen();
        Ok(self.handle.clone())
    }
}

/// Create a mock device at `path` with a default handle
pub fn create_mock_usb_device(path: &str, vendor_id: u16, product_id: u16) -> Arc<MockUsbDevice> {
    Arc::new(MockUsbDevice::new(
        create_mock_physical_device(path, vendor_id, product_id),
        Arc::new(MockUsbHandle::new()),
    ))
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` every few milliseconds until it holds or `duration` passes
///
/// Returns whether the condition became true.
pub async fn wait_until<F>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
