//! Device registry
//!
//! Authoritative table of open devices and their remote registration ids.
//! Every mutation happens under one write lock over the whole table, so a
//! reader never sees a handle without its entry or a remote id without its
//! handle.
//!
//! Each entry carries an epoch that increases with every successful open.
//! Work started for one plug-in (remote registration, command dispatch)
//! holds `(key, epoch)` and can never touch a later entry of the same key.

use common::{AttachRequest, DeviceKey, Permission, PhysicalDevice, UsbHandle};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a device entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Seen by the platform, waiting for permission
    Discovered,
    /// Handle open, not yet known to the controller
    Opened,
    /// Controller assigned a remote id
    Registered,
}

/// Registry operation failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Device {0} is already open")]
    AlreadyOpen(DeviceKey),

    #[error("Attach of {0} is already in progress")]
    AttachInProgress(DeviceKey),

    #[error("Permission denied for {0}")]
    PermissionDenied(DeviceKey),

    #[error("Failed to open {key}: {source}")]
    OpenFailed {
        key: DeviceKey,
        #[source]
        source: rusb::Error,
    },

    /// Device was detached (or replaced by a newer plug-in)
    #[error("Device {0} is not open")]
    NotOpen(DeviceKey),
}

/// Consistent view of one open device
#[derive(Clone)]
pub struct OpenDevice {
    pub key: DeviceKey,
    pub info: PhysicalDevice,
    pub handle: Arc<dyn UsbHandle>,
    pub remote_id: Option<String>,
    pub status: DeviceStatus,
    pub epoch: u64,
}

impl fmt::Debug for OpenDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDevice")
            .field("key", &self.key)
            .field("remote_id", &self.remote_id)
            .field("status", &self.status)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Returned by a successful attach
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub key: DeviceKey,
    pub epoch: u64,
    pub info: PhysicalDevice,
    /// Cancelled when this entry is detached or the registry is cleared
    pub cancel: CancellationToken,
}

/// Returned by detach; the handle is already closed
#[derive(Debug, Clone)]
pub struct DetachedDevice {
    pub key: DeviceKey,
    pub info: PhysicalDevice,
    pub remote_id: Option<String>,
}

struct Entry {
    info: PhysicalDevice,
    handle: Arc<dyn UsbHandle>,
    remote_id: Option<String>,
    status: DeviceStatus,
    epoch: u64,
    cancel: CancellationToken,
}

impl Entry {
    fn view(&self, key: &DeviceKey) -> OpenDevice {
        OpenDevice {
            key: key.clone(),
            info: self.info.clone(),
            handle: self.handle.clone(),
            remote_id: self.remote_id.clone(),
            status: self.status,
            epoch: self.epoch,
        }
    }

    /// Cancel dependent work and start closing the handle
    fn shutdown(self, key: DeviceKey) -> Closing {
        self.cancel.cancel();
        Closing {
            task: start_close(self.handle),
            detached: DetachedDevice {
                key,
                info: self.info,
                remote_id: self.remote_id,
            },
        }
    }
}

/// Entry removed from the table whose handle is closing on the blocking pool
struct Closing {
    detached: DetachedDevice,
    task: JoinHandle<Result<(), rusb::Error>>,
}

impl Closing {
    async fn finish(self) -> DetachedDevice {
        finish_close(&self.detached.key, self.task).await;
        self.detached
    }
}

/// Closing waits for in-flight transfers on the handle, so it never runs on
/// an async worker
fn start_close(handle: Arc<dyn UsbHandle>) -> JoinHandle<Result<(), rusb::Error>> {
    tokio::task::spawn_blocking(move || handle.close())
}

async fn finish_close(key: &DeviceKey, task: JoinHandle<Result<(), rusb::Error>>) {
    match task.await {
        Ok(Ok(())) => debug!("Closed handle for {}", key),
        Ok(Err(e)) => warn!("Failed to close device {}: {}", key, e),
        Err(e) => warn!("Close task for device {} failed: {}", key, e),
    }
}

#[derive(Default)]
struct Table {
    devices: BTreeMap<DeviceKey, Entry>,
    pending: HashSet<DeviceKey>,
    next_epoch: u64,
}

/// Shared, cloneable handle to the device table
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    table: Arc<RwLock<Table>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a device and insert it
    ///
    /// Waits for the platform's permission grant first when one is pending.
    /// On any failure the key stays absent. `parent` is the token whose
    /// cancellation must also stop work bound to this device.
    pub async fn attach(
        &self,
        request: AttachRequest,
        parent: &CancellationToken,
    ) -> Result<AttachedDevice, RegistryError> {
        let AttachRequest { device, permission } = request;
        let key = device.info().key();

        {
            let mut table = self.table.write().await;
            if table.devices.contains_key(&key) {
                return Err(RegistryError::AlreadyOpen(key));
            }
            if !table.pending.insert(key.clone()) {
                return Err(RegistryError::AttachInProgress(key));
            }
        }

        if let Permission::Requested(grant) = permission {
            debug!("Waiting for permission to open {}", key);
            if !matches!(grant.await, Ok(true)) {
                self.table.write().await.pending.remove(&key);
                return Err(RegistryError::PermissionDenied(key));
            }
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(source) => {
                self.table.write().await.pending.remove(&key);
                return Err(RegistryError::OpenFailed { key, source });
            }
        };

        let mut table = self.table.write().await;
        if !table.pending.remove(&key) || parent.is_cancelled() {
            // Detached, cleared or session ended while we were waiting
            drop(table);
            finish_close(&key, start_close(handle)).await;
            return Err(RegistryError::NotOpen(key));
        }

        table.next_epoch += 1;
        let epoch = table.next_epoch;
        let cancel = parent.child_token();
        let info = device.info().clone();

        table.devices.insert(
            key.clone(),
            Entry {
                info: info.clone(),
                handle,
                remote_id: None,
                status: DeviceStatus::Opened,
                epoch,
                cancel: cancel.clone(),
            },
        );

        info!("Device opened: {} ({})", key, info.description());
        Ok(AttachedDevice {
            key,
            epoch,
            info,
            cancel,
        })
    }

    /// Remove a device, cancel its work and close its handle
    ///
    /// Returns `None` when the key was not open. A pending attach for the key
    /// is abandoned either way. The entry leaves the table before the handle
    /// closes; the close itself runs on the blocking pool and is awaited.
    pub async fn detach(&self, key: &DeviceKey) -> Option<DetachedDevice> {
        let entry = {
            let mut table = self.table.write().await;
            table.pending.remove(key);
            table.devices.remove(key)
        }?;

        let detached = entry.shutdown(key.clone()).finish().await;
        info!("Device detached: {}", key);
        Some(detached)
    }

    /// Current entry for `key`, whatever its epoch
    pub async fn get_open(&self, key: &DeviceKey) -> Option<OpenDevice> {
        let table = self.table.read().await;
        table.devices.get(key).map(|entry| entry.view(key))
    }

    /// Current entry for `key` only if it is still the `epoch` plug-in
    pub async fn get_current(&self, key: &DeviceKey, epoch: u64) -> Option<OpenDevice> {
        let table = self.table.read().await;
        table
            .devices
            .get(key)
            .filter(|entry| entry.epoch == epoch)
            .map(|entry| entry.view(key))
    }

    /// Record the controller-assigned id and mark the entry registered
    ///
    /// Fails if the `epoch` entry is gone, so a late registration can never
    /// attach an id to a detached or re-plugged device.
    pub async fn set_remote_id(
        &self,
        key: &DeviceKey,
        epoch: u64,
        remote_id: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let mut table = self.table.write().await;
        match table.devices.get_mut(key) {
            Some(entry) if entry.epoch == epoch => {
                entry.remote_id = Some(remote_id.into());
                entry.status = DeviceStatus::Registered;
                Ok(())
            }
            _ => Err(RegistryError::NotOpen(key.clone())),
        }
    }

    pub async fn status(&self, key: &DeviceKey) -> Option<DeviceStatus> {
        let table = self.table.read().await;
        match table.devices.get(key) {
            Some(entry) => Some(entry.status),
            None if table.pending.contains(key) => Some(DeviceStatus::Discovered),
            None => None,
        }
    }

    /// Open devices in attach order
    pub async fn snapshot(&self) -> Vec<OpenDevice> {
        let table = self.table.read().await;
        let mut devices: Vec<OpenDevice> = table
            .devices
            .iter()
            .map(|(key, entry)| entry.view(key))
            .collect();
        devices.sort_by_key(|d| d.epoch);
        devices
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.devices.is_empty()
    }

    /// Detach everything, closing every handle
    pub async fn clear(&self) -> Vec<DetachedDevice> {
        let entries = {
            let mut table = self.table.write().await;
            table.pending.clear();
            std::mem::take(&mut table.devices)
        };

        let count = entries.len();
        let closing: Vec<Closing> = entries
            .into_iter()
            .map(|(key, entry)| entry.shutdown(key))
            .collect();

        let mut detached = Vec::with_capacity(count);
        for pending in closing {
            detached.push(pending.finish().await);
        }
        if count > 0 {
            info!("Closed {} device(s)", count);
        }
        detached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::UsbDevice;
    use common::test_utils::{
        MockUsbDevice, create_mock_physical_device, create_mock_usb_device,
    };
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_attach_and_snapshot() {
        let registry = DeviceRegistry::new();
        let root = CancellationToken::new();
        let a = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let b = create_mock_usb_device("/dev/bus/usb/001/003", 0x1234, 0x0002);

        let first = registry.attach(a.attach_request(), &root).await.unwrap();
        let second = registry.attach(b.attach_request(), &root).await.unwrap();

        assert!(second.epoch > first.epoch);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, first.key);
        assert_eq!(snapshot[0].status, DeviceStatus::Opened);
        assert!(snapshot[0].remote_id.is_none());
    }

    #[tokio::test]
    async fn test_attach_twice_is_rejected() {
        let registry = DeviceRegistry::new();
        let root = CancellationToken::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);

        registry.attach(device.attach_request(), &root).await.unwrap();
        let err = registry
            .attach(device.attach_request(), &root)
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::AlreadyOpen(_)));
        assert_eq!(device.open_count(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_entry() {
        let registry = DeviceRegistry::new();
        let info = create_mock_physical_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let key = info.key();
        let device = Arc::new(MockUsbDevice::failing(info, rusb::Error::Access));

        let err = registry
            .attach(device.attach_request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::OpenFailed { .. }));
        assert!(registry.get_open(&key).await.is_none());
        assert!(registry.status(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_permission_grant_then_open() {
        let registry = DeviceRegistry::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let key = device.info().key();
        let (grant, rx) = oneshot::channel();
        let request = AttachRequest {
            device: device.clone(),
            permission: Permission::Requested(rx),
        };

        let attach = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.attach(request, &CancellationToken::new()).await })
        };

        assert!(
            common::test_utils::wait_until(std::time::Duration::from_secs(1), || {
                registry.table.try_read().is_ok_and(|t| t.pending.contains(&key))
            })
            .await
        );
        assert_eq!(registry.status(&key).await, Some(DeviceStatus::Discovered));
        assert_eq!(device.open_count(), 0);

        grant.send(true).unwrap();
        attach.await.unwrap().unwrap();
        assert_eq!(registry.status(&key).await, Some(DeviceStatus::Opened));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let registry = DeviceRegistry::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let (grant, rx) = oneshot::channel();
        grant.send(false).unwrap();

        let err = registry
            .attach(
                AttachRequest {
                    device: device.clone(),
                    permission: Permission::Requested(rx),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::PermissionDenied(_)));
        assert_eq!(device.open_count(), 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_detach_closes_and_cancels() {
        let registry = DeviceRegistry::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let attached = registry
            .attach(device.attach_request(), &CancellationToken::new())
            .await
            .unwrap();
        registry
            .set_remote_id(&attached.key, attached.epoch, "remote-1")
            .await
            .unwrap();

        let detached = registry.detach(&attached.key).await.unwrap();

        assert_eq!(detached.remote_id.as_deref(), Some("remote-1"));
        assert!(attached.cancel.is_cancelled());
        assert!(device.handle().is_closed());
        assert!(registry.get_open(&attached.key).await.is_none());
        assert!(registry.detach(&attached.key).await.is_none());
    }

    #[tokio::test]
    async fn test_late_remote_id_does_not_resurrect() {
        let registry = DeviceRegistry::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let attached = registry
            .attach(device.attach_request(), &CancellationToken::new())
            .await
            .unwrap();

        registry.detach(&attached.key).await;
        let err = registry
            .set_remote_id(&attached.key, attached.epoch, "late")
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::NotOpen(_)));
        assert!(registry.get_open(&attached.key).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_epoch_after_replug() {
        let registry = DeviceRegistry::new();
        let root = CancellationToken::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);

        let old = registry.attach(device.attach_request(), &root).await.unwrap();
        registry.detach(&old.key).await;
        let new = registry.attach(device.attach_request(), &root).await.unwrap();

        assert!(
            registry
                .set_remote_id(&old.key, old.epoch, "stale")
                .await
                .is_err()
        );
        assert!(registry.get_current(&old.key, old.epoch).await.is_none());

        let current = registry.get_current(&new.key, new.epoch).await.unwrap();
        assert!(current.remote_id.is_none());
        assert!(!new.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let registry = DeviceRegistry::new();
        let root = CancellationToken::new();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);
        let attached = registry.attach(device.attach_request(), &root).await.unwrap();

        root.cancel();
        assert!(attached.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_attach_after_session_end_is_refused() {
        let registry = DeviceRegistry::new();
        let root = CancellationToken::new();
        root.cancel();
        let device = create_mock_usb_device("/dev/bus/usb/001/002", 0x1234, 0x0001);

        let err = registry
            .attach(device.attach_request(), &root)
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::NotOpen(_)));
        assert!(device.handle().is_closed());
        assert!(registry.is_empty().await);
        assert!(registry.status(&device.info().key()).await.is_none());
    }

    #[tokio::test]
    async fn test_slow_close_does_not_stall_runtime() {
        use common::test_utils::MockUsbHandle;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let registry = DeviceRegistry::new();
        let handle = Arc::new(MockUsbHandle::new().with_close_delay(Duration::from_millis(300)));
        let device = Arc::new(MockUsbDevice::new(
            create_mock_physical_device("/dev/bus/usb/001/002", 0x1234, 0x0001),
            handle.clone(),
        ));
        let attached = registry
            .attach(device.attach_request(), &CancellationToken::new())
            .await
            .unwrap();

        // Current-thread runtime: ticks only advance while detach yields
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        tokio::task::yield_now().await;

        let before = ticks.load(Ordering::SeqCst);
        registry.detach(&attached.key).await.unwrap();
        let during = ticks.load(Ordering::SeqCst) - before;
        ticker.abort();

        assert!(handle.is_closed());
        assert!(during >= 5, "runtime stalled during close ({} ticks)", during);
    }

    #[tokio::test]
    async fn test_clear_closes_everything() {
        let registry = DeviceRegistry::new();
        let root = CancellationToken::new();
        let devices: Vec<_> = (1..=3)
            .map(|i| create_mock_usb_device(&format!("/dev/bus/usb/001/{:03}", i), 0x1234, i))
            .collect();
        for device in &devices {
            registry.attach(device.attach_request(), &root).await.unwrap();
        }

        let cleared = registry.clear().await;

        assert_eq!(cleared.len(), 3);
        assert!(registry.is_empty().await);
        assert!(devices.iter().all(|d| d.handle().is_closed()));
        assert!(registry.clear().await.is_empty());
    }
}
