//! Shared fixtures for bridge integration tests
//!
//! [`FakeGateway`] is an in-memory controller: it records every call and
//! serves queued command batches per device id.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge::gateway::{BridgeCredentials, GatewayError, GatewayFactory, RemoteGateway};
use bridge::usb::UsbPlatform;
use common::AttachRequest;
use common::test_utils::MockUsbDevice;
use protocol::{
    BatchItem, BridgeRegistration, CommandResponse, DeviceRegistration, Direction,
    PendingCommand, RegisteredBridge, RegisteredDevice, TransferKind,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const BRIDGE_ID: &str = "bridge-1";
pub const API_KEY: &str = "key-1";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct FakeState {
    bridge_registration_status: Option<u16>,
    heartbeat_status: Option<u16>,
    fetch_status: Option<u16>,
    submit_status: Option<u16>,
    bridge_registrations: Vec<BridgeRegistration>,
    heartbeats: usize,
    device_registrations: Vec<DeviceRegistration>,
    unregistered: Vec<String>,
    batches: HashMap<String, VecDeque<Vec<BatchItem>>>,
    fetches: HashMap<String, usize>,
    responses: Vec<CommandResponse>,
    api_keys: Vec<String>,
}

/// In-memory controller
pub struct FakeGateway {
    state: Mutex<FakeState>,
    /// When set, device registration waits for a permit
    registration_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            registration_gate: Mutex::new(None),
        })
    }

    /// Factory handing out this gateway for any URL
    pub fn factory(self: &Arc<Self>) -> Arc<dyn GatewayFactory> {
        let gateway: Arc<dyn RemoteGateway> = self.clone();
        Arc::new(move |_url: &str| -> Result<Arc<dyn RemoteGateway>, GatewayError> {
            Ok(gateway.clone())
        })
    }

    pub fn reject_bridge_registration(&self, status: u16) {
        lock(&self.state).bridge_registration_status = Some(status);
    }

    pub fn accept_bridge_registration(&self) {
        lock(&self.state).bridge_registration_status = None;
    }

    pub fn fail_heartbeats(&self, status: u16) {
        lock(&self.state).heartbeat_status = Some(status);
    }

    pub fn fail_fetches(&self, status: Option<u16>) {
        lock(&self.state).fetch_status = status;
    }

    pub fn fail_submissions(&self, status: u16) {
        lock(&self.state).submit_status = Some(status);
    }

    /// Hold device registrations until [`FakeGateway::release_registrations`]
    pub fn hold_registrations(&self) {
        *lock(&self.registration_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_registrations(&self, count: usize) {
        if let Some(gate) = lock(&self.registration_gate).as_ref() {
            gate.add_permits(count);
        }
    }

    /// Serve `commands` as one batch on the next fetch for `device_id`
    pub fn queue_batch(&self, device_id: &str, commands: Vec<PendingCommand>) {
        self.queue_items(device_id, commands.into_iter().map(BatchItem::from).collect());
    }

    /// Serve a raw JSON array, decoded the way the HTTP gateway decodes it
    pub fn queue_body(&self, device_id: &str, body: serde_json::Value) {
        let elements: Vec<serde_json::Value> =
            serde_json::from_value(body).expect("batch body must be an array");
        self.queue_items(
            device_id,
            elements.into_iter().map(BatchItem::from_value).collect(),
        );
    }

    fn queue_items(&self, device_id: &str, items: Vec<BatchItem>) {
        lock(&self.state)
            .batches
            .entry(device_id.to_string())
            .or_default()
            .push_back(items);
    }

    pub fn bridge_registrations(&self) -> Vec<BridgeRegistration> {
        lock(&self.state).bridge_registrations.clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        lock(&self.state).heartbeats
    }

    pub fn device_registrations(&self) -> Vec<DeviceRegistration> {
        lock(&self.state).device_registrations.clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        lock(&self.state).unregistered.clone()
    }

    pub fn fetch_count(&self, device_id: &str) -> usize {
        lock(&self.state).fetches.get(device_id).copied().unwrap_or(0)
    }

    pub fn responses(&self) -> Vec<CommandResponse> {
        lock(&self.state).responses.clone()
    }

    /// Every api key presented on authenticated calls
    pub fn api_keys(&self) -> Vec<String> {
        lock(&self.state).api_keys.clone()
    }

    fn check(operation: &'static str, status: Option<u16>) -> Result<(), GatewayError> {
        match status {
            Some(status) => Err(GatewayError::Status { operation, status }),
            None => Ok(()),
        }
    }

    fn authenticated(&self, credentials: &BridgeCredentials) -> MutexGuard<'_, FakeState> {
        let mut state = lock(&self.state);
        state.api_keys.push(credentials.api_key.clone());
        state
    }
}

#[async_trait]
impl RemoteGateway for FakeGateway {
    async fn register_bridge(
        &self,
        registration: &BridgeRegistration,
    ) -> Result<RegisteredBridge, GatewayError> {
        let mut state = lock(&self.state);
        state.bridge_registrations.push(registration.clone());
        Self::check("Registration", state.bridge_registration_status)?;

        Ok(RegisteredBridge {
            id: BRIDGE_ID.to_string(),
            api_key: API_KEY.to_string(),
            name: registration.name.clone(),
            device_info: registration.device_info.clone(),
            registered_at: None,
            last_seen: None,
        })
    }

    async fn heartbeat(&self, credentials: &BridgeCredentials) -> Result<(), GatewayError> {
        let mut state = self.authenticated(credentials);
        state.heartbeats += 1;
        Self::check("Heartbeat", state.heartbeat_status)
    }

    async fn register_device(
        &self,
        credentials: &BridgeCredentials,
        device: &DeviceRegistration,
    ) -> Result<RegisteredDevice, GatewayError> {
        let gate = lock(&self.registration_gate).clone();
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }

        let mut state = self.authenticated(credentials);
        state.device_registrations.push(device.clone());
        let id = format!("device-{}", state.device_registrations.len());

        Ok(RegisteredDevice {
            id,
            bridge_id: Some(credentials.bridge_id.clone()),
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            manufacturer: device.manufacturer.clone(),
            product_name: device.product_name.clone(),
            serial_number: device.serial_number.clone(),
            status: "online".to_string(),
            registered_at: None,
        })
    }

    async fn unregister_device(
        &self,
        credentials: &BridgeCredentials,
        device_id: &str,
    ) -> Result<(), GatewayError> {
        self.authenticated(credentials)
            .unregistered
            .push(device_id.to_string());
        Ok(())
    }

    async fn pending_commands(
        &self,
        credentials: &BridgeCredentials,
        device_id: &str,
    ) -> Result<Vec<BatchItem>, GatewayError> {
        let mut state = self.authenticated(credentials);
        *state.fetches.entry(device_id.to_string()).or_default() += 1;
        Self::check("Get commands", state.fetch_status)?;

        Ok(state
            .batches
            .get_mut(device_id)
            .and_then(|batches| batches.pop_front())
            .unwrap_or_default())
    }

    async fn submit_response(
        &self,
        credentials: &BridgeCredentials,
        response: &CommandResponse,
    ) -> Result<(), GatewayError> {
        let mut state = self.authenticated(credentials);
        state.responses.push(response.clone());
        Self::check("Submit response", state.submit_status)
    }
}

/// Platform whose enumeration returns a fixed set of mock devices
#[derive(Default)]
pub struct StaticPlatform {
    devices: Mutex<Vec<Arc<MockUsbDevice>>>,
}

impl StaticPlatform {
    pub fn new(devices: Vec<Arc<MockUsbDevice>>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
        })
    }
}

impl UsbPlatform for StaticPlatform {
    fn enumerate(&self) -> Vec<AttachRequest> {
        lock(&self.devices)
            .iter()
            .map(|device| device.attach_request())
            .collect()
    }
}

/// Control IN command reading `length` bytes
pub fn control_in(id: &str, device_id: &str, length: u32) -> PendingCommand {
    PendingCommand {
        id: id.to_string(),
        device_id: device_id.to_string(),
        transfer_type: TransferKind::Control,
        request_type: Some(0xC0),
        request: Some(0x01),
        value: Some(0),
        index: Some(0),
        length: Some(length),
        endpoint: None,
        direction: Some(Direction::In),
        data: None,
        created_at: None,
    }
}

/// Bulk command addressed to `endpoint`
pub fn bulk(id: &str, device_id: &str, endpoint: u8, direction: Direction) -> PendingCommand {
    PendingCommand {
        id: id.to_string(),
        device_id: device_id.to_string(),
        transfer_type: TransferKind::Bulk,
        request_type: None,
        request: None,
        value: None,
        index: None,
        length: Some(16),
        endpoint: Some(endpoint),
        direction: Some(direction),
        data: match direction {
            Direction::Out => Some(protocol::encode_payload(&[0xAA; 4])),
            Direction::In => None,
        },
        created_at: None,
    }
}

/// Generous bound for waits in async tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll an async `condition` until it holds or [`WAIT`] passes
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
