//! Bridge lifecycle
//!
//! [`ConnectionManager`] owns the bridge-level state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! A successful `connect` registers the bridge and starts one session:
//! the heartbeat loop, the platform event pump and the initial device
//! sweep. Every task of the session hangs off one cancellation token, so
//! `disconnect` stops all of them at once.

use crate::dispatcher::{CommandDispatcher, DEFAULT_POLL_INTERVAL, DispatchTarget};
use crate::error::{BridgeError, Result};
use crate::gateway::{BridgeCredentials, GatewayFactory, RemoteGateway};
use crate::identity;
use crate::usb::platform::UsbPlatform;
use crate::usb::registry::{AttachedDevice, DeviceRegistry, DeviceStatus};
use crate::usb::transfers::TransferExecutor;
use common::{AttachRequest, DeviceKey, Permission, PlatformEvent, PlatformEventReceiver};
use protocol::{BridgeRegistration, RegisteredBridge};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Default heartbeat period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Registered identity of this bridge, valid for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    pub id: String,
    pub api_key: String,
    pub name: String,
    pub device_info: HashMap<String, String>,
}

impl From<RegisteredBridge> for Bridge {
    fn from(registered: RegisteredBridge) -> Self {
        Self {
            id: registered.id,
            api_key: registered.api_key,
            name: registered.name,
            device_info: registered.device_info,
        }
    }
}

impl Bridge {
    pub fn credentials(&self) -> BridgeCredentials {
        BridgeCredentials {
            bridge_id: self.id.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

/// One row of [`ConnectionManager::devices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub key: DeviceKey,
    pub status: DeviceStatus,
    pub remote_id: Option<String>,
    pub description: String,
}

/// Tunables of a [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub bridge_name: String,
    pub device_info: HashMap<String, String>,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub transfer_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            bridge_name: identity::default_bridge_name(),
            device_info: identity::device_info(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            transfer_timeout: TransferExecutor::default().timeout(),
        }
    }
}

/// State owned by one connected session
struct Session {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Shared by every task of a session
struct SessionContext {
    gateway: Arc<dyn RemoteGateway>,
    credentials: BridgeCredentials,
    registry: DeviceRegistry,
    dispatcher: Arc<CommandDispatcher>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Owns the bridge registration and everything that depends on it
pub struct ConnectionManager {
    factory: Arc<dyn GatewayFactory>,
    platform: Arc<dyn UsbPlatform>,
    events: PlatformEventReceiver,
    registry: DeviceRegistry,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    bridge: RwLock<Option<Bridge>>,
    /// Serializes connect and disconnect
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn GatewayFactory>,
        platform: Arc<dyn UsbPlatform>,
        events: PlatformEventReceiver,
        settings: ConnectionSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            factory,
            platform,
            events,
            registry: DeviceRegistry::new(),
            settings,
            state,
            bridge: RwLock::new(None),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Connection-state change notifications
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub async fn bridge(&self) -> Option<Bridge> {
        self.bridge.read().await.clone()
    }

    /// Open devices in attach order
    pub async fn devices(&self) -> Vec<DeviceSummary> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .map(|device| DeviceSummary {
                description: device.info.description(),
                key: device.key,
                status: device.status,
                remote_id: device.remote_id,
            })
            .collect()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state: {} -> {}", previous, state);
        }
    }

    /// Register with the controller at `server_url` and start the session
    ///
    /// Fails without retrying when registration fails; the manager is then
    /// back in `Disconnected` and the caller may try again.
    pub async fn connect(&self, server_url: &str) -> Result<Bridge> {
        let mut session = self.session.lock().await;
        let current = self.state();
        if current != ConnectionState::Disconnected {
            return Err(BridgeError::AlreadyConnected(current));
        }

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", server_url);

        let (gateway, registered) = match self.register(server_url).await {
            Ok(registered) => registered,
            Err(e) => {
                error!("Bridge registration failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let bridge = Bridge::from(registered);
        let credentials = bridge.credentials();

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let dispatcher = Arc::new(CommandDispatcher::new(
            gateway.clone(),
            credentials.clone(),
            self.registry.clone(),
            TransferExecutor::new(self.settings.transfer_timeout),
            self.settings.poll_interval,
        ));
        let context = Arc::new(SessionContext {
            gateway,
            credentials,
            registry: self.registry.clone(),
            dispatcher,
            cancel: cancel.clone(),
            tasks: tasks.clone(),
        });

        let stale = self.events.drain();
        if stale > 0 {
            debug!("Dropped {} platform event(s) queued before connect", stale);
        }

        *self.bridge.write().await = Some(bridge.clone());
        self.set_state(ConnectionState::Connected);
        info!("Bridge registered as '{}' (id {})", bridge.name, bridge.id);

        tasks.spawn(heartbeat_loop(
            context.clone(),
            self.settings.heartbeat_interval,
        ));
        tasks.spawn(sweep_devices(context.clone(), self.platform.clone()));
        tasks.spawn(pump_events(context, self.events.clone()));

        *session = Some(Session { cancel, tasks });
        Ok(bridge)
    }

    async fn register(
        &self,
        server_url: &str,
    ) -> Result<(Arc<dyn RemoteGateway>, RegisteredBridge)> {
        let gateway = self.factory.create(server_url)?;
        let registration = BridgeRegistration {
            name: self.settings.bridge_name.clone(),
            device_info: self.settings.device_info.clone(),
        };
        let registered = gateway.register_bridge(&registration).await?;
        Ok((gateway, registered))
    }

    /// Stop every session task, close every device and forget the bridge
    ///
    /// Safe to call in any state; a second call is a no-op.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        let Some(Session { cancel, tasks }) = session.take() else {
            debug!("Disconnect requested while already disconnected");
            return;
        };

        self.set_state(ConnectionState::Disconnecting);
        info!("Disconnecting bridge");

        cancel.cancel();
        let closed = self.registry.clear().await;
        tasks.close();
        tasks.wait().await;

        // Anything an in-flight attach opened after the first sweep
        let late = self.registry.clear().await;
        *self.bridge.write().await = None;
        self.set_state(ConnectionState::Disconnected);
        info!(
            "Bridge disconnected, closed {} device(s)",
            closed.len() + late.len()
        );
    }
}

impl SessionContext {
    /// Open a device, register it remotely and start its command loop
    async fn attach(self: Arc<Self>, request: AttachRequest) {
        let key = request.key();
        let attached = tokio::select! {
            _ = self.cancel.cancelled() => return,
            attached = self.registry.attach(request, &self.cancel) => attached,
        };
        match attached {
            // Untracked: a registration finishing after disconnect only
            // unregisters its orphaned remote id
            Ok(attached) => {
                tokio::spawn(self.clone().register_device(attached));
            }
            Err(e) => warn!("Not bridging {}: {}", key, e),
        }
    }

    async fn register_device(self: Arc<Self>, attached: AttachedDevice) {
        let registration = attached.info.registration();
        let registered = match self
            .gateway
            .register_device(&self.credentials, &registration)
            .await
        {
            Ok(registered) => registered,
            Err(e) => {
                error!("Failed to register device {}: {}", attached.key, e);
                return;
            }
        };

        if let Err(e) = self
            .registry
            .set_remote_id(&attached.key, attached.epoch, registered.id.clone())
            .await
        {
            warn!(
                "Device registration for {} completed after detach ({}), unregistering {}",
                attached.key, e, registered.id
            );
            self.unregister(registered.id);
            return;
        }

        info!(
            "Device {} registered with id {}",
            attached.key, registered.id
        );

        let target = DispatchTarget {
            key: attached.key,
            epoch: attached.epoch,
            remote_id: registered.id,
        };
        let dispatcher = self.dispatcher.clone();
        self.tasks
            .spawn(async move { dispatcher.run(target, attached.cancel).await });
    }

    async fn detach(&self, key: DeviceKey) {
        match self.registry.detach(&key).await {
            Some(detached) => {
                if let Some(remote_id) = detached.remote_id {
                    self.unregister(remote_id);
                }
            }
            None => debug!("Detach for {} which is not open", key),
        }
    }

    /// Fire-and-forget remote unregistration
    fn unregister(&self, remote_id: String) {
        let gateway = self.gateway.clone();
        let credentials = self.credentials.clone();
        tokio::spawn(async move {
            match gateway.unregister_device(&credentials, &remote_id).await {
                Ok(()) => debug!("Device {} unregistered", remote_id),
                Err(e) => warn!("Failed to unregister device {}: {}", remote_id, e),
            }
        });
    }
}

async fn heartbeat_loop(context: Arc<SessionContext>, period: Duration) {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = context.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let result = tokio::select! {
            _ = context.cancel.cancelled() => break,
            result = context.gateway.heartbeat(&context.credentials) => result,
        };
        match result {
            Ok(()) => debug!("Heartbeat sent"),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    debug!("Heartbeat loop stopped");
}

/// Attach every device already plugged in
async fn sweep_devices(context: Arc<SessionContext>, platform: Arc<dyn UsbPlatform>) {
    let requests = match tokio::task::spawn_blocking(move || platform.enumerate()).await {
        Ok(requests) => requests,
        Err(e) => {
            error!("Device enumeration failed: {}", e);
            return;
        }
    };
    info!("Found {} bridgeable device(s)", requests.len());

    for request in requests {
        if context.cancel.is_cancelled() {
            break;
        }
        context.clone().attach(request).await;
    }
}

async fn pump_events(context: Arc<SessionContext>, events: PlatformEventReceiver) {
    loop {
        let event = tokio::select! {
            _ = context.cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            // Granted opens are quick; handle them in order with detaches
            Ok(PlatformEvent::Attached(request))
                if matches!(request.permission, Permission::Granted) =>
            {
                context.clone().attach(request).await;
            }
            Ok(PlatformEvent::Attached(request)) => {
                context.tasks.spawn(context.clone().attach(request));
            }
            Ok(PlatformEvent::Detached(key)) => context.detach(key).await,
            Err(e) => {
                debug!("Platform event channel closed: {}", e);
                break;
            }
        }
    }
}
