//! Per-device command polling
//!
//! One loop runs per registered device. Each cycle fetches the pending
//! commands for the device's remote id, executes them one at a time in
//! fetch order and submits every result as soon as it is produced.

use crate::gateway::{BridgeCredentials, RemoteGateway};
use crate::usb::registry::DeviceRegistry;
use crate::usb::transfers::TransferExecutor;
use common::{DeviceKey, UsbHandle};
use protocol::{BatchItem, CommandResponse, PendingCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Default pause between polling cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The registry entry a loop is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub key: DeviceKey,
    pub epoch: u64,
    pub remote_id: String,
}

/// What one polling cycle did
///
/// Malformed commands are answered with a failure but never counted as
/// executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No pending commands
    Idle,
    /// Executed this many commands
    Completed(usize),
    /// Fetch failed; the next cycle retries
    FetchFailed,
    /// Device detached or re-plugged; the loop must stop
    DeviceGone { executed: usize },
    Cancelled { executed: usize },
}

/// Fetches, executes and reports commands for registered devices
pub struct CommandDispatcher {
    gateway: Arc<dyn RemoteGateway>,
    credentials: BridgeCredentials,
    registry: DeviceRegistry,
    executor: TransferExecutor,
    poll_interval: Duration,
}

impl CommandDispatcher {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        credentials: BridgeCredentials,
        registry: DeviceRegistry,
        executor: TransferExecutor,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gateway,
            credentials,
            registry,
            executor,
            poll_interval,
        }
    }

    /// Poll until `cancel` fires or the device leaves the registry
    pub async fn run(&self, target: DispatchTarget, cancel: CancellationToken) {
        info!(
            "Command polling started for {} (remote id {})",
            target.key, target.remote_id
        );

        loop {
            match self.poll_once(&target, &cancel).await {
                CycleOutcome::DeviceGone { .. } | CycleOutcome::Cancelled { .. } => break,
                CycleOutcome::Idle | CycleOutcome::Completed(_) | CycleOutcome::FetchFailed => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.poll_interval) => {}
            }
        }

        info!("Command polling stopped for {}", target.key);
    }

    /// Run a single fetch/execute/submit cycle
    pub async fn poll_once(
        &self,
        target: &DispatchTarget,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CycleOutcome::Cancelled { executed: 0 },
            fetched = self.gateway.pending_commands(&self.credentials, &target.remote_id) => fetched,
        };

        let items = match fetched {
            Ok(items) => items,
            Err(e) => {
                warn!("Failed to fetch commands for {}: {}", target.remote_id, e);
                return CycleOutcome::FetchFailed;
            }
        };

        if items.is_empty() {
            trace!("No pending commands for {}", target.remote_id);
            return CycleOutcome::Idle;
        }
        debug!("Fetched {} command(s) for {}", items.len(), target.remote_id);

        let mut executed = 0;
        for item in items {
            if cancel.is_cancelled() {
                return CycleOutcome::Cancelled { executed };
            }

            let command = match item {
                BatchItem::Command(command) => command,
                BatchItem::Malformed { id: Some(id), error } => {
                    warn!("Rejecting malformed command {}: {}", id, error);
                    let response = CommandResponse::failure(id, format!("Invalid command: {}", error));
                    self.submit(&response).await;
                    continue;
                }
                BatchItem::Malformed { id: None, error } => {
                    warn!(
                        "Skipping command without id for {}: {}",
                        target.remote_id, error
                    );
                    continue;
                }
            };

            // Re-read the live entry; the handle must belong to this plug-in
            let Some(device) = self.registry.get_current(&target.key, target.epoch).await else {
                debug!(
                    "Device {} gone, dropping the rest of the batch",
                    target.key
                );
                return CycleOutcome::DeviceGone { executed };
            };

            let response = self.execute(command, device.handle).await;
            executed += 1;
            self.submit(&response).await;

            if cancel.is_cancelled() {
                return CycleOutcome::Cancelled { executed };
            }
        }

        CycleOutcome::Completed(executed)
    }

    /// Execute on the blocking pool so a slow transfer never stalls the runtime
    async fn execute(&self, command: PendingCommand, handle: Arc<dyn UsbHandle>) -> CommandResponse {
        let executor = self.executor;
        let command_id = command.id.clone();

        debug!(
            "Executing command {} ({:?})",
            command.id, command.transfer_type
        );

        match tokio::task::spawn_blocking(move || executor.execute(&command, handle.as_ref())).await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Transfer task for command {} failed: {}", command_id, e);
                CommandResponse::failure(command_id, format!("Transfer aborted: {}", e))
            }
        }
    }

    async fn submit(&self, response: &CommandResponse) {
        match self
            .gateway
            .submit_response(&self.credentials, response)
            .await
        {
            Ok(()) => debug!(
                "Submitted result for command {} (success={})",
                response.command_id, response.success
            ),
            Err(e) => warn!(
                "Failed to submit result for command {}: {}",
                response.command_id, e
            ),
        }
    }
}
