//! Controller RPC surface
//!
//! The engine only ever talks to the controller through [`RemoteGateway`].
//! [`HttpGateway`] is the production binding; tests substitute an in-memory
//! implementation through a [`GatewayFactory`].

mod http;

pub use http::{HttpGateway, HttpGatewayFactory};

use async_trait::async_trait;
use protocol::{
    BatchItem, BridgeRegistration, CommandResponse, DeviceRegistration, RegisteredBridge,
    RegisteredDevice,
};
use std::sync::Arc;
use thiserror::Error;

/// Failure of a single controller call
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Controller answered with a non-2xx status
    #[error("{operation} failed: {status}")]
    Status { operation: &'static str, status: u16 },

    /// Connection, TLS or timeout failure
    #[error("{operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// 2xx response whose body did not match the expected shape
    #[error("{operation} returned a malformed body: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid server URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl GatewayError {
    /// HTTP status of a rejected call, if the controller answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Credentials handed out by bridge registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCredentials {
    pub bridge_id: String,
    pub api_key: String,
}

impl From<&RegisteredBridge> for BridgeCredentials {
    fn from(bridge: &RegisteredBridge) -> Self {
        Self {
            bridge_id: bridge.id.clone(),
            api_key: bridge.api_key.clone(),
        }
    }
}

/// Controller operations consumed by the bridge engine
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn register_bridge(
        &self,
        registration: &BridgeRegistration,
    ) -> Result<RegisteredBridge, GatewayError>;

    async fn heartbeat(&self, credentials: &BridgeCredentials) -> Result<(), GatewayError>;

    async fn register_device(
        &self,
        credentials: &BridgeCredentials,
        device: &DeviceRegistration,
    ) -> Result<RegisteredDevice, GatewayError>;

    async fn unregister_device(
        &self,
        credentials: &BridgeCredentials,
        device_id: &str,
    ) -> Result<(), GatewayError>;

    /// Fetch the pending batch for `device_id`, decoded per element
    async fn pending_commands(
        &self,
        credentials: &BridgeCredentials,
        device_id: &str,
    ) -> Result<Vec<BatchItem>, GatewayError>;

    /// Submit the outcome of `response.command_id`
    async fn submit_response(
        &self,
        credentials: &BridgeCredentials,
        response: &CommandResponse,
    ) -> Result<(), GatewayError>;
}

/// Builds a gateway for a controller base URL
pub trait GatewayFactory: Send + Sync {
    fn create(&self, server_url: &str) -> Result<Arc<dyn RemoteGateway>, GatewayError>;
}

impl<F> GatewayFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn RemoteGateway>, GatewayError> + Send + Sync,
{
    fn create(&self, server_url: &str) -> Result<Arc<dyn RemoteGateway>, GatewayError> {
        self(server_url)
    }
}
