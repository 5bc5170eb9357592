//! HTTP+JSON binding of the controller API

use super::{BridgeCredentials, GatewayError, GatewayFactory, RemoteGateway};
use async_trait::async_trait;
use protocol::{
    BatchItem, BridgeRegistration, CommandResponse, DeviceRegistration, RegisteredBridge,
    RegisteredDevice,
};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// Controller client over `reqwest`
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpGateway {
    /// Create a client for `base_url`, e.g. `http://controller:8000/api`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let invalid = |reason: String| GatewayError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };

        let url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.cannot_be_a_base() {
            return Err(invalid("URL cannot be used as a base".to_string()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            client,
            base_url: url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `<base>/<segments...>[?api_key=...]`
    ///
    /// Segments are percent-encoded, so remote ids can never escape the path.
    fn endpoint(&self, segments: &[&str], api_key: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if let Some(key) = api_key {
            url.query_pairs_mut().append_pair("api_key", key);
        }
        url
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|source| GatewayError::Transport { operation, source })?;

        let status = response.status();
        trace!("{} -> {}", operation, status);
        if !status.is_success() {
            return Err(GatewayError::Status {
                operation,
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let body = response
            .bytes()
            .await
            .map_err(|source| GatewayError::Transport { operation, source })?;
        serde_json::from_slice(&body).map_err(|source| GatewayError::Decode { operation, source })
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn register_bridge(
        &self,
        registration: &BridgeRegistration,
    ) -> Result<RegisteredBridge, GatewayError> {
        const OP: &str = "Registration";
        let url = self.endpoint(&["bridges", "register"], None);
        debug!("Registering bridge '{}' at {}", registration.name, url);

        let response = self.send(OP, self.client.post(url).json(registration)).await?;
        Self::decode(OP, response).await
    }

    async fn heartbeat(&self, credentials: &BridgeCredentials) -> Result<(), GatewayError> {
        let url = self.endpoint(
            &["bridges", &credentials.bridge_id, "heartbeat"],
            Some(&credentials.api_key),
        );
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body("");
        self.send("Heartbeat", request).await.map(|_| ())
    }

    async fn register_device(
        &self,
        credentials: &BridgeCredentials,
        device: &DeviceRegistration,
    ) -> Result<RegisteredDevice, GatewayError> {
        const OP: &str = "Device registration";
        let url = self.endpoint(&["devices", "register"], Some(&credentials.api_key));

        let response = self.send(OP, self.client.post(url).json(device)).await?;
        Self::decode(OP, response).await
    }

    async fn unregister_device(
        &self,
        credentials: &BridgeCredentials,
        device_id: &str,
    ) -> Result<(), GatewayError> {
        let url = self.endpoint(&["devices", device_id], Some(&credentials.api_key));
        self.send("Device unregistration", self.client.delete(url))
            .await
            .map(|_| ())
    }

    async fn pending_commands(
        &self,
        credentials: &BridgeCredentials,
        device_id: &str,
    ) -> Result<Vec<BatchItem>, GatewayError> {
        const OP: &str = "Get commands";
        let url = self.endpoint(
            &["commands", device_id, "pending"],
            Some(&credentials.api_key),
        );

        let response = self.send(OP, self.client.get(url)).await?;
        let elements: Vec<serde_json::Value> = Self::decode(OP, response).await?;
        Ok(elements.into_iter().map(BatchItem::from_value).collect())
    }

    async fn submit_response(
        &self,
        credentials: &BridgeCredentials,
        response: &CommandResponse,
    ) -> Result<(), GatewayError> {
        let url = self.endpoint(
            &["commands", &response.command_id, "response"],
            Some(&credentials.api_key),
        );
        self.send("Submit response", self.client.post(url).json(response))
            .await
            .map(|_| ())
    }
}

/// Creates [`HttpGateway`]s with a fixed request timeout
#[derive(Debug, Clone)]
pub struct HttpGatewayFactory {
    timeout: Duration,
}

impl HttpGatewayFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl GatewayFactory for HttpGatewayFactory {
    fn create(&self, server_url: &str) -> Result<Arc<dyn RemoteGateway>, GatewayError> {
        Ok(Arc::new(HttpGateway::new(server_url, self.timeout)?))
    }
}
