//! HTTP bridge to a peer server.
//!
//! Commands are posted as request envelopes to the peer's `/command`
//! endpoint; the response must echo the request id. Content changes are
//! pulled per group through the peer's subscription endpoints.

use super::{Bridge, BridgeError, check_correlation};
use crate::api::{ChangesResponse, ErrorResponse, ExportResponse, HealthResponse};
use crate::api::{SubscribeRequest, SubscribeResponse};
use bassline_core::{
    BridgeKind, CommandRequest, CommandResponse, ContactChange, ErrorCode, ExternalInput,
    GroupId, GroupTemplate, decode_template,
};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct RemoteBridge {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    next_request: AtomicU64,
}

impl RemoteBridge {
    /// A bridge to the peer at `base_url`, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: None,
            next_request: AtomicU64::new(1),
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn next_request_id(&self) -> String {
        format!("remote-{}", self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Post a raw request envelope. The caller owns correlation.
    pub async fn execute(&self, request: &CommandRequest) -> Result<CommandResponse, BridgeError> {
        let response = self
            .authorize(self.client.post(self.url("/command")))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        // Command failures come back as envelopes whatever the status;
        // anything else is a transport failure (auth, rate limit).
        serde_json::from_slice(&body).map_err(|_| {
            BridgeError::Transport(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ))
        })
    }

    // =========================================================================
    // PEER ENDPOINTS
    // =========================================================================

    pub async fn health(&self) -> Result<HealthResponse, BridgeError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(transport)?;
        read_json(response).await
    }

    /// Start queuing the changes of one group on the peer.
    pub async fn subscribe(&self, group_id: GroupId) -> Result<u64, BridgeError> {
        let response = self
            .authorize(self.client.post(self.url("/subscriptions")))
            .json(&SubscribeRequest { group_id })
            .send()
            .await
            .map_err(transport)?;
        let body: SubscribeResponse = read_json(response).await?;
        Ok(body.subscription_id)
    }

    /// Take the changes queued since the last poll.
    pub async fn poll_changes(&self, subscription_id: u64) -> Result<Vec<ContactChange>, BridgeError> {
        let path = format!("/subscriptions/{}/changes", subscription_id);
        let response = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .await
            .map_err(transport)?;
        let body: ChangesResponse = read_json(response).await?;
        if body.dropped > 0 {
            tracing::warn!(
                subscription_id,
                dropped = body.dropped,
                "peer dropped changes before poll"
            );
        }
        Ok(body.changes)
    }

    pub async fn unsubscribe(&self, subscription_id: u64) -> Result<(), BridgeError> {
        let path = format!("/subscriptions/{}", subscription_id);
        let response = self
            .authorize(self.client.delete(self.url(&path)))
            .send()
            .await
            .map_err(transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status(), "unknown subscription".to_string()))
        }
    }

    /// Fetch a group as a binary template and decode it locally.
    pub async fn export_binary(&self, group_id: GroupId) -> Result<GroupTemplate, BridgeError> {
        let path = format!("/groups/{}/export", group_id.0);
        let response = self
            .authorize(self.client.get(self.url(&path)))
            .send()
            .await
            .map_err(transport)?;
        let body: ExportResponse = read_json(response).await?;
        let data = body
            .data
            .ok_or_else(|| BridgeError::Decode("export without data".to_string()))?;
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
            .map_err(|e| BridgeError::Decode(format!("base64: {}", e)))?;
        decode_template(&bytes).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

impl Bridge for RemoteBridge {
    const KIND: BridgeKind = BridgeKind::Remote;

    fn send(&self, input: ExternalInput) -> impl Future<Output = Result<Value, BridgeError>> + Send {
        async move {
            let request_id = self.next_request_id();
            let request = CommandRequest::new(input).with_request_id(request_id.clone());
            let response = self.execute(&request).await?;
            check_correlation(&request_id, response.request_id.as_deref())?;
            response.into_result().map_err(BridgeError::from)
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn transport(error: reqwest::Error) -> BridgeError {
    BridgeError::Transport(error.to_string())
}

fn status_error(status: StatusCode, message: String) -> BridgeError {
    let code = match status {
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::InvalidInput,
        _ => return BridgeError::Transport(format!("HTTP {}: {}", status, message)),
    };
    BridgeError::Command { code, message }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BridgeError> {
    let status = response.status();
    let body = response.bytes().await.map_err(transport)?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        return Err(status_error(status, message));
    }
    serde_json::from_slice(&body).map_err(|e| BridgeError::Decode(e.to_string()))
}
