//! # API Request/Response Types
//!
//! JSON bodies of the peer endpoints other than `/command`, which speaks the
//! kernel's own request and response envelopes.

use bassline_core::{ContactChange, GroupId, GroupTemplate};
use serde::{Deserialize, Serialize};

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscription_id: u64,
    pub group_id: GroupId,
}

/// Changes queued for a subscription since the last poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub subscription_id: u64,
    pub changes: Vec<ContactChange>,
    /// Changes discarded because the queue was full.
    pub dropped: u64,
}

// =============================================================================
// EXPORT
// =============================================================================

/// A group template, as JSON and in the framed binary form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub success: bool,
    pub group_id: Option<GroupId>,
    pub template: Option<GroupTemplate>,
    /// Base64 encoded binary template.
    pub data: Option<String>,
    pub error: Option<String>,
}

impl ExportResponse {
    pub fn success(group_id: GroupId, template: GroupTemplate, data: &[u8]) -> Self {
        Self {
            success: true,
            group_id: Some(group_id),
            template: Some(template),
            data: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                data,
            )),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            group_id: None,
            template: None,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}
