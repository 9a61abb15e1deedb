//! # Command Protocol
//!
//! Every front-end drives the kernel through one serializable command type,
//! [`ExternalInput`], wrapped in a [`CommandRequest`] envelope that carries an
//! optional request id for correlation. The JSON shape is flat:
//!
//! ```json
//! { "requestId": "7", "type": "add-contact", "groupId": 3, "content": 5 }
//! ```
//!
//! and the reply is either `{"requestId": "7", "data": ...}` or
//! `{"requestId": "7", "error": {"code": "not-found", "message": "..."}}`.

use crate::gadget::ModuleSource;
use crate::group::GroupSnapshot;
use crate::history::HistoryError;
use crate::template::{GroupTemplate, SkippedWire};
use crate::types::{
    BlendMode, Contact, ContactId, CoreError, GroupId, OwnedWire, Wire, WireId, WireType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Source reported in logs for commands replayed by the history driver.
/// Replays never come through a request envelope, so a request claiming
/// this source is treated like any other.
pub const HISTORY_SOURCE: &str = "history-driver";

// =============================================================================
// COMMANDS
// =============================================================================

/// A command against the kernel.
///
/// Field names are camelCase on the wire; the variant is selected by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ExternalInput {
    /// Create a contact in a group, optionally with initial content.
    AddContact {
        group_id: GroupId,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        blend_mode: Option<BlendMode>,
    },

    /// Write a value to a contact. Applied through the active scheduler.
    /// A `null` value clears the contact.
    ContactUpdate {
        contact_id: ContactId,
        group_id: GroupId,
        #[serde(default)]
        value: Option<Value>,
    },

    /// Create a group, as a new root or below a parent. With `primitiveId`
    /// the group is an instance of that gadget.
    AddGroup {
        name: String,
        #[serde(default)]
        parent_group_id: Option<GroupId>,
        #[serde(default)]
        primitive_id: Option<String>,
    },

    /// Wire two contacts. The wire type is `wireType` because `type` is the
    /// command tag.
    CreateWire {
        from_contact_id: ContactId,
        to_contact_id: ContactId,
        #[serde(default)]
        wire_type: Option<WireType>,
    },

    RemoveWire {
        wire_id: WireId,
    },

    RemoveContact {
        contact_id: ContactId,
    },

    RemoveGroup {
        group_id: GroupId,
    },

    QueryGroup {
        group_id: GroupId,
        #[serde(default)]
        options: QueryOptions,
    },

    /// Content of a contact; `null` when undefined.
    QueryContact {
        contact_id: ContactId,
    },

    LoadPrimitive {
        module_source: ModuleSource,
        namespace: String,
    },

    CreatePrimitiveGadget {
        qualified_name: String,
        #[serde(default)]
        parent_group_id: Option<GroupId>,
    },

    ListPrimitives,

    ListPrimitiveInfo,

    GetPrimitiveInfo {
        qualified_name: String,
    },

    ListSchedulers,

    GetSchedulerInfo {
        scheduler_id: String,
    },

    SetScheduler {
        scheduler_id: String,
        #[serde(default)]
        config: Option<Value>,
    },

    Undo,

    Redo,

    GetHistory,

    StartRecording {
        description: String,
    },

    StopRecording,

    /// Discard the open recording session without committing an entry.
    CancelRecording,

    /// Structural template of a group subtree.
    ExportGroup {
        group_id: GroupId,
    },

    /// Instantiate a template as a new root or below a parent.
    ImportTemplate {
        template: GroupTemplate,
        #[serde(default)]
        parent_group_id: Option<GroupId>,
    },

    // -------------------------------------------------------------------------
    // Replay-only: issued in-process by the history driver, refused when
    // they arrive in a request.
    // -------------------------------------------------------------------------
    /// Overwrite contents without blending or propagating.
    SetContents {
        contents: Vec<ContentSnapshot>,
    },

    /// Re-insert a removed contact and its wires.
    RestoreContact {
        contact: Contact,
        #[serde(default)]
        wires: Vec<OwnedWire>,
    },

    RestoreWire {
        wire: OwnedWire,
    },

    /// Re-insert a removed subtree and the parent wires that touched it.
    RestoreGroup {
        snapshot: GroupSnapshot,
        #[serde(default)]
        wires: Vec<OwnedWire>,
    },
}

/// Every value of the `type` tag.
pub const COMMAND_TYPES: &[&str] = &[
    "add-contact",
    "contact-update",
    "add-group",
    "create-wire",
    "remove-wire",
    "remove-contact",
    "remove-group",
    "query-group",
    "query-contact",
    "load-primitive",
    "create-primitive-gadget",
    "list-primitives",
    "list-primitive-info",
    "get-primitive-info",
    "list-schedulers",
    "get-scheduler-info",
    "set-scheduler",
    "undo",
    "redo",
    "get-history",
    "start-recording",
    "stop-recording",
    "cancel-recording",
    "export-group",
    "import-template",
    "set-contents",
    "restore-contact",
    "restore-wire",
    "restore-group",
];

impl ExternalInput {
    /// The `type` tag of this command.
    pub const fn command_type(&self) -> &'static str {
        match self {
            Self::AddContact { .. } => "add-contact",
            Self::ContactUpdate { .. } => "contact-update",
            Self::AddGroup { .. } => "add-group",
            Self::CreateWire { .. } => "create-wire",
            Self::RemoveWire { .. } => "remove-wire",
            Self::RemoveContact { .. } => "remove-contact",
            Self::RemoveGroup { .. } => "remove-group",
            Self::QueryGroup { .. } => "query-group",
            Self::QueryContact { .. } => "query-contact",
            Self::LoadPrimitive { .. } => "load-primitive",
            Self::CreatePrimitiveGadget { .. } => "create-primitive-gadget",
            Self::ListPrimitives => "list-primitives",
            Self::ListPrimitiveInfo => "list-primitive-info",
            Self::GetPrimitiveInfo { .. } => "get-primitive-info",
            Self::ListSchedulers => "list-schedulers",
            Self::GetSchedulerInfo { .. } => "get-scheduler-info",
            Self::SetScheduler { .. } => "set-scheduler",
            Self::Undo => "undo",
            Self::Redo => "redo",
            Self::GetHistory => "get-history",
            Self::StartRecording { .. } => "start-recording",
            Self::StopRecording => "stop-recording",
            Self::CancelRecording => "cancel-recording",
            Self::ExportGroup { .. } => "export-group",
            Self::ImportTemplate { .. } => "import-template",
            Self::SetContents { .. } => "set-contents",
            Self::RestoreContact { .. } => "restore-contact",
            Self::RestoreWire { .. } => "restore-wire",
            Self::RestoreGroup { .. } => "restore-group",
        }
    }

    /// Commands owned by the history driver.
    pub const fn is_history(&self) -> bool {
        matches!(
            self,
            Self::Undo
                | Self::Redo
                | Self::GetHistory
                | Self::StartRecording { .. }
                | Self::StopRecording
                | Self::CancelRecording
        )
    }

    /// Commands only the history driver may issue.
    pub const fn is_replay_only(&self) -> bool {
        matches!(
            self,
            Self::SetContents { .. }
                | Self::RestoreContact { .. }
                | Self::RestoreWire { .. }
                | Self::RestoreGroup { .. }
        )
    }

    /// Parse a command from JSON, telling an unknown `type` apart from a
    /// malformed known command.
    pub fn from_json(value: Value) -> Result<Self, DispatchError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidInput("missing command type".to_string()))?;
        if !COMMAND_TYPES.contains(&kind) {
            return Err(DispatchError::UnknownCommand(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| DispatchError::InvalidInput(e.to_string()))
    }
}

/// Flags of `query-group`; all default to false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub include_contacts: bool,
    pub include_wires: bool,
    pub include_subgroups: bool,
}

/// Content of one contact at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    pub contact_id: ContactId,
    #[serde(default)]
    pub content: Option<Value>,
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// A command plus correlation metadata. `source` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(flatten)]
    pub input: ExternalInput,
}

/// A request that could not be parsed, with whatever id it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRequest {
    pub request_id: Option<String>,
    pub error: DispatchError,
}

impl CommandRequest {
    pub fn new(input: ExternalInput) -> Self {
        Self {
            request_id: None,
            source: None,
            input,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Parse an envelope from JSON.
    pub fn from_json(value: Value) -> Result<Self, RejectedRequest> {
        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let source = value
            .get("source")
            .and_then(Value::as_str)
            .map(str::to_string);
        match ExternalInput::from_json(value) {
            Ok(input) => Ok(Self {
                request_id,
                source,
                input,
            }),
            Err(error) => Err(RejectedRequest { request_id, error }),
        }
    }
}

/// Reply to a [`CommandRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl CommandResponse {
    pub fn success(request_id: Option<String>, data: Value) -> Self {
        Self {
            request_id,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(request_id: Option<String>, error: &DispatchError) -> Self {
        Self {
            request_id,
            data: None,
            error: Some(ErrorBody {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The result payload, or the error body.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

impl From<RejectedRequest> for CommandResponse {
    fn from(rejected: RejectedRequest) -> Self {
        Self::failure(rejected.request_id, &rejected.error)
    }
}

/// Error half of a [`CommandResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Machine-readable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    UnknownCommand,
    NotFound,
    InvalidInput,
    /// The request conflicts with current state (history misuse).
    Conflict,
    NotImplementedForRemote,
    Unsupported,
    Internal,
}

// =============================================================================
// RESULT PAYLOADS
// =============================================================================

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Outbound notification for every applied content change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactChange {
    pub contact_id: ContactId,
    pub group_id: GroupId,
    #[serde(default)]
    pub value: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Result of `query-group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<GroupId>,
    pub is_primitive: bool,
    #[serde(default)]
    pub primitive_id: Option<String>,
    pub boundary_contact_ids: Vec<ContactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<Vec<Contact>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wires: Option<Vec<Wire>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgroups: Option<Vec<GroupSummary>>,
}

/// One subgroup line of a [`GroupView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub is_primitive: bool,
    #[serde(default)]
    pub primitive_id: Option<String>,
}

/// Result of `contact-update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReceipt {
    pub scheduled: bool,
    /// Updates still waiting for the next tick.
    pub pending: usize,
}

/// Result of `import-template`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub group_id: GroupId,
    pub skipped_wires: Vec<SkippedWire>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors returned by command dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("'{0}' is reserved for history replay")]
    ReservedCommand(&'static str),

    #[error("'{0}' is not implemented for remote mode")]
    NotImplementedForRemote(String),

    #[error("'{0}' requires a history driver")]
    NoHistoryDriver(&'static str),

    #[error("kernel is not initialized")]
    NotInitialized,

    #[error("driver error: {0}")]
    Driver(String),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Self::InvalidInput(_) | Self::ReservedCommand(_) => ErrorCode::InvalidInput,
            Self::NotImplementedForRemote(_) => ErrorCode::NotImplementedForRemote,
            Self::NoHistoryDriver(_) => ErrorCode::Unsupported,
            Self::History(_) => ErrorCode::Conflict,
            Self::NotInitialized | Self::Driver(_) => ErrorCode::Internal,
            Self::Core(error) => match error {
                CoreError::ContactNotFound(_)
                | CoreError::WireNotFound(_)
                | CoreError::GroupNotFound(_)
                | CoreError::PrimitiveNotFound(_)
                | CoreError::UnknownScheduler(_) => ErrorCode::NotFound,
                CoreError::UnresolvedEndpoint { .. }
                | CoreError::DuplicatePrimitive(_)
                | CoreError::InvalidModule(_)
                | CoreError::InvalidTemplate(_) => ErrorCode::InvalidInput,
                CoreError::UnsupportedModuleSource(_) => ErrorCode::Unsupported,
                CoreError::PropagationLimit { .. }
                | CoreError::SerializationError(_)
                | CoreError::StorageError(_)
                | CoreError::IoError(_) => ErrorCode::Internal,
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_envelope() {
        let request = CommandRequest::from_json(json!({
            "requestId": "r1",
            "type": "add-contact",
            "groupId": 3,
            "content": 5,
            "blendMode": "max"
        }))
        .expect("parse");

        assert_eq!(request.request_id.as_deref(), Some("r1"));
        assert_eq!(
            request.input,
            ExternalInput::AddContact {
                group_id: GroupId(3),
                content: Some(json!(5)),
                blend_mode: Some(BlendMode::Max),
            }
        );
    }

    #[test]
    fn unknown_type_is_distinct_from_malformed() {
        let unknown = CommandRequest::from_json(json!({"requestId": "x", "type": "teleport"}));
        let rejected = unknown.expect_err("unknown");
        assert_eq!(rejected.request_id.as_deref(), Some("x"));
        assert_eq!(rejected.error.code(), ErrorCode::UnknownCommand);

        let malformed = CommandRequest::from_json(json!({"type": "remove-wire"}));
        assert_eq!(
            malformed.expect_err("malformed").error.code(),
            ErrorCode::InvalidInput
        );
    }

    #[test]
    fn every_variant_tag_is_listed() {
        let samples = [
            ExternalInput::Undo,
            ExternalInput::ListPrimitives,
            ExternalInput::CancelRecording,
            ExternalInput::SetContents {
                contents: Vec::new(),
            },
        ];
        for input in samples {
            assert!(COMMAND_TYPES.contains(&input.command_type()));
            let json = serde_json::to_value(&input).expect("serialize");
            assert_eq!(json["type"], input.command_type());
        }
    }

    #[test]
    fn create_wire_uses_wire_type_field() {
        let input = ExternalInput::from_json(json!({
            "type": "create-wire",
            "fromContactId": 1,
            "toContactId": 2,
            "wireType": "directed"
        }))
        .expect("parse");
        assert_eq!(
            input,
            ExternalInput::CreateWire {
                from_contact_id: ContactId(1),
                to_contact_id: ContactId(2),
                wire_type: Some(WireType::Directed),
            }
        );
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = CommandRequest::new(ExternalInput::QueryGroup {
            group_id: GroupId(4),
            options: QueryOptions {
                include_wires: true,
                ..QueryOptions::default()
            },
        })
        .with_request_id("q");
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["options"]["includeWires"], true);
        let back: CommandRequest = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, request);
    }

    #[test]
    fn failure_response_carries_code() {
        let response = CommandResponse::failure(
            Some("9".into()),
            &DispatchError::Core(CoreError::ContactNotFound(ContactId(1))),
        );
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["error"]["code"], "not-found");
        assert!(json.get("data").is_none());
        assert!(response.into_result().is_err());
    }

    #[test]
    fn remote_error_code_name() {
        let error = DispatchError::NotImplementedForRemote("load-primitive".into());
        assert_eq!(
            serde_json::to_value(error.code()).expect("serialize"),
            json!("not-implemented-for-remote")
        );
    }
}
