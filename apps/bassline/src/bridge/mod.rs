//! # Bridges
//!
//! Transports that carry commands to a kernel.
//!
//! A transport implements one method, [`Bridge::send`]. Every operation of
//! the kernel surface is provided once on the trait on top of it, so
//! [`LocalBridge`] (kernel on a tokio task in this process) and
//! [`RemoteBridge`] (HTTP client of a peer server) expose the same
//! asynchronous API and return the same results for the same commands.
//!
//! Commands the transport cannot carry fail with
//! [`BridgeError::NotImplementedForRemote`] before anything is sent.

mod local;
mod remote;

pub use local::LocalBridge;
pub use remote::RemoteBridge;

use bassline_core::{
    BlendMode, BridgeKind, ContactId, DispatchError, EntrySummary, ErrorBody, ErrorCode,
    ExternalInput, GroupId, GroupTemplate, GroupView, HistorySummary, ImportResult, ModuleSource,
    PrimitiveInfo, QueryOptions, SchedulerInfo, UpdateReceipt, WireId, WireType,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// The transport cannot carry this command.
    #[error("'{0}' is not implemented for remote kernels")]
    NotImplementedForRemote(String),

    /// The kernel executed the command and reported an error.
    #[error("{code:?}: {message}")]
    Command { code: ErrorCode, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response correlation mismatch: expected {expected}, got {actual:?}")]
    Correlation {
        expected: String,
        actual: Option<String>,
    },

    #[error("cannot decode response: {0}")]
    Decode(String),

    /// The kernel task is gone.
    #[error("bridge closed")]
    Closed,
}

impl BridgeError {
    /// Error code reported by the kernel, if the kernel reported one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::NotImplementedForRemote(_) => Some(ErrorCode::NotImplementedForRemote),
            Self::Command { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ErrorBody> for BridgeError {
    fn from(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::NotImplementedForRemote => Self::NotImplementedForRemote(body.message),
            code => Self::Command {
                code,
                message: body.message,
            },
        }
    }
}

impl From<DispatchError> for BridgeError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::NotImplementedForRemote(command) => {
                Self::NotImplementedForRemote(command)
            }
            other => Self::Command {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

/// Fail unless `response_id` answers `request_id`.
pub(crate) fn check_correlation(
    request_id: &str,
    response_id: Option<&str>,
) -> Result<(), BridgeError> {
    if response_id == Some(request_id) {
        Ok(())
    } else {
        Err(BridgeError::Correlation {
            expected: request_id.to_string(),
            actual: response_id.map(str::to_string),
        })
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

pub trait Bridge: Send + Sync {
    /// Transport kind, for capability checks.
    const KIND: BridgeKind;

    /// Deliver one command and return its result payload.
    fn send(&self, input: ExternalInput) -> impl Future<Output = Result<Value, BridgeError>> + Send;

    /// Check the command against this transport's capabilities, then send.
    fn call(&self, input: ExternalInput) -> impl Future<Output = Result<Value, BridgeError>> + Send {
        async move {
            Self::KIND.check(&input)?;
            self.send(input).await
        }
    }

    /// [`Bridge::call`] with the payload decoded as `T`.
    fn request<T: DeserializeOwned>(
        &self,
        input: ExternalInput,
    ) -> impl Future<Output = Result<T, BridgeError>> + Send {
        async move {
            let command = input.command_type();
            let value = self.call(input).await?;
            serde_json::from_value(value)
                .map_err(|e| BridgeError::Decode(format!("{}: {}", command, e)))
        }
    }

    // =========================================================================
    // STRUCTURE
    // =========================================================================

    fn add_contact(
        &self,
        group_id: GroupId,
        content: Option<Value>,
        blend_mode: Option<BlendMode>,
    ) -> impl Future<Output = Result<ContactId, BridgeError>> + Send {
        self.request(ExternalInput::AddContact {
            group_id,
            content,
            blend_mode,
        })
    }

    fn remove_contact(
        &self,
        contact_id: ContactId,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.request(ExternalInput::RemoveContact { contact_id })
    }

    fn create_wire(
        &self,
        from_contact_id: ContactId,
        to_contact_id: ContactId,
        wire_type: Option<WireType>,
    ) -> impl Future<Output = Result<WireId, BridgeError>> + Send {
        self.request(ExternalInput::CreateWire {
            from_contact_id,
            to_contact_id,
            wire_type,
        })
    }

    fn remove_wire(&self, wire_id: WireId) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.request(ExternalInput::RemoveWire { wire_id })
    }

    fn create_group(
        &self,
        name: impl Into<String>,
        parent_group_id: Option<GroupId>,
        primitive_id: Option<String>,
    ) -> impl Future<Output = Result<GroupId, BridgeError>> + Send {
        self.request(ExternalInput::AddGroup {
            name: name.into(),
            parent_group_id,
            primitive_id,
        })
    }

    fn remove_group(&self, group_id: GroupId) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.request(ExternalInput::RemoveGroup { group_id })
    }

    // =========================================================================
    // CONTENT & QUERIES
    // =========================================================================

    fn update_contact(
        &self,
        contact_id: ContactId,
        group_id: GroupId,
        value: Option<Value>,
    ) -> impl Future<Output = Result<UpdateReceipt, BridgeError>> + Send {
        self.request(ExternalInput::ContactUpdate {
            contact_id,
            group_id,
            value,
        })
    }

    fn query_group(
        &self,
        group_id: GroupId,
        options: QueryOptions,
    ) -> impl Future<Output = Result<GroupView, BridgeError>> + Send {
        self.request(ExternalInput::QueryGroup { group_id, options })
    }

    /// Content of a contact; `None` when undefined.
    fn query_contact(
        &self,
        contact_id: ContactId,
    ) -> impl Future<Output = Result<Option<Value>, BridgeError>> + Send {
        self.request(ExternalInput::QueryContact { contact_id })
    }

    // =========================================================================
    // PRIMITIVES
    // =========================================================================

    fn list_primitives(&self) -> impl Future<Output = Result<Vec<String>, BridgeError>> + Send {
        self.request(ExternalInput::ListPrimitives)
    }

    fn list_primitive_info(
        &self,
    ) -> impl Future<Output = Result<Vec<PrimitiveInfo>, BridgeError>> + Send {
        self.request(ExternalInput::ListPrimitiveInfo)
    }

    fn get_primitive_info(
        &self,
        qualified_name: impl Into<String>,
    ) -> impl Future<Output = Result<PrimitiveInfo, BridgeError>> + Send {
        self.request(ExternalInput::GetPrimitiveInfo {
            qualified_name: qualified_name.into(),
        })
    }

    fn create_primitive_gadget(
        &self,
        qualified_name: impl Into<String>,
        parent_group_id: Option<GroupId>,
    ) -> impl Future<Output = Result<GroupId, BridgeError>> + Send {
        self.request(ExternalInput::CreatePrimitiveGadget {
            qualified_name: qualified_name.into(),
            parent_group_id,
        })
    }

    /// Register the gadgets of a module under `namespace`; returns their
    /// qualified names.
    fn load_primitive(
        &self,
        module_source: ModuleSource,
        namespace: impl Into<String>,
    ) -> impl Future<Output = Result<Vec<String>, BridgeError>> + Send {
        self.request(ExternalInput::LoadPrimitive {
            module_source,
            namespace: namespace.into(),
        })
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    fn list_schedulers(&self) -> impl Future<Output = Result<Vec<SchedulerInfo>, BridgeError>> + Send {
        self.request(ExternalInput::ListSchedulers)
    }

    fn get_scheduler_info(
        &self,
        scheduler_id: impl Into<String>,
    ) -> impl Future<Output = Result<SchedulerInfo, BridgeError>> + Send {
        self.request(ExternalInput::GetSchedulerInfo {
            scheduler_id: scheduler_id.into(),
        })
    }

    fn set_scheduler(
        &self,
        scheduler_id: impl Into<String>,
        config: Option<Value>,
    ) -> impl Future<Output = Result<SchedulerInfo, BridgeError>> + Send {
        self.request(ExternalInput::SetScheduler {
            scheduler_id: scheduler_id.into(),
            config,
        })
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    fn undo(&self) -> impl Future<Output = Result<EntrySummary, BridgeError>> + Send {
        self.request(ExternalInput::Undo)
    }

    fn redo(&self) -> impl Future<Output = Result<EntrySummary, BridgeError>> + Send {
        self.request(ExternalInput::Redo)
    }

    fn get_history(&self) -> impl Future<Output = Result<HistorySummary, BridgeError>> + Send {
        self.request(ExternalInput::GetHistory)
    }

    fn start_recording(
        &self,
        description: impl Into<String>,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.request(ExternalInput::StartRecording {
            description: description.into(),
        })
    }

    /// Commit the open session; `None` when it captured nothing.
    fn stop_recording(
        &self,
    ) -> impl Future<Output = Result<Option<EntrySummary>, BridgeError>> + Send {
        self.request(ExternalInput::StopRecording)
    }

    /// Discard the open session; returns how many operations were dropped.
    fn cancel_recording(&self) -> impl Future<Output = Result<usize, BridgeError>> + Send {
        async move {
            let value = self.call(ExternalInput::CancelRecording).await?;
            value
                .get("discarded")
                .and_then(Value::as_u64)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| BridgeError::Decode("cancel-recording: missing count".to_string()))
        }
    }

    // =========================================================================
    // TEMPLATES
    // =========================================================================

    fn export_group(
        &self,
        group_id: GroupId,
    ) -> impl Future<Output = Result<GroupTemplate, BridgeError>> + Send {
        self.request(ExternalInput::ExportGroup { group_id })
    }

    fn import_template(
        &self,
        template: GroupTemplate,
        parent_group_id: Option<GroupId>,
    ) -> impl Future<Output = Result<ImportResult, BridgeError>> + Send {
        self.request(ExternalInput::ImportTemplate {
            template,
            parent_group_id,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
