//! # bassline-core
//!
//! The propagation-network kernel.
//!
//! A network is a tree of contact groups. Groups own contacts (cells holding
//! an optional JSON value), wires linking contacts, and child groups.
//! Writing to a contact propagates the value along wires, merging it into
//! each receiving contact through that contact's blend rule, and re-runs the
//! computation of every primitive gadget whose inputs changed.
//!
//! ## Layers
//!
//! - `group`, `blend`, `template`, `gadget`: the graph model
//! - `command`, `runtime`, `scheduler`: one serializable command protocol
//!   and its dispatcher
//! - `history`, `storage`, `driver`: undo/redo and persistence
//! - `kernel`: composition, lifecycle, transport capability gating
//!
//! ## Architectural Constraints
//!
//! - Synchronous and transport-free: no async, no network
//! - Ordered maps throughout, so propagation order and template export are
//!   reproducible
//! - Every mutation flows through [`Runtime::dispatch`]

// =============================================================================
// MODULES
// =============================================================================

pub mod blend;
pub mod command;
pub mod driver;
pub mod gadget;
pub mod group;
pub mod history;
pub mod kernel;
pub mod limits;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod template;
pub mod types;

// =============================================================================
// RE-EXPORTS: Data Model
// =============================================================================

pub use blend::BlendOutcome;
pub use group::{
    ComputeFn, ContactGroup, GroupCounts, GroupSnapshot, Removal, RemovedContact, RemovedGroup,
    RemovedWire,
};
pub use types::{
    BlendMode, BoundaryDirection, Contact, ContactId, ContentChange, Contradiction, CoreError,
    GroupId, OwnedWire, Position, Propagation, Wire, WireId, WireType,
};

// =============================================================================
// RE-EXPORTS: Gadgets & Templates
// =============================================================================

pub use gadget::{
    BUILTIN_NAMESPACE, GadgetRegistry, ModuleSource, Operation, PrimitiveGadget, PrimitiveInfo,
    PrimitiveRegistry, builtin_gadgets,
};
pub use template::{
    ContactSpec, GroupTemplate, SkippedWire, TemplateHeader, TemplateImport, WireEndpoint,
    WireSpec, decode_template, encode_template,
};

// =============================================================================
// RE-EXPORTS: Commands & Kernel
// =============================================================================

pub use command::{
    COMMAND_TYPES, CommandRequest, CommandResponse, ContactChange, ContentSnapshot, DispatchError,
    ErrorBody, ErrorCode, ExternalInput, GroupSummary, GroupView, HISTORY_SOURCE, ImportResult,
    QueryOptions, RejectedRequest, UpdateReceipt,
};
pub use driver::{CompoundDriver, Driver};
pub use history::{CapturedOp, EntrySummary, HistoryDriver, HistoryError, HistorySummary};
pub use kernel::{BridgeKind, Capability, Kernel, KernelConfig, KernelError, KernelStatus};
pub use runtime::{Dispatched, Runtime, Subscriber, SubscriptionId};
pub use scheduler::{
    BATCH_SCHEDULER, BatchConfig, BatchScheduler, IMMEDIATE_SCHEDULER, ImmediateScheduler,
    SchedulePolicy, ScheduledUpdate, Scheduler, SchedulerInfo, available_schedulers,
    scheduler_by_id,
};
pub use storage::{GroupRecord, MemoryStorage, Mutation, RedbStorage, StorageDriver, StoredNetwork};
