//! # Kernel
//!
//! The kernel wires the dispatcher to its drivers and to at most one
//! transport bridge.
//!
//! Lifecycle:
//! 1. construct, register drivers
//! 2. [`Kernel::initialize`]: built-in gadgets, the configured scheduler,
//!    then every driver (storage restores persisted networks)
//! 3. attach a bridge, execute commands
//!
//! Drivers cannot be registered after step 2.

use crate::command::{CommandRequest, CommandResponse, DispatchError, ExternalInput};
use crate::driver::{CompoundDriver, Driver};
use crate::gadget::{GadgetRegistry, PrimitiveRegistry, builtin_gadgets};
use crate::group::GroupCounts;
use crate::history::HistoryDriver;
use crate::limits::DEFAULT_MAX_HISTORY_SIZE;
use crate::runtime::{Runtime, Subscriber, SubscriptionId};
use crate::scheduler::{IMMEDIATE_SCHEDULER, ImmediateScheduler, scheduler_by_id};
use crate::storage::StorageDriver;
use crate::types::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Bound of the undo stack.
    pub max_history_size: usize,
    /// Scheduler id used at initialization.
    pub scheduler: String,
    pub scheduler_config: Option<Value>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
            scheduler: IMMEDIATE_SCHEDULER.to_string(),
            scheduler_config: None,
        }
    }
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Command families, for transport gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Structure,
    Content,
    Query,
    Primitives,
    /// Loading gadget modules into the kernel's process.
    LoadModule,
    Scheduling,
    History,
    Templates,
    Replay,
}

impl Capability {
    pub fn of(input: &ExternalInput) -> Self {
        use ExternalInput as I;
        match input {
            I::AddContact { .. }
            | I::AddGroup { .. }
            | I::CreateWire { .. }
            | I::RemoveWire { .. }
            | I::RemoveContact { .. }
            | I::RemoveGroup { .. }
            | I::CreatePrimitiveGadget { .. } => Self::Structure,
            I::ContactUpdate { .. } => Self::Content,
            I::QueryGroup { .. } | I::QueryContact { .. } => Self::Query,
            I::ListPrimitives | I::ListPrimitiveInfo | I::GetPrimitiveInfo { .. } => {
                Self::Primitives
            }
            I::LoadPrimitive { .. } => Self::LoadModule,
            I::ListSchedulers | I::GetSchedulerInfo { .. } | I::SetScheduler { .. } => {
                Self::Scheduling
            }
            I::Undo
            | I::Redo
            | I::GetHistory
            | I::StartRecording { .. }
            | I::StopRecording
            | I::CancelRecording => Self::History,
            I::ExportGroup { .. } | I::ImportTemplate { .. } => Self::Templates,
            I::SetContents { .. }
            | I::RestoreContact { .. }
            | I::RestoreWire { .. }
            | I::RestoreGroup { .. } => Self::Replay,
        }
    }
}

/// Transport a kernel is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeKind {
    /// In-process.
    Local,
    /// Over the network, from another process.
    Remote,
}

const LOCAL_CAPABILITIES: &[Capability] = &[
    Capability::Structure,
    Capability::Content,
    Capability::Query,
    Capability::Primitives,
    Capability::LoadModule,
    Capability::Scheduling,
    Capability::History,
    Capability::Templates,
    Capability::Replay,
];

const REMOTE_CAPABILITIES: &[Capability] = &[
    Capability::Structure,
    Capability::Content,
    Capability::Query,
    Capability::Primitives,
    Capability::Scheduling,
    Capability::History,
    Capability::Templates,
    Capability::Replay,
];

impl BridgeKind {
    pub const fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Local => LOCAL_CAPABILITIES,
            Self::Remote => REMOTE_CAPABILITIES,
        }
    }

    pub fn supports(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Fail with [`DispatchError::NotImplementedForRemote`] when this
    /// transport cannot carry `input`.
    pub fn check(self, input: &ExternalInput) -> Result<(), DispatchError> {
        if self.supports(Capability::of(input)) {
            Ok(())
        } else {
            Err(DispatchError::NotImplementedForRemote(
                input.command_type().to_string(),
            ))
        }
    }
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// ERRORS & STATUS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("kernel is already initialized")]
    AlreadyInitialized,

    #[error("a {0} bridge is already attached")]
    BridgeAttached(BridgeKind),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Snapshot of kernel state for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelStatus {
    pub roots: usize,
    pub counts: GroupCounts,
    pub scheduler: String,
    pub pending_updates: usize,
    pub contradictions: usize,
    pub drivers: Vec<String>,
    pub bridge: Option<BridgeKind>,
}

// =============================================================================
// KERNEL
// =============================================================================

pub struct Kernel {
    config: KernelConfig,
    runtime: Runtime,
    drivers: Vec<Box<dyn Driver>>,
    initialized: bool,
    bridge: Option<BridgeKind>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("drivers", &self.drivers.iter().map(|d| d.name()).collect::<Vec<_>>())
            .field("initialized", &self.initialized)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// A kernel with the in-process gadget registry and no drivers.
    pub fn new(config: KernelConfig) -> Self {
        Self::with_registry(config, Box::new(GadgetRegistry::new()))
    }

    pub fn with_registry(config: KernelConfig, registry: Box<dyn PrimitiveRegistry>) -> Self {
        Self {
            config,
            runtime: Runtime::new(registry, Box::new(ImmediateScheduler::new())),
            drivers: Vec::new(),
            initialized: false,
            bridge: None,
        }
    }

    /// A kernel with a storage+history driver over `storage`.
    pub fn with_storage(config: KernelConfig, storage: Box<dyn StorageDriver>) -> Self {
        let history = HistoryDriver::new(config.max_history_size);
        let mut kernel = Self::new(config);
        kernel
            .drivers
            .push(Box::new(CompoundDriver::new(storage, history)));
        kernel
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn register_driver(&mut self, driver: Box<dyn Driver>) -> Result<(), KernelError> {
        if self.initialized {
            return Err(KernelError::AlreadyInitialized);
        }
        tracing::debug!(driver = driver.name(), "driver registered");
        self.drivers.push(driver);
        Ok(())
    }

    pub fn initialize(&mut self) -> Result<(), KernelError> {
        if self.initialized {
            return Err(KernelError::AlreadyInitialized);
        }
        for gadget in builtin_gadgets() {
            if self.runtime.registry().info(gadget.qualified_name()).is_none() {
                self.runtime.registry_mut().register(gadget)?;
            }
        }
        let scheduler = scheduler_by_id(
            &self.config.scheduler,
            self.config.scheduler_config.as_ref(),
        )?;
        self.runtime.set_scheduler(scheduler);
        for driver in &mut self.drivers {
            driver.initialize(&mut self.runtime)?;
        }
        self.initialized = true;
        tracing::info!(
            drivers = self.drivers.len(),
            scheduler = %self.config.scheduler,
            primitives = self.runtime.registry().names().len(),
            "kernel initialized"
        );
        Ok(())
    }

    // =========================================================================
    // BRIDGE
    // =========================================================================

    pub fn attach_bridge(&mut self, kind: BridgeKind) -> Result<(), KernelError> {
        if let Some(current) = self.bridge {
            return Err(KernelError::BridgeAttached(current));
        }
        tracing::info!(bridge = %kind, "bridge attached");
        self.bridge = Some(kind);
        Ok(())
    }

    pub fn detach_bridge(&mut self) -> Option<BridgeKind> {
        self.bridge.take()
    }

    pub fn bridge(&self) -> Option<BridgeKind> {
        self.bridge
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Execute a request envelope.
    pub fn execute(&mut self, request: CommandRequest) -> CommandResponse {
        let request_id = request.request_id;
        match self.dispatch_from(request.input, request.source.as_deref()) {
            Ok(data) => CommandResponse::success(request_id, data),
            Err(error) => {
                tracing::debug!(error = %error, "command failed");
                CommandResponse::failure(request_id, &error)
            }
        }
    }

    /// Parse and execute a JSON request envelope.
    pub fn execute_json(&mut self, value: Value) -> CommandResponse {
        match CommandRequest::from_json(value) {
            Ok(request) => self.execute(request),
            Err(rejected) => rejected.into(),
        }
    }

    pub fn dispatch(&mut self, input: ExternalInput) -> Result<Value, DispatchError> {
        self.dispatch_from(input, None)
    }

    /// Execute one command issued by `source`. The source is recorded in
    /// logs and grants nothing: replay-only commands are refused from every
    /// issuer.
    pub fn dispatch_from(
        &mut self,
        input: ExternalInput,
        source: Option<&str>,
    ) -> Result<Value, DispatchError> {
        if !self.initialized {
            return Err(DispatchError::NotInitialized);
        }
        if let Some(kind) = self.bridge {
            kind.check(&input)?;
        }
        if input.is_replay_only() {
            return Err(DispatchError::ReservedCommand(input.command_type()));
        }

        let result = match self.drivers.iter_mut().find(|d| d.handles(&input)) {
            Some(driver) => driver.handle(&input, &mut self.runtime),
            None => {
                let capture = self.drivers.iter().any(|d| d.is_capturing());
                self.runtime
                    .dispatch(input, source, capture)
                    .map(|dispatched| {
                        if let Some(op) = dispatched.captured {
                            for driver in self.drivers.iter_mut().filter(|d| d.is_capturing()) {
                                driver.capture(op.clone());
                            }
                        }
                        dispatched.data
                    })
            }
        };
        self.persist()?;
        result
    }

    fn persist(&mut self) -> Result<(), DispatchError> {
        let mutations = self.runtime.drain_journal();
        if mutations.is_empty() {
            return Ok(());
        }
        for driver in &mut self.drivers {
            driver.persist(&mutations)?;
        }
        Ok(())
    }

    /// Run `f` inside a recording session committed as one undo entry.
    /// When `f` fails the session is cancelled and the error returned.
    pub fn record<T, F>(&mut self, description: impl Into<String>, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce(&mut Self) -> Result<T, DispatchError>,
    {
        self.dispatch(ExternalInput::StartRecording {
            description: description.into(),
        })?;
        match f(self) {
            Ok(value) => {
                self.dispatch(ExternalInput::StopRecording)?;
                Ok(value)
            }
            Err(error) => {
                if let Err(cancel) = self.dispatch(ExternalInput::CancelRecording) {
                    tracing::warn!(error = %cancel, "failed to cancel recording");
                }
                Err(error)
            }
        }
    }

    /// Discard the open recording session; returns how many captured
    /// operations were dropped.
    pub fn cancel_batch(&mut self) -> Result<usize, DispatchError> {
        let data = self.dispatch(ExternalInput::CancelRecording)?;
        Ok(data
            .get("discarded")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0))
    }

    pub fn undo(&mut self) -> Result<Value, DispatchError> {
        self.dispatch(ExternalInput::Undo)
    }

    pub fn redo(&mut self) -> Result<Value, DispatchError> {
        self.dispatch(ExternalInput::Redo)
    }

    /// Apply one scheduler window and persist the result.
    pub fn tick(&mut self) -> Result<usize, DispatchError> {
        let applied = self.runtime.tick();
        self.persist()?;
        Ok(applied)
    }

    /// Period at which [`Kernel::tick`] should be called, if at all.
    pub fn tick_interval(&self) -> Option<Duration> {
        self.runtime.scheduler().tick_interval()
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) -> SubscriptionId {
        self.runtime.subscribe(subscriber)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.runtime.unsubscribe(id)
    }

    pub fn status(&self) -> KernelStatus {
        KernelStatus {
            roots: self.runtime.roots().count(),
            counts: self.runtime.counts(),
            scheduler: self.runtime.scheduler().info().id,
            pending_updates: self.runtime.scheduler().pending(),
            contradictions: self.runtime.contradictions().count(),
            drivers: self.drivers.iter().map(|d| d.name().to_string()).collect(),
            bridge: self.bridge,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
