//! # Drivers
//!
//! A driver plugs a concern into the kernel that the dispatcher itself
//! does not own. The kernel asks each registered driver, in registration
//! order, whether it handles a command; unclaimed commands go to the
//! dispatcher. After every command the drained mutation journal is handed
//! to every driver.

use crate::command::{DispatchError, ExternalInput};
use crate::history::{CapturedOp, HistoryDriver};
use crate::runtime::Runtime;
use crate::storage::{Mutation, StorageDriver};
use crate::types::CoreError;
use serde_json::Value;

pub trait Driver: Send {
    fn name(&self) -> &str;

    /// One-time setup when the kernel initializes.
    fn initialize(&mut self, runtime: &mut Runtime) -> Result<(), CoreError>;

    /// True for commands this driver executes itself.
    fn handles(&self, input: &ExternalInput) -> bool;

    fn handle(
        &mut self,
        input: &ExternalInput,
        runtime: &mut Runtime,
    ) -> Result<Value, DispatchError>;

    /// True while the driver wants mutating commands captured.
    fn is_capturing(&self) -> bool;

    fn capture(&mut self, op: CapturedOp);

    fn persist(&mut self, mutations: &[Mutation]) -> Result<(), CoreError>;
}

/// Storage plus history behind one driver.
///
/// History commands route to the [`HistoryDriver`]; persistence and the
/// initial load route to the storage backend.
pub struct CompoundDriver {
    storage: Box<dyn StorageDriver>,
    history: HistoryDriver,
}

impl std::fmt::Debug for CompoundDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompoundDriver")
            .field("storage", &self.storage.name())
            .field("history", &self.history)
            .finish()
    }
}

impl CompoundDriver {
    pub fn new(storage: Box<dyn StorageDriver>, history: HistoryDriver) -> Self {
        Self { storage, history }
    }

    pub fn history(&self) -> &HistoryDriver {
        &self.history
    }
}

impl Driver for CompoundDriver {
    fn name(&self) -> &str {
        self.storage.name()
    }

    fn initialize(&mut self, runtime: &mut Runtime) -> Result<(), CoreError> {
        let network = self.storage.load()?;
        if network.is_empty() {
            tracing::info!(storage = self.storage.name(), "storage empty, starting fresh");
            return Ok(());
        }
        runtime.restore(network);
        Ok(())
    }

    fn handles(&self, input: &ExternalInput) -> bool {
        HistoryDriver::handles(input)
    }

    fn handle(
        &mut self,
        input: &ExternalInput,
        runtime: &mut Runtime,
    ) -> Result<Value, DispatchError> {
        self.history.handle(input, runtime)
    }

    fn is_capturing(&self) -> bool {
        self.history.is_recording()
    }

    fn capture(&mut self, op: CapturedOp) {
        self.history.capture(op);
    }

    fn persist(&mut self, mutations: &[Mutation]) -> Result<(), CoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.storage.apply(mutations)
    }
}
