//! # Update Scheduling
//!
//! Contact-value updates pass through a [`Scheduler`] before they reach the
//! graph. Structural commands never do.
//!
//! - `immediate`: every update is ready as soon as it is scheduled.
//! - `batch`: updates are held until the next tick. Several updates to one
//!   contact within a window collapse into the last one, keeping the
//!   position of the first arrival. Two differing values collapsing is
//!   reported as a contradiction.

use crate::limits::DEFAULT_BATCH_WINDOW_MS;
use crate::types::{ContactId, CoreError, GroupId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Id of the default scheduler.
pub const IMMEDIATE_SCHEDULER: &str = "immediate";

/// Id of the windowed scheduler.
pub const BATCH_SCHEDULER: &str = "batch";

/// A pending contact-value write.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledUpdate {
    pub contact_id: ContactId,
    pub group_id: GroupId,
    /// `None` clears the contact.
    pub value: Option<Value>,
}

/// When scheduled updates become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePolicy {
    Immediate,
    Batch,
}

/// Introspection record of a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerInfo {
    pub id: String,
    pub description: String,
    pub policy: SchedulePolicy,
    pub config: Value,
}

/// Queues contact-value updates for the dispatcher.
pub trait Scheduler: Send + fmt::Debug {
    fn info(&self) -> SchedulerInfo;

    fn policy(&self) -> SchedulePolicy;

    /// Queue an update. Returns a contradiction reason when the update
    /// displaced a pending, different value for the same contact.
    fn schedule(&mut self, update: ScheduledUpdate) -> Option<String>;

    /// Drain every update that is ready now, in application order.
    fn take_ready(&mut self) -> Vec<ScheduledUpdate>;

    fn pending(&self) -> usize;

    /// Period of the tick driving this scheduler, if it needs one.
    fn tick_interval(&self) -> Option<Duration>;
}

// =============================================================================
// IMMEDIATE
// =============================================================================

/// Applies each update within the request that scheduled it.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    queue: Vec<ScheduledUpdate>,
}

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn describe() -> SchedulerInfo {
        SchedulerInfo {
            id: IMMEDIATE_SCHEDULER.to_string(),
            description: "Applies and propagates each update synchronously".to_string(),
            policy: SchedulePolicy::Immediate,
            config: json!({}),
        }
    }
}

impl Scheduler for ImmediateScheduler {
    fn info(&self) -> SchedulerInfo {
        Self::describe()
    }

    fn policy(&self) -> SchedulePolicy {
        SchedulePolicy::Immediate
    }

    fn schedule(&mut self, update: ScheduledUpdate) -> Option<String> {
        self.queue.push(update);
        None
    }

    fn take_ready(&mut self) -> Vec<ScheduledUpdate> {
        std::mem::take(&mut self.queue)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn tick_interval(&self) -> Option<Duration> {
        None
    }
}

// =============================================================================
// BATCH
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub window_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_BATCH_WINDOW_MS,
        }
    }
}

/// Coalesces updates per contact until the next tick.
#[derive(Debug, Default)]
pub struct BatchScheduler {
    config: BatchConfig,
    queue: Vec<ScheduledUpdate>,
    /// Queue position of each contact's pending update.
    slots: BTreeMap<ContactId, usize>,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    fn describe(config: BatchConfig) -> SchedulerInfo {
        SchedulerInfo {
            id: BATCH_SCHEDULER.to_string(),
            description: "Coalesces updates per contact and applies them once per window"
                .to_string(),
            policy: SchedulePolicy::Batch,
            config: json!({ "windowMs": config.window_ms }),
        }
    }
}

impl Scheduler for BatchScheduler {
    fn info(&self) -> SchedulerInfo {
        Self::describe(self.config)
    }

    fn policy(&self) -> SchedulePolicy {
        SchedulePolicy::Batch
    }

    fn schedule(&mut self, update: ScheduledUpdate) -> Option<String> {
        let Some(&slot) = self.slots.get(&update.contact_id) else {
            self.slots.insert(update.contact_id, self.queue.len());
            self.queue.push(update);
            return None;
        };
        let held = self.queue.get_mut(slot)?;
        let conflict = (held.value != update.value).then(|| {
            format!(
                "batch window coalesced {} over pending {}",
                display_value(update.value.as_ref()),
                display_value(held.value.as_ref())
            )
        });
        *held = update;
        conflict
    }

    fn take_ready(&mut self) -> Vec<ScheduledUpdate> {
        self.slots.clear();
        std::mem::take(&mut self.queue)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.window())
    }
}

fn display_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "undefined".to_string(), Value::to_string)
}

// =============================================================================
// FACTORY
// =============================================================================

/// Every scheduler the kernel can switch to.
pub fn available_schedulers() -> Vec<SchedulerInfo> {
    vec![
        ImmediateScheduler::describe(),
        BatchScheduler::describe(BatchConfig::default()),
    ]
}

/// Instantiate a scheduler by id with an optional JSON config.
pub fn scheduler_by_id(id: &str, config: Option<&Value>) -> Result<Box<dyn Scheduler>, CoreError> {
    match id {
        IMMEDIATE_SCHEDULER => Ok(Box::new(ImmediateScheduler::new())),
        BATCH_SCHEDULER => {
            let config = match config {
                None | Some(Value::Null) => BatchConfig::default(),
                Some(value) => serde_json::from_value(value.clone())
                    .map_err(|e| CoreError::SerializationError(e.to_string()))?,
            };
            Ok(Box::new(BatchScheduler::new(config)))
        }
        other => Err(CoreError::UnknownScheduler(other.to_string())),
    }
}

// =============================================================================
// TESTS
// =============================================================================
