//! # History
//!
//! Undo/redo over recorded sessions.
//!
//! ```text
//!   idle --start-recording--> recording --stop-recording--> idle
//!                                  |
//!                                  +--cancel-recording--> idle
//! ```
//!
//! While a session is open, the dispatcher captures every mutating command
//! as a [`CapturedOp`]: the commands that redo it and the commands that undo
//! it. Stopping the session commits the captured operations as one
//! [`HistoryEntry`]. Undo replays inverses newest-first; redo replays
//! forwards oldest-first. Replayed commands go through the runtime's
//! in-process replay path and are never captured again.
//!
//! An entry replays as a whole: if any command of the sequence fails, the
//! graph is returned to where it was and the entry stays on its stack.
//!
//! Undo restores the contents captured at record time, regardless of any
//! write made after the session was committed.

use crate::command::{DispatchError, ExternalInput, unix_millis};
use crate::runtime::Runtime;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::VecDeque;
use thiserror::Error;

/// Forward and inverse commands of one captured operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedOp {
    /// Command type of the captured command.
    pub description: String,
    pub forward: Vec<ExternalInput>,
    pub inverse: Vec<ExternalInput>,
}

/// A committed recording session.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: u64,
    pub description: String,
    pub operations: Vec<CapturedOp>,
    pub timestamp: u64,
}

impl HistoryEntry {
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            id: self.id,
            description: self.description.clone(),
            operations: self.operations.len(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub id: u64,
    pub description: String,
    pub operations: usize,
    pub timestamp: u64,
}

/// Result of `get-history`. Both stacks are listed oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    /// Description of the open session, if any.
    pub recording: Option<String>,
    /// Operations captured so far in the open session.
    pub captured: usize,
    pub max_size: usize,
    pub undo: Vec<EntrySummary>,
    pub redo: Vec<EntrySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("already recording '{0}'")]
    AlreadyRecording(String),

    #[error("no recording in progress")]
    NotRecording,

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("cannot undo or redo while recording '{0}'")]
    RecordingInProgress(String),

    #[error("history replay failed: {0}")]
    Replay(String),
}

#[derive(Debug)]
struct Session {
    description: String,
    operations: Vec<CapturedOp>,
}

/// Undo/redo stacks plus the open recording session.
#[derive(Debug)]
pub struct HistoryDriver {
    max_size: usize,
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    session: Option<Session>,
    next_id: u64,
}

impl HistoryDriver {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            undo: VecDeque::new(),
            redo: Vec::new(),
            session: None,
            next_id: 1,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    /// The history commands this driver owns.
    pub fn handles(input: &ExternalInput) -> bool {
        input.is_history()
    }

    pub fn start(&mut self, description: impl Into<String>) -> Result<(), HistoryError> {
        if let Some(session) = &self.session {
            return Err(HistoryError::AlreadyRecording(session.description.clone()));
        }
        let description = description.into();
        tracing::debug!(description = %description, "recording started");
        self.session = Some(Session {
            description,
            operations: Vec::new(),
        });
        Ok(())
    }

    /// Append an operation to the open session. Ignored while idle.
    pub fn capture(&mut self, op: CapturedOp) {
        if let Some(session) = &mut self.session {
            session.operations.push(op);
        }
    }

    /// Close the session and commit it. An empty session commits nothing.
    pub fn stop(&mut self) -> Result<Option<EntrySummary>, HistoryError> {
        let session = self.session.take().ok_or(HistoryError::NotRecording)?;
        if session.operations.is_empty() {
            tracing::debug!(description = %session.description, "empty recording discarded");
            return Ok(None);
        }
        let entry = HistoryEntry {
            id: self.next_id,
            description: session.description,
            operations: session.operations,
            timestamp: unix_millis(),
        };
        self.next_id += 1;
        let summary = entry.summary();
        self.redo.clear();
        self.undo.push_back(entry);
        while self.undo.len() > self.max_size {
            if let Some(evicted) = self.undo.pop_front() {
                tracing::debug!(entry = evicted.id, "oldest history entry evicted");
            }
        }
        Ok(Some(summary))
    }

    /// Drop the open session's captured operations. Their effects on the
    /// graph stay.
    pub fn cancel(&mut self) -> Result<usize, HistoryError> {
        let session = self.session.take().ok_or(HistoryError::NotRecording)?;
        tracing::debug!(
            description = %session.description,
            discarded = session.operations.len(),
            "recording cancelled"
        );
        Ok(session.operations.len())
    }

    fn ensure_idle(&self) -> Result<(), HistoryError> {
        match &self.session {
            Some(session) => Err(HistoryError::RecordingInProgress(
                session.description.clone(),
            )),
            None => Ok(()),
        }
    }

    pub fn undo(&mut self, runtime: &mut Runtime) -> Result<EntrySummary, DispatchError> {
        self.ensure_idle()?;
        let entry = self.undo.pop_back().ok_or(HistoryError::NothingToUndo)?;
        let inverses = entry
            .operations
            .iter()
            .rev()
            .flat_map(|op| op.inverse.iter());
        if let Err(e) = replay(runtime, inverses) {
            self.undo.push_back(entry);
            return Err(e.into());
        }
        let summary = entry.summary();
        tracing::info!(entry = entry.id, description = %entry.description, "undo");
        self.redo.push(entry);
        Ok(summary)
    }

    pub fn redo(&mut self, runtime: &mut Runtime) -> Result<EntrySummary, DispatchError> {
        self.ensure_idle()?;
        let entry = self.redo.pop().ok_or(HistoryError::NothingToRedo)?;
        let forwards = entry.operations.iter().flat_map(|op| op.forward.iter());
        if let Err(e) = replay(runtime, forwards) {
            self.redo.push(entry);
            return Err(e.into());
        }
        let summary = entry.summary();
        tracing::info!(entry = entry.id, description = %entry.description, "redo");
        self.undo.push_back(entry);
        Ok(summary)
    }

    pub fn summary(&self) -> HistorySummary {
        HistorySummary {
            recording: self.session.as_ref().map(|s| s.description.clone()),
            captured: self.session.as_ref().map_or(0, |s| s.operations.len()),
            max_size: self.max_size,
            undo: self.undo.iter().map(HistoryEntry::summary).collect(),
            redo: self.redo.iter().map(HistoryEntry::summary).collect(),
        }
    }

    /// Execute one history command.
    pub fn handle(
        &mut self,
        input: &ExternalInput,
        runtime: &mut Runtime,
    ) -> Result<Value, DispatchError> {
        match input {
            ExternalInput::StartRecording { description } => {
                self.start(description.clone())?;
                Ok(Value::Null)
            }
            ExternalInput::StopRecording => Ok(json!(self.stop()?)),
            ExternalInput::CancelRecording => Ok(json!({ "discarded": self.cancel()? })),
            ExternalInput::Undo => Ok(json!(self.undo(runtime)?)),
            ExternalInput::Redo => Ok(json!(self.redo(runtime)?)),
            ExternalInput::GetHistory => Ok(json!(self.summary())),
            other => Err(DispatchError::InvalidInput(format!(
                "'{}' is not a history command",
                other.command_type()
            ))),
        }
    }
}

/// Replay `commands` as one transaction.
fn replay<'a>(
    runtime: &mut Runtime,
    commands: impl Iterator<Item = &'a ExternalInput>,
) -> Result<(), HistoryError> {
    runtime.begin();
    for (step, command) in commands.enumerate() {
        if let Err(e) = runtime.replay(command.clone()) {
            runtime.rollback();
            tracing::warn!(step, command = command.command_type(), error = %e, "replay failed, rolled back");
            return Err(HistoryError::Replay(format!(
                "{}: {}",
                command.command_type(),
                e
            )));
        }
    }
    runtime.commit();
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
