//! Durable consumers.
//!
//! A [`Consumer`] is a cursor over a read stream, bound to a consumer
//! identifier. Its position and an arbitrary state value persist in a
//! sidecar checkpoint file (`<storage>.<stream>.<consumer>.state`), written
//! atomically (temp file + rename) so the persisted state always matches
//! the persisted position.
//!
//! Delivery is at-least-once by default; a handler that sets its state via
//! [`ConsumerContext::set_state`] gets exactly-once semantics: state and
//! position advance in one atomic step, so a crash can never leave the
//! position ahead of the state.

use std::fs;
use std::path::PathBuf;

use evlog_types::EventEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;

/// Handler invoked once per dispatched document.
pub type ConsumerHandler = Box<
    dyn FnMut(&EventEnvelope, &mut ConsumerContext) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send,
>;

/// Mutable view a handler gets of its consumer's state.
pub struct ConsumerContext {
    state: Value,
    new_state: Option<Value>,
}

impl ConsumerContext {
    pub(crate) fn new(state: Value) -> Self {
        Self {
            state,
            new_state: None,
        }
    }

    /// The current consumer state (the pending value if already replaced
    /// during this invocation).
    pub fn state(&self) -> &Value {
        self.new_state.as_ref().unwrap_or(&self.state)
    }

    /// Replaces the consumer state; persisted atomically with the new
    /// position once the handler returns.
    pub fn set_state(&mut self, state: Value) {
        self.new_state = Some(state);
    }

    pub(crate) fn into_new_state(self) -> Option<Value> {
        self.new_state
    }
}

/// The persisted checkpoint: position and state, written as one document.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    position: u64,
    state: Value,
}

/// A durable cursor over one read stream.
pub(crate) struct Consumer {
    pub(crate) stream: String,
    pub(crate) id: String,
    path: PathBuf,
    /// Last dispatched 1-based entry number.
    pub(crate) position: u64,
    pub(crate) state: Value,
    initial_state: Value,
    pub(crate) handler: ConsumerHandler,
    /// Cleared when a handler fails; dispatch skips inactive consumers.
    pub(crate) active: bool,
    pub(crate) caught_up: bool,
}

impl Consumer {
    /// Creates a consumer, resuming from its checkpoint file if one exists.
    pub(crate) fn open(
        stream: impl Into<String>,
        id: impl Into<String>,
        path: PathBuf,
        initial_state: Value,
        handler: ConsumerHandler,
    ) -> Result<Self, StoreError> {
        let stream = stream.into();
        let id = id.into();
        let (position, state) = if path.exists() {
            let checkpoint: Checkpoint = serde_json::from_slice(&fs::read(&path)?)?;
            (checkpoint.position, checkpoint.state)
        } else {
            (0, initial_state.clone())
        };
        debug!(stream = %stream, consumer = %id, position, "consumer opened");
        Ok(Self {
            stream,
            id,
            path,
            position,
            state,
            initial_state,
            handler,
            active: true,
            caught_up: false,
        })
    }

    /// Persists position and state in a single atomic step.
    pub(crate) fn persist(&self) -> Result<(), StoreError> {
        let checkpoint = Checkpoint {
            position: self.position,
            state: self.state.clone(),
        };
        let tmp = self.path.with_extension("state.tmp");
        fs::write(&tmp, serde_json::to_vec(&checkpoint)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Rewinds to `position` (0 = start) and replaces the state, defaulting
    /// to the initial state.
    pub(crate) fn reset(&mut self, state: Option<Value>, position: u64) -> Result<(), StoreError> {
        self.position = position;
        self.state = state.unwrap_or_else(|| self.initial_state.clone());
        self.caught_up = false;
        self.active = true;
        self.persist()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("stream", &self.stream)
            .field("id", &self.id)
            .field("position", &self.position)
            .field("active", &self.active)
            .field("caught_up", &self.caught_up)
            .finish_non_exhaustive()
    }
}
