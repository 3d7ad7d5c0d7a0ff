//! Event definitions for the `run` and `bus` loops, and the message format
//! of the shared event log.
//!
//! `set` and `reset` append one [`Message`] per call to the event log as a
//! JSON line; running sessions follow the log and apply each message to
//! their parameter store.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::ParameterStore;

pub const PARAMETER_UPDATE: &str = "parameter_update";

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    /// New values, absent for a reset.
    #[serde(default)]
    pub changes: Option<BTreeMap<String, String>>,
    /// Every name the message affects, including those in `changes`.
    #[serde(default)]
    pub changed: Vec<String>,
    pub ident: Uuid,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Message {
    /// Builds a `parameter_update` for new values and/or plain resets.
    pub fn update(changes: Option<BTreeMap<String, String>>, reset: &[String]) -> Self {
        let mut changed: Vec<String> = changes
            .as_ref()
            .map(|changes| changes.keys().cloned().collect())
            .unwrap_or_default();
        for name in reset {
            if !changed.contains(name) {
                changed.push(name.clone());
            }
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        Self {
            kind: PARAMETER_UPDATE.to_string(),
            changes,
            changed,
            ident: Uuid::new_v4(),
            timestamp,
        }
    }

    pub fn set(name: &str, value: &str) -> Self {
        let changes = BTreeMap::from([(name.to_string(), value.to_string())]);
        Self::update(Some(changes), &[])
    }

    pub fn reset(name: &str) -> Self {
        Self::update(None, &[name.to_string()])
    }

    /// Applies the message to `store`: new values are set, names changed
    /// without a value are touched. Other message kinds are ignored.
    pub fn apply(&self, store: &ParameterStore) {
        if self.kind != PARAMETER_UPDATE {
            tracing::debug!(kind = %self.kind, "ignoring message");
            return;
        }
        let changes = self.changes.as_ref();
        if let Some(changes) = changes {
            for (name, value) in changes {
                store.set(name, value.as_str());
            }
        }
        for name in &self.changed {
            if !changes.is_some_and(|changes| changes.contains_key(name)) {
                store.touch(name);
            }
        }
    }
}

/// Signals that end a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }

    /// Shell convention for a process ended by this signal: 128 + number.
    pub fn exit_code(self) -> i32 {
        match self {
            ProcessSignal::SigInt => 130,
            ProcessSignal::SigTerm => 143,
        }
    }
}

/// Represents an event in a session's main loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message was appended to the event log.
    Message(Message),
    /// Following the event log failed; no further messages will arrive.
    FeedFailed { error: String },
    /// The session was asked to stop.
    Shutdown { signal: ProcessSignal },
}
