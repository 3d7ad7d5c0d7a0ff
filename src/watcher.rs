//! The per-template recompute scheduler.
//!
//! A [`Watcher`] is a plain state machine: render, hand out an
//! [`ExecutionRequest`], and decide on completion whether the result is
//! still current. Every render bumps the execution id; a completion whose
//! id is not the latest one was superseded and is dropped without a trace
//! in the display. [`drive`] runs one watcher as a Tokio task, waking on its
//! bus mailbox and on execution completions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::graph::WatcherId;
use crate::runner::{
    supersession, ExecutionOutcome, ExecutionRequest, ExecutionStatus, Executor, Supersede,
};
use crate::store::ParameterStore;
use crate::template::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Nothing pending; the last current execution has been delivered.
    Idle,
    /// Substituting parameter values.
    Rendering,
    /// The current execution is running.
    Executing,
    /// The running execution went stale; a new render is due.
    Superseded,
}

/// A fresh result, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub watcher: WatcherId,
    pub execution_id: u64,
    /// The rendered command that produced `output`.
    pub command: String,
    pub output: String,
    pub status: ExecutionStatus,
}

#[derive(Debug)]
pub struct Watcher {
    id: WatcherId,
    template: Template,
    dependencies: Vec<String>,
    subscribed_versions: HashMap<String, u64>,
    current_execution_id: u64,
    current_command: String,
    state: WatcherState,
}

impl Watcher {
    /// `listen` names trigger re-runs without appearing in the template.
    pub fn new(id: WatcherId, template: Template, listen: &[String]) -> Self {
        let mut dependencies = template.dependencies().to_vec();
        for name in listen {
            if !dependencies.contains(name) {
                dependencies.push(name.clone());
            }
        }
        Self {
            id,
            template,
            dependencies,
            subscribed_versions: HashMap::new(),
            current_execution_id: 0,
            current_command: String::new(),
            state: WatcherState::Idle,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Template dependencies followed by extra listened names.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn current_execution_id(&self) -> u64 {
        self.current_execution_id
    }

    /// Version of `name` used by the latest render, 0 before any render.
    pub fn subscribed_version(&self, name: &str) -> u64 {
        self.subscribed_versions.get(name).copied().unwrap_or(0)
    }

    /// Renders against the current store and starts a new execution.
    pub fn render(&mut self, store: &ParameterStore) -> ExecutionRequest {
        self.state = WatcherState::Rendering;
        let snapshot = store.snapshot(self.dependencies.iter().map(String::as_str));
        self.current_command = self.template.fill(&snapshot);
        for (name, (_, version)) in snapshot {
            self.subscribed_versions.insert(name, version);
        }

        self.current_execution_id += 1;
        self.state = WatcherState::Executing;
        tracing::debug!(
            watcher = %self.id,
            execution = self.current_execution_id,
            command = %self.current_command,
            "rendered"
        );
        ExecutionRequest {
            watcher: self.id,
            execution_id: self.current_execution_id,
            command: self.current_command.clone(),
        }
    }

    /// True if any dependency moved past the version last rendered with.
    pub fn is_stale(&self, store: &ParameterStore) -> bool {
        store
            .snapshot(self.dependencies.iter().map(String::as_str))
            .iter()
            .any(|(name, (_, version))| *version > self.subscribed_version(name))
    }

    /// Marks the running execution as superseded. No effect unless
    /// executing.
    pub fn supersede(&mut self) {
        if self.state == WatcherState::Executing {
            tracing::debug!(
                watcher = %self.id,
                execution = self.current_execution_id,
                "execution superseded"
            );
            self.state = WatcherState::Superseded;
        }
    }

    /// Accepts a finished execution. Returns the delivery if it is the
    /// current one; stale results are discarded.
    pub fn complete(
        &mut self,
        execution_id: u64,
        outcome: ExecutionOutcome,
    ) -> Option<Delivery> {
        if execution_id != self.current_execution_id || self.state != WatcherState::Executing {
            tracing::trace!(
                watcher = %self.id,
                execution = execution_id,
                current = self.current_execution_id,
                "discarding superseded result"
            );
            return None;
        }
        self.state = WatcherState::Idle;
        Some(Delivery {
            watcher: self.id,
            execution_id,
            command: self.current_command.clone(),
            output: outcome.output,
            status: outcome.status,
        })
    }
}

/// Runs `watcher` until its delivery channel closes or the task is aborted.
pub(crate) async fn drive<E: Executor>(
    mut watcher: Watcher,
    store: ParameterStore,
    executor: Arc<E>,
    mailbox: Arc<Notify>,
    deliveries: mpsc::Sender<Delivery>,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(u64, ExecutionOutcome)>();
    let mut in_flight: Option<Supersede> = None;
    let mut dispatch = true;

    loop {
        if dispatch {
            dispatch = false;
            if let Some(previous) = in_flight.take() {
                previous.fire();
            }
            let request = watcher.render(&store);
            let (supersede, supersession) = supersession();
            in_flight = Some(supersede);
            let executor = Arc::clone(&executor);
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let execution_id = request.execution_id;
                let outcome = executor.execute(request, supersession).await;
                let _ = done_tx.send((execution_id, outcome));
            });
        }

        tokio::select! {
            _ = mailbox.notified() => {
                if watcher.is_stale(&store) {
                    watcher.supersede();
                    dispatch = true;
                }
            }
            Some((execution_id, outcome)) = done_rx.recv() => {
                if let Some(delivery) = watcher.complete(execution_id, outcome) {
                    in_flight = None;
                    if deliveries.send(delivery).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(watcher = %watcher.id(), "watcher stopped");
}
