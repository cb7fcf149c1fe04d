//! Processing stages.
//!
//! # Responsibilities
//! - Define the [`Stage`] contract every link of a chain implements
//! - Provide the [`StageContext`] a stage uses to emit, suspend and report
//! - Ship the built-in stage kinds the configuration can name
//!
//! # Design Decisions
//! - Chains are `Vec<Box<dyn Stage>>` built from configuration at runtime
//! - A template chain is built once and `clone_stage`d per connection
//! - `process` never blocks: waiting means returning [`Flow::Pending`] with a bridge

mod body;
mod count;
pub mod factory;
mod lines;
mod tap;

pub use body::HandleBody;
pub use count::{Count, SharedCounter};
pub use lines::{JoinLines, SplitLines};
pub use tap::Tap;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;

use crate::event::{BufferLimits, Event, StreamError};
use crate::pipeline::bridge::{Bridge, Inbox};
use crate::pipeline::{ContextMap, Spawn};

/// Result of one [`Stage::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The event was handled; the stage can take the next one.
    Ready,
    /// The stage is waiting on the bridge it obtained from
    /// [`StageContext::suspend`]; further events are held back.
    Pending,
}

/// One link of a processing chain.
pub trait Stage: Send + Sync {
    /// Stage kind, used in logs and dumps.
    fn name(&self) -> &'static str;

    /// Fresh instance with the same static configuration and default
    /// per-connection state. Only explicitly process-wide resources may be
    /// shared with `self`.
    fn clone_stage(&self) -> Box<dyn Stage>;

    /// Return to the just-cloned state, releasing any held events or bytes.
    /// Diagnostic counters may be kept.
    fn reset(&mut self);

    /// Handle one event, emitting zero or more events through `cx`.
    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow;

    /// Record diagnostic counters. Must not change behavior.
    fn dump(&self, _out: &mut StageDump) {}

    /// Per-stage override of the suspension buffer limits.
    fn buffer_limits(&self) -> Option<BufferLimits> {
        None
    }
}

/// Diagnostic snapshot of one pipeline slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageDump {
    pub index: usize,
    pub name: String,
    pub pending: bool,
    pub buffered_events: usize,
    pub buffered_bytes: usize,
    pub counters: BTreeMap<String, u64>,
}

impl StageDump {
    pub fn counter(&mut self, name: &str, value: u64) {
        self.counters.insert(name.to_string(), value);
    }
}

/// Everything a stage may touch while processing one event.
pub struct StageContext<'a> {
    outputs: Vec<Event>,
    bridge: Option<Bridge>,
    violation: bool,
    inbox: &'a Arc<Inbox>,
    next_ticket: &'a mut u64,
    spawner: &'a dyn Spawn,
    vars: &'a mut ContextMap,
    pipeline_id: u64,
    stage: &'static str,
    index: usize,
}

impl<'a> StageContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        inbox: &'a Arc<Inbox>,
        next_ticket: &'a mut u64,
        spawner: &'a dyn Spawn,
        vars: &'a mut ContextMap,
        pipeline_id: u64,
        stage: &'static str,
        index: usize,
    ) -> Self {
        Self {
            outputs: Vec::new(),
            bridge: None,
            violation: false,
            inbox,
            next_ticket,
            spawner,
            vars,
            pipeline_id,
            stage,
            index,
        }
    }

    /// Send an event to the next stage.
    pub fn emit(&mut self, event: Event) {
        self.outputs.push(event);
    }

    /// Obtain the bridge for a suspension of this stage.
    ///
    /// Return [`Flow::Pending`] after calling this. Calling it twice within
    /// one `process` call supersedes the first bridge.
    pub fn suspend(&mut self) -> Bridge {
        *self.next_ticket += 1;
        let bridge = Bridge::new(
            self.inbox,
            self.pipeline_id,
            self.stage,
            self.index,
            *self.next_ticket,
        );
        self.bridge = Some(bridge.clone());
        bridge
    }

    /// Run `task` on the pipeline's spawner.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawner.spawn(task.boxed());
    }

    /// Report a malformed event sequence: emits `Error(ProtocolViolation)`
    /// and applies the pipeline's violation policy after the current call.
    ///
    /// The stage discards the offending state itself, usually via `reset`.
    pub fn violation(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(
            pipeline_id = self.pipeline_id,
            stage = self.stage,
            index = self.index,
            %message,
            "Protocol violation"
        );
        self.violation = true;
        self.outputs
            .push(Event::Error(StreamError::protocol_violation(message)));
    }

    /// Connection-scoped variables.
    pub fn vars(&mut self) -> &mut ContextMap {
        self.vars
    }

    pub fn pipeline_id(&self) -> u64 {
        self.pipeline_id
    }

    /// Position of this stage in its chain.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn finish(self) -> StageOutcome {
        StageOutcome {
            outputs: self.outputs,
            ticket: self.bridge.map(|b| b.ticket()),
            violation: self.violation,
        }
    }
}

pub(crate) struct StageOutcome {
    pub outputs: Vec<Event>,
    pub ticket: Option<u64>,
    pub violation: bool,
}
