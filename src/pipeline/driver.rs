//! Pipeline driver: routes events through a chain and coordinates suspension.
//!
//! # State Machine
//! ```text
//! Active ──stage returns Pending──▶ Suspended
//!    ▲                                  │
//!    └──────bridge settles, backlog ────┘
//!           drained (may suspend again)
//!
//! Active/Suspended ──StreamEnd at egress / fatal error / close()──▶ Closed
//! ```
//!
//! # Ordering
//! Every slot holds a single FIFO backlog. While a slot is suspended, events
//! bound for it are queued there and nowhere else; on resume the slot first
//! forwards its completion events, then drains the backlog in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::event::{BufferLimits, Event, EventBuffer, Overflow, StreamError};
use crate::observability::metrics;
use crate::pipeline::bridge::{Completion, Inbox, Outcome, Wakeup};
use crate::pipeline::{ContextMap, EventSink, Spawn, ViolationPolicy};
use crate::stage::{Flow, Stage, StageContext, StageDump};

static PIPELINE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Errors returned to the party feeding a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The pipeline has already closed.
    #[error("pipeline is closed")]
    Closed,

    /// An event was fed after the input `StreamEnd`.
    #[error("event fed after end of stream")]
    AfterStreamEnd,

    /// A suspended stage exceeded its buffer limit; the pipeline closed.
    #[error("stage {index} ({stage}) overflowed its suspension buffer: {overflow}")]
    BackpressureOverflow {
        index: usize,
        stage: &'static str,
        overflow: Overflow,
    },

    /// A stage reported a protocol violation under the `close` policy.
    #[error("stage {index} ({stage}) reported a protocol violation")]
    ProtocolViolation { index: usize, stage: &'static str },
}

/// Connection-fatal conditions raised while routing.
#[derive(Debug)]
enum Fatal {
    Overflow {
        index: usize,
        stage: &'static str,
        overflow: Overflow,
    },
    Violation {
        index: usize,
        stage: &'static str,
    },
}

impl From<Fatal> for PipelineError {
    fn from(fatal: Fatal) -> Self {
        match fatal {
            Fatal::Overflow {
                index,
                stage,
                overflow,
            } => PipelineError::BackpressureOverflow {
                index,
                stage,
                overflow,
            },
            Fatal::Violation { index, stage } => PipelineError::ProtocolViolation { index, stage },
        }
    }
}

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Active,
    Suspended,
    Closed,
}

/// Diagnostic snapshot of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineDump {
    pub id: u64,
    pub name: String,
    pub state: PipelineState,
    pub events_in: u64,
    pub events_out: u64,
    pub context_keys: Vec<String>,
    pub stages: Vec<StageDump>,
}

struct Slot {
    stage: Box<dyn Stage>,
    backlog: EventBuffer,
    ticket: Option<u64>,
    received_end: bool,
    forwarded_end: bool,
}

impl Slot {
    fn dump(&self, index: usize) -> StageDump {
        let mut out = StageDump {
            index,
            name: self.stage.name().to_string(),
            pending: self.ticket.is_some(),
            buffered_events: self.backlog.len(),
            buffered_bytes: self.backlog.byte_size(),
            ..StageDump::default()
        };
        self.stage.dump(&mut out);
        out
    }
}

/// An ordered chain of stage instances bound to one connection.
///
/// Driven by one owner at a time: `feed`, `feed_end` and `run_completions`
/// take `&mut self`. Bridges settled on other threads only queue their
/// outcome; it is applied on the next `feed` or `run_completions`.
pub struct Pipeline {
    id: u64,
    name: Arc<str>,
    slots: Vec<Slot>,
    context: ContextMap,
    sink: Box<dyn EventSink>,
    spawner: Arc<dyn Spawn>,
    inbox: Arc<Inbox>,
    next_ticket: u64,
    policy: ViolationPolicy,
    input_ended: bool,
    egress_ended: bool,
    closed: bool,
    events_in: u64,
    events_out: u64,
}

impl Pipeline {
    pub(crate) fn new(
        name: Arc<str>,
        stages: Vec<Box<dyn Stage>>,
        default_limits: BufferLimits,
        policy: ViolationPolicy,
        sink: Box<dyn EventSink>,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        let slots = stages
            .into_iter()
            .map(|stage| {
                let limits = stage
                    .buffer_limits()
                    .map_or(default_limits, |own| own.or(default_limits));
                Slot {
                    stage,
                    backlog: EventBuffer::new(limits),
                    ticket: None,
                    received_end: false,
                    forwarded_end: false,
                }
            })
            .collect();

        Self {
            id: PIPELINE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name,
            slots,
            context: ContextMap::new(),
            sink,
            spawner,
            inbox: Arc::new(Inbox::default()),
            next_ticket: 0,
            policy,
            input_ended: false,
            egress_ended: false,
            closed: false,
            events_in: 0,
            events_out: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        if self.closed {
            PipelineState::Closed
        } else if self.slots.iter().any(|s| s.ticket.is_some()) {
            PipelineState::Suspended
        } else {
            PipelineState::Active
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextMap {
        &mut self.context
    }

    /// Handle for waiting on bridge completions.
    pub fn wakeup(&self) -> Wakeup {
        Wakeup::new(self.inbox.clone())
    }

    /// Push one event into the first stage.
    pub fn feed(&mut self, event: Event) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        if self.input_ended {
            return Err(PipelineError::AfterStreamEnd);
        }
        if event.is_stream_end() {
            self.input_ended = true;
        }
        self.events_in += 1;
        metrics::record_event("in");

        let result = self
            .deliver(0, event)
            .and_then(|()| self.apply_completions());
        self.conclude(result)
    }

    /// Signal a clean end of input.
    pub fn feed_end(&mut self) -> Result<(), PipelineError> {
        self.feed(Event::stream_end())
    }

    /// Apply every queued bridge completion.
    ///
    /// Call this whenever [`Wakeup::notified`] fires. A no-op once closed.
    pub fn run_completions(&mut self) -> Result<(), PipelineError> {
        if self.closed {
            return Ok(());
        }
        let result = self.apply_completions();
        self.conclude(result)
    }

    /// Tear the pipeline down from outside: every stage is reset, every
    /// buffer released, outstanding bridges become no-ops. Nothing is emitted.
    pub fn close(&mut self) {
        self.teardown("closed by owner");
    }

    pub fn dump(&self) -> PipelineDump {
        PipelineDump {
            id: self.id,
            name: self.name.to_string(),
            state: self.state(),
            events_in: self.events_in,
            events_out: self.events_out,
            context_keys: self.context.keys().map(str::to_string).collect(),
            stages: self
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| slot.dump(index))
                .collect(),
        }
    }

    fn conclude(&mut self, result: Result<(), Fatal>) -> Result<(), PipelineError> {
        match result {
            Ok(()) => {
                if self.egress_ended {
                    self.teardown("stream ended");
                }
                Ok(())
            }
            Err(fatal) => Err(self.abort(fatal)),
        }
    }

    fn abort(&mut self, fatal: Fatal) -> PipelineError {
        let error = match &fatal {
            Fatal::Overflow {
                index,
                stage,
                overflow,
            } => {
                metrics::record_backpressure_overflow();
                tracing::warn!(
                    pipeline_id = self.id,
                    pipeline = %self.name,
                    index,
                    stage,
                    error = %overflow,
                    "Suspension buffer overflow; closing pipeline"
                );
                StreamError::backpressure_overflow(overflow.to_string())
            }
            Fatal::Violation { index, stage } => {
                tracing::info!(
                    pipeline_id = self.id,
                    pipeline = %self.name,
                    index,
                    stage,
                    "Protocol violation under close policy; closing pipeline"
                );
                StreamError::protocol_violation(format!("stage {index} ({stage})"))
            }
        };

        if !self.egress_ended {
            if matches!(fatal, Fatal::Overflow { .. }) {
                self.egress(Event::Error(error.clone()));
            }
            self.egress(Event::StreamEnd(Some(error)));
        }
        self.teardown("fatal error");
        fatal.into()
    }

    fn teardown(&mut self, reason: &'static str) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbox.close();
        for slot in &mut self.slots {
            slot.stage.reset();
            slot.backlog.clear();
            slot.ticket = None;
        }
        tracing::debug!(
            pipeline_id = self.id,
            pipeline = %self.name,
            reason,
            events_in = self.events_in,
            events_out = self.events_out,
            "Pipeline closed"
        );
    }

    fn deliver(&mut self, index: usize, event: Event) -> Result<(), Fatal> {
        if index == self.slots.len() {
            self.egress(event);
            return Ok(());
        }

        let slot = &mut self.slots[index];
        if slot.received_end {
            tracing::debug!(
                pipeline_id = self.id,
                index,
                event = event.kind_name(),
                "Dropping event delivered after end of stream"
            );
            return Ok(());
        }

        if slot.ticket.is_some() || !slot.backlog.is_empty() {
            let stage = slot.stage.name();
            return slot
                .backlog
                .push(event)
                .map_err(|overflow| Fatal::Overflow {
                    index,
                    stage,
                    overflow,
                });
        }

        self.process_at(index, event)
    }

    fn process_at(&mut self, index: usize, event: Event) -> Result<(), Fatal> {
        let is_end = event.is_stream_end();
        let slot = &mut self.slots[index];
        let stage = slot.stage.name();

        let mut cx = StageContext::new(
            &self.inbox,
            &mut self.next_ticket,
            &*self.spawner,
            &mut self.context,
            self.id,
            stage,
            index,
        );
        let flow = slot.stage.process(event, &mut cx);
        let mut outcome = cx.finish();

        if is_end {
            slot.received_end = true;
        }

        let mut defect = false;
        match (flow, outcome.ticket) {
            (Flow::Pending, Some(ticket)) => {
                slot.ticket = Some(ticket);
                metrics::record_suspension();
                tracing::trace!(pipeline_id = self.id, index, stage, ticket, "Stage suspended");
            }
            (Flow::Pending, None) => {
                tracing::error!(
                    pipeline_id = self.id,
                    index,
                    stage,
                    "Stage returned Pending without a bridge"
                );
                defect = true;
                outcome.violation = true;
                outcome.outputs.push(Event::Error(StreamError::protocol_violation(
                    "stage suspended without a bridge",
                )));
            }
            (Flow::Ready, Some(ticket)) => {
                tracing::warn!(
                    pipeline_id = self.id,
                    index,
                    stage,
                    ticket,
                    "Stage obtained a bridge but returned Ready; bridge invalidated"
                );
            }
            (Flow::Ready, None) => {}
        }

        if outcome.violation {
            metrics::record_protocol_violation();
        }
        if defect {
            slot.stage.reset();
        }

        self.forward(index, outcome.outputs)?;

        if outcome.violation && self.policy == ViolationPolicy::Close {
            return Err(Fatal::Violation { index, stage });
        }
        Ok(())
    }

    /// Send `events` produced by slot `index` to the next slot.
    fn forward(&mut self, index: usize, events: Vec<Event>) -> Result<(), Fatal> {
        for event in events {
            if self.slots[index].forwarded_end {
                tracing::debug!(
                    pipeline_id = self.id,
                    index,
                    event = event.kind_name(),
                    "Dropping event emitted after end of stream"
                );
                continue;
            }
            if event.is_stream_end() {
                self.slots[index].forwarded_end = true;
            }
            self.deliver(index + 1, event)?;
        }

        let slot = &mut self.slots[index];
        if slot.received_end && !slot.forwarded_end && slot.ticket.is_none() {
            slot.forwarded_end = true;
            self.deliver(index + 1, Event::stream_end())?;
        }
        Ok(())
    }

    fn egress(&mut self, event: Event) {
        if self.egress_ended {
            tracing::debug!(
                pipeline_id = self.id,
                event = event.kind_name(),
                "Dropping egress event after end of stream"
            );
            return;
        }
        if event.is_stream_end() {
            self.egress_ended = true;
        }
        self.events_out += 1;
        metrics::record_event("out");
        self.sink.on_event(event);
    }

    fn apply_completions(&mut self) -> Result<(), Fatal> {
        loop {
            let batch = self.inbox.take();
            if batch.is_empty() {
                return Ok(());
            }
            for completion in batch {
                if self.egress_ended {
                    break;
                }
                self.apply(completion)?;
            }
        }
    }

    fn apply(&mut self, completion: Completion) -> Result<(), Fatal> {
        let Completion {
            slot: index,
            ticket,
            outcome,
        } = completion;
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        let stage = slot.stage.name();

        if slot.ticket != Some(ticket) {
            metrics::record_bridge_defect("stale");
            tracing::warn!(
                pipeline_id = self.id,
                index,
                stage,
                ticket,
                "Discarding completion for a superseded suspension"
            );
            return Ok(());
        }
        slot.ticket = None;

        let events = match outcome {
            Outcome::Completed(events) => {
                tracing::trace!(pipeline_id = self.id, index, stage, ticket, "Stage resumed");
                events
            }
            Outcome::Failed(error) => {
                tracing::debug!(
                    pipeline_id = self.id,
                    index,
                    stage,
                    error = %error,
                    "Suspension failed; resetting stage"
                );
                slot.stage.reset();
                vec![Event::Error(error)]
            }
        };

        self.forward(index, events)?;
        self.drain_backlog(index)
    }

    fn drain_backlog(&mut self, index: usize) -> Result<(), Fatal> {
        while self.slots[index].ticket.is_none() && !self.egress_ended {
            let Some(event) = self.slots[index].backlog.pop() else {
                break;
            };
            self.process_at(index, event)?;
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown("dropped");
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("stages", &self.slots.len())
            .finish()
    }
}
