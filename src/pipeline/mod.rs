//! Pipeline subsystem: per-connection stage chains and their driver.
//!
//! # Data Flow
//! ```text
//! transport ── feed(Event) ──▶ slot 0 ──▶ slot 1 ──▶ … ──▶ EventSink (egress)
//!                                 │
//!                     stage returns Pending + Bridge
//!                                 │
//!          later events queue in that slot's EventBuffer
//!                                 │
//! async work ── Bridge::complete ──▶ Inbox ──▶ run_completions()
//!                                     → completion events forwarded
//!                                     → backlog drained in order
//! ```
//!
//! # Design Decisions
//! - One owner drives a pipeline; cross-thread work only enqueues completions
//! - Buffers are bounded per slot; overflow is fatal for the connection
//! - Templates are immutable and shared; each connection gets fresh clones

pub mod bridge;
mod context;
mod driver;
mod sink;
mod template;

pub use bridge::{Bridge, BridgeError, Outcome, Wakeup};
pub use context::ContextMap;
pub use driver::{Pipeline, PipelineDump, PipelineError, PipelineState};
pub use sink::{ChannelSink, EgressGauge, EventSink, Spawn, TokioSpawner};
pub use template::{PipelineTemplate, TemplateDump, TemplateSet, ViolationPolicy};
