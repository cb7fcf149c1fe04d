//! Sluice: a programmable network data-plane.
//!
//! Each accepted connection becomes a stream of [`Event`]s pushed through an
//! ordered chain of [`Stage`]s. Stages may suspend on asynchronous work; the
//! [`Pipeline`] holds back later events in order until the stage resumes.

pub mod buffer;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod script;
pub mod server;
pub mod stage;

pub use buffer::ByteBuffer;
pub use config::SluiceConfig;
pub use event::{ErrorKind, Event, MessageHead, StreamError};
pub use lifecycle::Shutdown;
pub use pipeline::{Bridge, Pipeline, PipelineError, PipelineTemplate};
pub use server::{Server, ServerHandle};
pub use stage::{Flow, Stage, StageContext};
