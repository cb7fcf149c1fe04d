//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Close pipelines → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown (second one forces exit)
//!     SIGHUP → Trigger config reload
//!     SIGUSR1 → Dump live pipelines to the log
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, close, drain
//! - Draining has a deadline; connections still open after it are abandoned

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::SignalEvent;
