//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (tracking, pipeline driver)
//!     → pipeline instance from the listener's template
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - One task per connection owns its pipeline; a writer task owns the write half

pub mod connection;
pub mod listener;

pub use connection::{
    serve, ConnectionGuard, ConnectionId, ConnectionSignals, ConnectionTracker, ServeOptions,
};
pub use listener::{ConnectionPermit, Listener, ListenerError};
