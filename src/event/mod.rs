//! Stream events.
//!
//! A connection's traffic is a sequence of [`Event`]s terminated by exactly
//! one `StreamEnd`. Events are cheap to clone: payloads are reference-counted.

mod event_buffer;

pub use event_buffer::{BufferLimits, EventBuffer, Overflow};

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::buffer::ByteBuffer;

/// Error classification carried by `Error` and `StreamEnd` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed event sequence seen by a stage.
    ProtocolViolation,
    /// A suspended stage buffered more than its configured limit.
    BackpressureOverflow,
    /// An awaited external result failed.
    AsyncFailure,
    /// The transport reported an I/O failure.
    Transport,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::BackpressureOverflow => "backpressure_overflow",
            ErrorKind::AsyncFailure => "async_failure",
            ErrorKind::Transport => "transport",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error flowing through the stream as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    kind: ErrorKind,
    message: Arc<str>,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol_violation(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    pub fn backpressure_overflow(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::BackpressureOverflow, message)
    }

    pub fn async_failure(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::AsyncFailure, message)
    }

    pub fn transport(message: impl Into<Arc<str>>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Header fields attached to a `MessageStart`.
///
/// Field order is preserved; cloning shares the underlying list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHead {
    fields: Arc<Vec<(String, String)>>,
}

impl MessageHead {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this head with one more field.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.fields).push((name.into(), value.into()));
        self
    }

    /// First value of the named field (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One discrete unit of a connection's traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A run of payload bytes.
    Data(ByteBuffer),
    /// Opens a message.
    MessageStart(MessageHead),
    /// Closes the open message.
    MessageEnd,
    /// Terminates the stream, optionally with the error that ended it.
    StreamEnd(Option<StreamError>),
    /// Non-terminal error marker.
    Error(StreamError),
}

impl Event {
    /// Shorthand for a `Data` event.
    pub fn data(payload: impl Into<ByteBuffer>) -> Self {
        Event::Data(payload.into())
    }

    /// Shorthand for a `MessageStart` with an empty head.
    pub fn message_start() -> Self {
        Event::MessageStart(MessageHead::new())
    }

    /// Shorthand for a clean `StreamEnd`.
    pub fn stream_end() -> Self {
        Event::StreamEnd(None)
    }

    pub fn is_stream_end(&self) -> bool {
        matches!(self, Event::StreamEnd(_))
    }

    /// Number of payload bytes (zero for markers).
    pub fn data_len(&self) -> usize {
        match self {
            Event::Data(buf) => buf.size(),
            _ => 0,
        }
    }

    /// Short label used in logs and dumps.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::Data(_) => "data",
            Event::MessageStart(_) => "message_start",
            Event::MessageEnd => "message_end",
            Event::StreamEnd(_) => "stream_end",
            Event::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_payload() {
        let ev = Event::data("payload");
        let copy = ev.clone();
        match (&ev, &copy) {
            (Event::Data(a), Event::Data(b)) => {
                let pa = a.chunks().next().unwrap().as_ptr();
                let pb = b.chunks().next().unwrap().as_ptr();
                assert_eq!(pa, pb);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn head_lookup_is_case_insensitive() {
        let head = MessageHead::new().with("Content-Type", "text/plain");
        assert_eq!(head.get("content-type"), Some("text/plain"));
        assert_eq!(head.get("missing"), None);
    }

    #[test]
    fn head_with_does_not_touch_clones() {
        let a = MessageHead::new().with("a", "1");
        let b = a.clone().with("b", "2");
        assert_eq!(a.fields().count(), 1);
        assert_eq!(b.fields().count(), 2);
    }

    #[test]
    fn stream_error_display() {
        let err = StreamError::async_failure("lookup failed");
        assert_eq!(err.to_string(), "async_failure: lookup failed");
    }

    #[test]
    fn data_len_for_markers_is_zero() {
        assert_eq!(Event::data("abc").data_len(), 3);
        assert_eq!(Event::MessageEnd.data_len(), 0);
        assert!(Event::stream_end().is_stream_end());
    }
}
