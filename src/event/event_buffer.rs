//! Ordered holding queue for events a suspended stage has not processed yet.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Event;

/// Capacity limits for an [`EventBuffer`].
///
/// `None` means unbounded in that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferLimits {
    pub max_events: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl BufferLimits {
    pub const UNBOUNDED: BufferLimits = BufferLimits {
        max_events: None,
        max_bytes: None,
    };

    pub fn new(max_events: Option<usize>, max_bytes: Option<usize>) -> Self {
        Self {
            max_events,
            max_bytes,
        }
    }

    /// Fill unset dimensions from `fallback`.
    pub fn or(self, fallback: BufferLimits) -> BufferLimits {
        BufferLimits {
            max_events: self.max_events.or(fallback.max_events),
            max_bytes: self.max_bytes.or(fallback.max_bytes),
        }
    }
}

/// A push that would have exceeded the buffer's limits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event buffer overflow: {events} events / {bytes} bytes queued, limits {limits:?}")]
pub struct Overflow {
    /// Events queued before the rejected push.
    pub events: usize,
    /// Data bytes queued before the rejected push.
    pub bytes: usize,
    pub limits: BufferLimits,
}

/// FIFO of pending events with byte and count accounting.
#[derive(Debug, Clone, Default)]
pub struct EventBuffer {
    events: VecDeque<Event>,
    bytes: usize,
    limits: BufferLimits,
}

impl EventBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            events: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(BufferLimits::UNBOUNDED)
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Queue an event at the back.
    ///
    /// Fails without queuing when the push would exceed either limit.
    pub fn push(&mut self, event: Event) -> Result<(), Overflow> {
        let size = event.data_len();
        let over_events = self
            .limits
            .max_events
            .is_some_and(|max| self.events.len() + 1 > max);
        let over_bytes = self
            .limits
            .max_bytes
            .is_some_and(|max| self.bytes + size > max);

        if over_events || over_bytes {
            return Err(Overflow {
                events: self.events.len(),
                bytes: self.bytes,
                limits: self.limits,
            });
        }

        self.bytes += size;
        self.events.push_back(event);
        Ok(())
    }

    /// Take the oldest event.
    pub fn pop(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        self.bytes -= event.data_len();
        Some(event)
    }

    /// Remove every event, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.bytes = 0;
        self.events.drain(..)
    }

    /// Release all held events and their payloads.
    pub fn clear(&mut self) {
        self.events.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total `Data` bytes currently held.
    pub fn byte_size(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MessageHead, StreamError};

    fn sample() -> Vec<Event> {
        vec![
            Event::MessageStart(MessageHead::new().with("id", "1")),
            Event::data("ab"),
            Event::data("cd"),
            Event::MessageEnd,
            Event::Error(StreamError::protocol_violation("x")),
            Event::stream_end(),
        ]
    }

    #[test]
    fn drain_reproduces_original_order() {
        let mut buf = EventBuffer::unbounded();
        for ev in sample() {
            buf.push(ev).unwrap();
        }
        assert_eq!(buf.byte_size(), 4);
        let out: Vec<Event> = buf.drain().collect();
        assert_eq!(out, sample());
        assert!(buf.is_empty());
        assert_eq!(buf.byte_size(), 0);
    }

    #[test]
    fn pop_updates_accounting() {
        let mut buf = EventBuffer::unbounded();
        buf.push(Event::data("abc")).unwrap();
        buf.push(Event::MessageEnd).unwrap();
        assert_eq!(buf.pop(), Some(Event::data("abc")));
        assert_eq!(buf.byte_size(), 0);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn byte_limit_rejects_without_queuing() {
        let mut buf = EventBuffer::new(BufferLimits::new(None, Some(4)));
        buf.push(Event::data("abc")).unwrap();
        let err = buf.push(Event::data("de")).unwrap_err();
        assert_eq!(err.bytes, 3);
        assert_eq!(buf.len(), 1);
        // Markers carry no bytes and still fit.
        buf.push(Event::MessageEnd).unwrap();
    }

    #[test]
    fn event_limit_counts_markers() {
        let mut buf = EventBuffer::new(BufferLimits::new(Some(2), None));
        buf.push(Event::message_start()).unwrap();
        buf.push(Event::MessageEnd).unwrap();
        assert!(buf.push(Event::MessageEnd).is_err());
    }

    #[test]
    fn limits_fall_back_per_dimension() {
        let stage = BufferLimits::new(None, Some(10));
        let pipeline = BufferLimits::new(Some(5), Some(100));
        assert_eq!(stage.or(pipeline), BufferLimits::new(Some(5), Some(10)));
    }
}
