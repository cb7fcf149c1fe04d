//! Suspension bridge: exactly-once completion handles for suspended stages.
//!
//! # Data Flow
//! ```text
//! stage returns Pending with a Bridge
//!     → async work runs elsewhere (any thread)
//!     → Bridge::complete / Bridge::fail
//!     → Completion queued in the pipeline's Inbox, Notify woken
//!     → pipeline owner calls Pipeline::run_completions()
//!     → completion events forwarded, backlog drained
//! ```
//!
//! # Design Decisions
//! - The bridge holds a `Weak` to the inbox; it never keeps a pipeline alive
//! - Completions are never applied in-line from a foreign thread
//! - Second settle, settle after close and settle after drop are logged and ignored

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::Notify;

use crate::event::{Event, StreamError};
use crate::observability::metrics;

/// Misuse of a bridge. Reported to the caller and logged, never propagated
/// into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("bridge already settled")]
    AlreadySettled,
    #[error("pipeline already closed")]
    PipelineClosed,
    #[error("pipeline no longer exists")]
    PipelineGone,
}

impl BridgeError {
    fn reason(&self) -> &'static str {
        match self {
            BridgeError::AlreadySettled => "already_settled",
            BridgeError::PipelineClosed => "pipeline_closed",
            BridgeError::PipelineGone => "pipeline_gone",
        }
    }
}

/// How a suspension was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Events to forward downstream of the suspended stage.
    Completed(Vec<Event>),
    /// The awaited work failed; the stage is reset and an error forwarded.
    Failed(StreamError),
}

/// A settled suspension waiting to be applied by the pipeline owner.
#[derive(Debug)]
pub(crate) struct Completion {
    pub slot: usize,
    pub ticket: u64,
    pub outcome: Outcome,
}

/// Completion queue shared between a pipeline and its outstanding bridges.
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    queue: Mutex<Vec<Completion>>,
    closed: AtomicBool,
    notify: Notify,
}

impl Inbox {
    fn post(&self, completion: Completion) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(completion);
        self.notify.notify_one();
    }

    pub(crate) fn take(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Wakes the pipeline owner when a bridge settles.
///
/// Holding a `Wakeup` does not keep bridges able to deliver once the
/// pipeline has closed.
#[derive(Debug, Clone)]
pub struct Wakeup {
    inbox: Arc<Inbox>,
}

impl Wakeup {
    pub(crate) fn new(inbox: Arc<Inbox>) -> Self {
        Self { inbox }
    }

    /// Wait until a completion has been queued (or the pipeline closed).
    ///
    /// A notification that arrives while nobody is waiting is remembered,
    /// so no completion is missed between checks.
    pub async fn notified(&self) {
        self.inbox.notify.notified().await
    }
}

struct BridgeInner {
    inbox: Weak<Inbox>,
    pipeline_id: u64,
    stage: &'static str,
    slot: usize,
    ticket: u64,
    settled: AtomicBool,
}

impl BridgeInner {
    fn settle(&self, outcome: Outcome) -> Result<(), BridgeError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(self.defect(BridgeError::AlreadySettled));
        }
        let Some(inbox) = self.inbox.upgrade() else {
            return Err(self.defect(BridgeError::PipelineGone));
        };
        if inbox.is_closed() {
            return Err(self.defect(BridgeError::PipelineClosed));
        }

        tracing::trace!(
            pipeline_id = self.pipeline_id,
            stage = self.stage,
            index = self.slot,
            ticket = self.ticket,
            "Bridge settled"
        );
        inbox.post(Completion {
            slot: self.slot,
            ticket: self.ticket,
            outcome,
        });
        Ok(())
    }

    fn defect(&self, error: BridgeError) -> BridgeError {
        metrics::record_bridge_defect(error.reason());
        match error {
            BridgeError::AlreadySettled => tracing::error!(
                pipeline_id = self.pipeline_id,
                stage = self.stage,
                index = self.slot,
                "Bridge settled more than once; ignoring"
            ),
            _ => tracing::warn!(
                pipeline_id = self.pipeline_id,
                stage = self.stage,
                index = self.slot,
                error = %error,
                "Bridge settled after its pipeline closed; ignoring"
            ),
        }
        error
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Abandoned: fail it so the stage is not left suspended forever.
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        if inbox.is_closed() {
            return;
        }
        tracing::warn!(
            pipeline_id = self.pipeline_id,
            stage = self.stage,
            index = self.slot,
            "Bridge dropped without completion"
        );
        inbox.post(Completion {
            slot: self.slot,
            ticket: self.ticket,
            outcome: Outcome::Failed(StreamError::async_failure(
                "bridge dropped without completion",
            )),
        });
    }
}

/// Completion handle for one suspension of one stage.
///
/// Clones share a single settle-once flag: across all clones, exactly one
/// `complete` or `fail` takes effect. Safe to move to and settle from any
/// thread.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub(crate) fn new(
        inbox: &Arc<Inbox>,
        pipeline_id: u64,
        stage: &'static str,
        slot: usize,
        ticket: u64,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                inbox: Arc::downgrade(inbox),
                pipeline_id,
                stage,
                slot,
                ticket,
                settled: AtomicBool::new(false),
            }),
        }
    }

    /// Resume the stage, forwarding `events` downstream of it.
    pub fn complete(&self, events: Vec<Event>) -> Result<(), BridgeError> {
        self.inner.settle(Outcome::Completed(events))
    }

    /// Resume the stage with a failure: it is reset and an `AsyncFailure`
    /// error is forwarded in place of its output.
    pub fn fail(&self, error: impl fmt::Display) -> Result<(), BridgeError> {
        self.inner
            .settle(Outcome::Failed(StreamError::async_failure(error.to_string())))
    }

    /// Whether any clone of this bridge has been settled.
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.inner.ticket
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("pipeline_id", &self.inner.pipeline_id)
            .field("stage", &self.inner.stage)
            .field("slot", &self.inner.slot)
            .field("ticket", &self.inner.ticket)
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(inbox: &Arc<Inbox>) -> Bridge {
        Bridge::new(inbox, 1, "test", 0, 7)
    }

    #[test]
    fn complete_queues_one_completion() {
        let inbox = Arc::new(Inbox::default());
        let b = bridge(&inbox);
        b.complete(vec![Event::MessageEnd]).unwrap();
        let queued = inbox.take();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].ticket, 7);
        assert_eq!(queued[0].outcome, Outcome::Completed(vec![Event::MessageEnd]));
    }

    #[test]
    fn second_settle_is_rejected() {
        let inbox = Arc::new(Inbox::default());
        let b = bridge(&inbox);
        let other = b.clone();
        b.complete(vec![]).unwrap();
        assert_eq!(other.fail("late"), Err(BridgeError::AlreadySettled));
        assert_eq!(inbox.take().len(), 1);
    }

    #[test]
    fn settle_after_close_is_rejected() {
        let inbox = Arc::new(Inbox::default());
        let b = bridge(&inbox);
        inbox.close();
        assert_eq!(b.complete(vec![]), Err(BridgeError::PipelineClosed));
        assert!(inbox.take().is_empty());
    }

    #[test]
    fn settle_after_drop_is_rejected() {
        let inbox = Arc::new(Inbox::default());
        let b = bridge(&inbox);
        drop(inbox);
        assert_eq!(b.complete(vec![]), Err(BridgeError::PipelineGone));
    }

    #[test]
    fn dropping_unsettled_bridge_fails_it() {
        let inbox = Arc::new(Inbox::default());
        drop(bridge(&inbox));
        let queued = inbox.take();
        assert_eq!(queued.len(), 1);
        assert!(matches!(queued[0].outcome, Outcome::Failed(_)));
    }

    #[test]
    fn dropping_settled_bridge_is_silent() {
        let inbox = Arc::new(Inbox::default());
        let b = bridge(&inbox);
        b.complete(vec![]).unwrap();
        drop(b);
        assert_eq!(inbox.take().len(), 1);
    }
}
