//! Seams between a pipeline and its surroundings: egress and task spawning.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};

use crate::event::Event;

/// Receives every event forwarded past the last stage.
pub trait EventSink: Send {
    fn on_event(&mut self, event: Event);
}

impl<F> EventSink for F
where
    F: FnMut(Event) + Send,
{
    fn on_event(&mut self, event: Event) {
        self(event)
    }
}

/// Data bytes handed to an egress writer and not yet written.
///
/// The channel itself is unbounded; the owner of the input side checks
/// [`queued`](Self::queued) against its limit and stops feeding while over it.
#[derive(Debug, Default)]
pub struct EgressGauge {
    queued: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl EgressGauge {
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn add(&self, bytes: usize) {
        self.queued.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Record `bytes` as written and wake a waiting reader.
    pub fn release(&self, bytes: usize) {
        self.queued.fetch_sub(bytes, Ordering::AcqRel);
        self.drained.notify_one();
    }

    /// Mark the writer as gone; nothing queued will drain anymore.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.drained.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the next [`release`](Self::release) or [`close`](Self::close).
    pub async fn drained(&self) {
        self.drained.notified().await
    }
}

/// Forwards egress events into a channel for a writer task, counting their
/// data bytes on an [`EgressGauge`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
    gauge: Arc<EgressGauge>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>, gauge: Arc<EgressGauge>) -> Self {
        Self { tx, gauge }
    }
}

impl EventSink for ChannelSink {
    fn on_event(&mut self, event: Event) {
        let bytes = event.data_len();
        self.gauge.add(bytes);
        if self.tx.send(event).is_err() {
            self.gauge.release(bytes);
            tracing::trace!("Egress receiver dropped; discarding event");
        }
    }
}

/// Runs the asynchronous work a suspended stage is waiting on.
pub trait Spawn: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// [`Spawn`] backed by a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Spawner for the runtime the caller is running on, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Spawn for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }
}

/// Fallback when no runtime is available: the task is dropped, which fails
/// the bridge it owns.
#[derive(Debug)]
pub(crate) struct NoRuntime;

impl Spawn for NoRuntime {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tracing::warn!("No async runtime available; abandoning deferred work");
        drop(task);
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;

    #[test]
    fn channel_sink_counts_queued_data() {
        let gauge = Arc::new(EgressGauge::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx, gauge.clone());

        sink.on_event(Event::data("abcd"));
        sink.on_event(Event::MessageEnd);
        sink.on_event(Event::data("ef"));
        assert_eq!(gauge.queued(), 6);

        let first = rx.try_recv().unwrap();
        gauge.release(first.data_len());
        assert_eq!(gauge.queued(), 2);

        drop(rx);
        sink.on_event(Event::data("lost"));
        assert_eq!(gauge.queued(), 2);
    }

    #[tokio::test]
    async fn release_wakes_waiting_reader() {
        let gauge = Arc::new(EgressGauge::default());
        let waiter = {
            let gauge = gauge.clone();
            tokio::spawn(async move { gauge.drained().await })
        };
        tokio::task::yield_now().await;
        gauge.release(0);
        waiter.await.unwrap();

        gauge.close();
        gauge.drained().await;
        assert!(gauge.is_closed());
    }

    #[tokio::test]
    async fn tokio_spawner_runs_tasks() {
        let ran = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let flag = ran.clone();
        TokioSpawner::try_current().unwrap().spawn(
            async move {
                flag.store(true, Ordering::SeqCst);
                let _ = done_tx.send(());
            }
            .boxed(),
        );
        done_rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn no_runtime_drops_task() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        NoRuntime.spawn(async move { flag.store(true, Ordering::SeqCst) }.boxed());
        assert!(!ran.load(Ordering::SeqCst));
    }
}
