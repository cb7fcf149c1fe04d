//! Connection lifecycle tracking and the per-connection pipeline driver.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track live connections for graceful shutdown
//! - Pump socket bytes through a pipeline and egress events back out
//!
//! # Data Flow
//! ```text
//! socket read ──▶ Event::Data ──▶ Pipeline::feed
//! EOF         ──▶ Pipeline::feed_end
//! read error  ──▶ StreamEnd(Transport)
//! bridge settled (Wakeup) ──▶ Pipeline::run_completions
//! egress ──▶ ChannelSink ──▶ writer task ──▶ socket write
//! ```
//!
//! Reads pause while more than `max_egress_bytes` of egress is waiting to be
//! written, so a peer that stops reading cannot grow the queue unbounded.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use crate::buffer::{pool, ByteBuffer};
use crate::event::{Event, StreamError};
use crate::observability::metrics;
use crate::pipeline::{ChannelSink, EgressGauge, PipelineTemplate};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::record_connection_opened();
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or `deadline` passes.
    ///
    /// Returns the number of connections still open.
    pub async fn wait_for_drain(&self, deadline: Duration) -> u64 {
        let poll = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if tokio::time::timeout(deadline, poll).await.is_err() {
            tracing::warn!(
                remaining = self.active_count(),
                "Connections still open after drain deadline"
            );
        }
        self.active_count()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::record_connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Process-wide notifications every connection listens to.
#[derive(Debug)]
pub struct ConnectionSignals {
    /// Close the pipeline and drop the connection.
    pub shutdown: broadcast::Receiver<()>,
    /// Log a pipeline dump.
    pub dump: broadcast::Receiver<()>,
}

/// Per-listener settings for [`serve`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Listener label for logs and the `listener` var.
    pub listener: Arc<str>,
    /// Egress bytes that may wait for the peer before reads pause.
    pub max_egress_bytes: usize,
}

/// Drive one accepted connection through a fresh instance of `template`.
///
/// Returns once the pipeline has closed and the egress has been flushed.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    options: ServeOptions,
    template: Arc<PipelineTemplate>,
    guard: ConnectionGuard,
    mut signals: ConnectionSignals,
) {
    let id = guard.id();
    let (mut reader, writer) = stream.into_split();
    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    let egress = Arc::new(EgressGauge::default());
    let writer_task = tokio::spawn(write_egress(writer, egress_rx, egress.clone(), id));

    let mut pipeline = template.instantiate(ChannelSink::new(egress_tx, egress.clone()));
    let vars = pipeline.context_mut();
    vars.insert("peer", peer.to_string());
    vars.insert("connection_id", id.as_u64());
    vars.insert("listener", options.listener.as_ref());
    let wakeup = pipeline.wakeup();

    tracing::debug!(
        connection_id = %id,
        peer = %peer,
        pipeline = template.name(),
        pipeline_id = pipeline.id(),
        "Connection started"
    );

    let pool = pool::global();
    let mut read_buf = pool.read_buffer();
    let mut input_open = true;
    let mut paused = false;

    while !pipeline.is_closed() {
        if egress.is_closed() {
            tracing::debug!(connection_id = %id, "Egress writer stopped; closing pipeline");
            pipeline.close();
            break;
        }
        let over = egress.queued() > options.max_egress_bytes;
        if over != paused {
            paused = over;
            tracing::debug!(
                connection_id = %id,
                queued = egress.queued(),
                limit = options.max_egress_bytes,
                paused,
                "Egress backpressure changed"
            );
        }
        if read_buf.capacity() < pool.chunk_size() / 4 {
            read_buf.reserve(pool.chunk_size());
        }

        let result = tokio::select! {
            read = reader.read_buf(&mut read_buf), if input_open && !paused => match read {
                Ok(0) => {
                    input_open = false;
                    pipeline.feed_end()
                }
                Ok(n) => {
                    pool.record_external(n);
                    let chunk = read_buf.split().freeze();
                    pipeline.feed(Event::Data(ByteBuffer::from(chunk)))
                }
                Err(e) => {
                    input_open = false;
                    tracing::debug!(connection_id = %id, error = %e, "Socket read failed");
                    pipeline.feed(Event::StreamEnd(Some(StreamError::transport(e.to_string()))))
                }
            },
            () = wakeup.notified() => pipeline.run_completions(),
            () = egress.drained(), if paused => Ok(()),
            _ = signals.shutdown.recv() => {
                tracing::debug!(connection_id = %id, "Closing connection for shutdown");
                pipeline.close();
                Ok(())
            }
            Ok(()) = signals.dump.recv() => {
                match serde_json::to_string(&pipeline.dump()) {
                    Ok(dump) => tracing::info!(connection_id = %id, %dump, "Pipeline dump"),
                    Err(e) => tracing::warn!(connection_id = %id, error = %e, "Pipeline dump failed"),
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::info!(connection_id = %id, peer = %peer, error = %e, "Pipeline aborted");
            break;
        }
    }

    // Dropping the pipeline releases the sink, which ends the writer.
    drop(pipeline);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(connection_id = %id, error = %e, "Socket write failed"),
        Err(e) => tracing::error!(connection_id = %id, error = %e, "Writer task panicked"),
    }
    drop(guard);
}

async fn write_egress(
    writer: OwnedWriteHalf,
    egress: mpsc::UnboundedReceiver<Event>,
    gauge: Arc<EgressGauge>,
    id: ConnectionId,
) -> std::io::Result<()> {
    let result = drain_egress(writer, egress, &gauge, id).await;
    gauge.close();
    result
}

async fn drain_egress(
    mut writer: OwnedWriteHalf,
    mut egress: mpsc::UnboundedReceiver<Event>,
    gauge: &EgressGauge,
    id: ConnectionId,
) -> std::io::Result<()> {
    while let Some(event) = egress.recv().await {
        match event {
            Event::Data(buf) => {
                for chunk in buf.chunks() {
                    writer.write_all(chunk).await?;
                }
                gauge.release(buf.size());
            }
            Event::StreamEnd(error) => {
                if let Some(error) = error {
                    tracing::debug!(connection_id = %id, error = %error, "Stream ended with error");
                }
                break;
            }
            other => {
                tracing::trace!(connection_id = %id, event = other.kind_name(), "Marker has no wire form");
            }
        }
    }
    writer.shutdown().await
}
