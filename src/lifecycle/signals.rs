//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP, SIGUSR1)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The consumer decides what a repeated shutdown means
//! - SIGHUP triggers config reload, not shutdown
//! - SIGUSR1 logs a dump of every live pipeline

use tokio::sync::mpsc;

/// What a received signal asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
    Dump,
}

/// Install the handlers and forward translated signals.
///
/// Must be called from within a Tokio runtime.
#[cfg(unix)]
pub fn listen() -> std::io::Result<mpsc::UnboundedReceiver<SignalEvent>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = terminate.recv() => SignalEvent::Shutdown,
                _ = interrupt.recv() => SignalEvent::Shutdown,
                _ = hangup.recv() => SignalEvent::Reload,
                _ = user1.recv() => SignalEvent::Dump,
            };
            tracing::info!(signal = ?event, "Signal received");
            if tx.send(event).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Install the handlers and forward translated signals.
///
/// Only Ctrl-C is available off Unix.
#[cfg(not(unix))]
pub fn listen() -> std::io::Result<mpsc::UnboundedReceiver<SignalEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(signal = ?SignalEvent::Shutdown, "Signal received");
            if tx.send(SignalEvent::Shutdown).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
