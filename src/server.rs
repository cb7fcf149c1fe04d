//! Server: listeners, hot-swappable templates and process-wide signals.
//!
//! # Responsibilities
//! - Bind every configured listener
//! - Hand each accepted connection a pipeline from the current template set
//! - Swap in rebuilt templates on reload without touching live connections
//! - Fan out shutdown and dump requests to every connection
//!
//! # Design Decisions
//! - Templates live behind `ArcSwap`; an accept loads the current set lock-free
//! - Listener addresses are fixed for the process lifetime; changing them
//!   requires a restart

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ListenerConfig, SluiceConfig};
use crate::lifecycle::Shutdown;
use crate::net::{self, ConnectionSignals, ConnectionTracker, Listener, ListenerError, ServeOptions};
use crate::observability::metrics;
use crate::pipeline::TemplateSet;
use crate::script::TransformRegistry;
use crate::stage::factory::{build_templates, BuildError};

/// How long shutdown waits for connections to close.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Errors raised while starting or reconfiguring the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("listener {listener} references pipeline '{pipeline}', which the new configuration removes")]
    MissingPipeline { listener: String, pipeline: String },
}

/// Cloneable control surface for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    templates: Arc<ArcSwap<TemplateSet>>,
    registry: Arc<TransformRegistry>,
    listeners: Arc<Vec<ListenerConfig>>,
    shutdown: Shutdown,
    dump: broadcast::Sender<()>,
}

impl ServerHandle {
    /// Rebuild every template from `config` and swap them in.
    ///
    /// New connections use the new chains; live connections keep theirs.
    pub fn reload(&self, config: &SluiceConfig) -> Result<(), ServerError> {
        let result = self.try_reload(config);
        match &result {
            Ok(()) => metrics::record_reload("applied"),
            Err(e) => {
                metrics::record_reload("rejected");
                tracing::error!(error = %e, "Reload rejected; keeping current pipelines");
            }
        }
        result
    }

    fn try_reload(&self, config: &SluiceConfig) -> Result<(), ServerError> {
        let templates = build_templates(config, &self.registry)?;

        for bound in self.listeners.iter() {
            if !templates.contains_key(&bound.pipeline) {
                return Err(ServerError::MissingPipeline {
                    listener: bound.bind_address.clone(),
                    pipeline: bound.pipeline.clone(),
                });
            }
            let moved = config
                .listeners
                .iter()
                .find(|l| l.bind_address == bound.bind_address)
                .map_or(true, |l| l.pipeline != bound.pipeline);
            if moved {
                tracing::warn!(
                    listener = %bound.bind_address,
                    "Listener changes require a restart; keeping current binding"
                );
            }
        }
        for added in &config.listeners {
            if !self.listeners.iter().any(|l| l.bind_address == added.bind_address) {
                tracing::warn!(
                    listener = %added.bind_address,
                    "New listener requires a restart; not bound"
                );
            }
        }

        let names: Vec<_> = templates.keys().cloned().collect();
        self.templates.store(Arc::new(templates));
        tracing::info!(pipelines = ?names, "Pipeline templates reloaded");
        Ok(())
    }

    /// Start graceful shutdown. Returns `false` if it was already underway.
    pub fn shutdown(&self) -> bool {
        self.shutdown.trigger()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Ask every live connection to log its pipeline dump.
    pub fn dump(&self) {
        let templates = self.templates.load();
        for template in templates.values() {
            match serde_json::to_string(&template.dump()) {
                Ok(dump) => tracing::info!(%dump, "Template dump"),
                Err(e) => tracing::warn!(error = %e, "Template dump failed"),
            }
        }
        if self.dump.send(()).is_err() {
            tracing::info!("No live connections to dump");
        }
    }

    /// Current template set.
    pub fn templates(&self) -> Arc<TemplateSet> {
        self.templates.load_full()
    }
}

/// The bound server, ready to run.
pub struct Server {
    listeners: Vec<Listener>,
    handle: ServerHandle,
    tracker: ConnectionTracker,
}

impl Server {
    /// Build templates and bind every listener in `config`.
    pub async fn bind(config: &SluiceConfig, registry: TransformRegistry) -> Result<Self, ServerError> {
        let templates = build_templates(config, &registry)?;

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            listeners.push(Listener::bind(listener_config).await?);
        }

        let (dump, _) = broadcast::channel(4);
        Ok(Self {
            listeners,
            handle: ServerHandle {
                templates: Arc::new(ArcSwap::from_pointee(templates)),
                registry: Arc::new(registry),
                listeners: Arc::new(config.listeners.clone()),
                shutdown: Shutdown::new(),
                dump,
            },
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accept connections until shutdown, then close and drain them.
    pub async fn run(self) {
        let Server {
            listeners,
            handle,
            tracker,
        } = self;
        let mut shutdown = handle.shutdown.subscribe();

        let accept_tasks: Vec<_> = listeners
            .into_iter()
            .map(|listener| tokio::spawn(accept_loop(listener, handle.clone(), tracker.clone())))
            .collect();

        if !handle.shutdown.is_triggered() && shutdown.recv().await.is_err() {
            tracing::warn!("Shutdown channel closed unexpectedly");
        }
        tracing::info!(
            active_connections = tracker.active_count(),
            "Shutting down; closing pipelines"
        );

        for task in accept_tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop panicked");
            }
        }
        let remaining = tracker.wait_for_drain(DRAIN_DEADLINE).await;
        tracing::info!(remaining, "Server stopped");
    }
}

async fn accept_loop(listener: Listener, handle: ServerHandle, tracker: ConnectionTracker) {
    let mut shutdown = handle.shutdown.subscribe();
    let label: Arc<str> = match listener.local_addr() {
        Ok(addr) => Arc::from(addr.to_string()),
        Err(_) => listener.pipeline().clone(),
    };

    loop {
        if handle.shutdown.is_triggered() {
            break;
        }
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(listener = %label, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let Some(template) = handle.templates.load().get(listener.pipeline().as_ref()).cloned() else {
            tracing::error!(
                listener = %label,
                pipeline = %listener.pipeline(),
                "No template for listener; dropping connection"
            );
            continue;
        };

        let signals = ConnectionSignals {
            shutdown: handle.shutdown.subscribe(),
            dump: handle.dump.subscribe(),
        };
        if handle.shutdown.is_triggered() {
            break;
        }

        let guard = tracker.track();
        let options = ServeOptions {
            listener: label.clone(),
            max_egress_bytes: listener.max_egress_bytes(),
        };
        tokio::spawn(async move {
            let _permit = permit;
            net::serve(stream, peer, options, template, guard, signals).await;
        });
    }

    tracing::debug!(listener = %label, "Accept loop stopped");
}
