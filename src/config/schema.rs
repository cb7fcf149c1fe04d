//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_CHUNK_SIZE;
use crate::event::BufferLimits;
use crate::pipeline::ViolationPolicy;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SluiceConfig {
    /// Instance identity.
    pub instance: InstanceConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Byte storage settings.
    pub buffer: BufferConfig,

    /// TCP listeners, each bound to one pipeline.
    pub listeners: Vec<ListenerConfig>,

    /// Pipeline definitions by name.
    pub pipelines: BTreeMap<String, PipelineConfig>,
}

/// Instance identity.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct InstanceConfig {
    /// Human-readable name; a v4 UUID is generated per process regardless.
    pub name: Option<String>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Egress bytes a connection may queue for its peer before the socket
    /// stops being read.
    pub max_egress_bytes: usize,

    /// Name of the pipeline every connection runs.
    pub pipeline: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_egress_bytes: 1024 * 1024,
            pipeline: String::new(),
        }
    }
}

/// One pipeline: an ordered list of stages plus flow-control policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Events a suspended stage may queue before the connection is closed.
    pub max_buffered_events: Option<usize>,

    /// Data bytes a suspended stage may queue before the connection is closed.
    pub max_buffered_bytes: Option<usize>,

    /// Reaction to a stage reporting a malformed event sequence.
    pub on_protocol_violation: ViolationPolicy,

    /// Stages in processing order.
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: Some(1024),
            max_buffered_bytes: Some(1024 * 1024),
            on_protocol_violation: ViolationPolicy::Continue,
            stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn limits(&self) -> BufferLimits {
        BufferLimits::new(self.max_buffered_events, self.max_buffered_bytes)
    }
}

/// One stage of a pipeline.
///
/// Which optional fields apply depends on `kind`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StageConfig {
    /// `handle-body`, `split-lines`, `join-lines`, `tap` or `count`.
    pub kind: String,

    /// Transform name (handle-body).
    pub transform: Option<String>,

    /// Log label (tap).
    pub label: Option<String>,

    /// Shared counter name (count).
    pub counter: Option<String>,

    /// Largest accepted message body (handle-body).
    pub max_body_bytes: Option<usize>,

    /// Largest accepted line (split-lines).
    pub max_line_bytes: Option<usize>,

    /// Per-stage override of the pipeline's event limit.
    pub max_buffered_events: Option<usize>,

    /// Per-stage override of the pipeline's byte limit.
    pub max_buffered_bytes: Option<usize>,
}

impl StageConfig {
    /// Per-stage buffer override, if any dimension is set.
    pub fn limits(&self) -> Option<BufferLimits> {
        if self.max_buffered_events.is_none() && self.max_buffered_bytes.is_none() {
            return None;
        }
        Some(BufferLimits::new(
            self.max_buffered_events,
            self.max_buffered_bytes,
        ))
    }
}

/// Byte storage settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of pooled chunks used for socket reads and copies.
    pub chunk_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
