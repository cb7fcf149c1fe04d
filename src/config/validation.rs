//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (listeners reference existing pipelines)
//! - Validate value ranges (limits > 0, chunk size bounds, addresses parse)
//! - Detect conflicting listeners
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: SluiceConfig → Result<(), Vec<ValidationError>>
//! - Stage kinds and transform names are checked when templates are built

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::SluiceConfig;

const MIN_CHUNK_SIZE: usize = 512;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check `config` for semantic errors.
pub fn validate_config(config: &SluiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_listeners(config, &mut errors);
    validate_pipelines(config, &mut errors);

    let chunk_size = config.buffer.chunk_size;
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        errors.push(ValidationError::new(
            "buffer.chunk_size",
            format!("{chunk_size} is outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]"),
        ));
    }

    let obs = &config.observability;
    if !LOG_LEVELS.contains(&obs.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", obs.log_level),
        ));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listeners(config: &SluiceConfig, errors: &mut Vec<ValidationError>) {
    if config.listeners.is_empty() {
        errors.push(ValidationError::new("listeners", "at least one listener is required"));
    }

    let mut seen = HashSet::new();
    for (i, listener) in config.listeners.iter().enumerate() {
        let field = |name: &str| format!("listeners[{i}].{name}");

        match listener.bind_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if !seen.insert(addr) {
                    errors.push(ValidationError::new(
                        field("bind_address"),
                        format!("{addr} is bound by another listener"),
                    ));
                }
            }
            Err(_) => errors.push(ValidationError::new(
                field("bind_address"),
                format!("'{}' is not a socket address", listener.bind_address),
            )),
        }

        if listener.max_connections == 0 {
            errors.push(ValidationError::new(field("max_connections"), "must be > 0"));
        }
        if listener.max_egress_bytes == 0 {
            errors.push(ValidationError::new(field("max_egress_bytes"), "must be > 0"));
        }

        if !config.pipelines.contains_key(&listener.pipeline) {
            errors.push(ValidationError::new(
                field("pipeline"),
                format!("undefined pipeline '{}'", listener.pipeline),
            ));
        }
    }
}

fn validate_pipelines(config: &SluiceConfig, errors: &mut Vec<ValidationError>) {
    for (name, pipeline) in &config.pipelines {
        let base = format!("pipelines.{name}");

        if pipeline.stages.is_empty() {
            errors.push(ValidationError::new(
                format!("{base}.stages"),
                "at least one stage is required",
            ));
        }
        check_positive(&base, "max_buffered_events", pipeline.max_buffered_events, errors);
        check_positive(&base, "max_buffered_bytes", pipeline.max_buffered_bytes, errors);

        for (i, stage) in pipeline.stages.iter().enumerate() {
            let stage_base = format!("{base}.stages[{i}]");
            if stage.kind.trim().is_empty() {
                errors.push(ValidationError::new(format!("{stage_base}.kind"), "must be set"));
            }
            check_positive(&stage_base, "max_body_bytes", stage.max_body_bytes, errors);
            check_positive(&stage_base, "max_line_bytes", stage.max_line_bytes, errors);
            check_positive(&stage_base, "max_buffered_events", stage.max_buffered_events, errors);
            check_positive(&stage_base, "max_buffered_bytes", stage.max_buffered_bytes, errors);
        }
    }
}

fn check_positive(base: &str, name: &str, value: Option<usize>, errors: &mut Vec<ValidationError>) {
    if value == Some(0) {
        errors.push(ValidationError::new(format!("{base}.{name}"), "must be > 0"));
    }
}
