//! Builds stages and pipeline templates from configuration.

use std::sync::Arc;

use thiserror::Error;

use super::{Count, HandleBody, JoinLines, SharedCounter, SplitLines, Stage, Tap};
use crate::config::{PipelineConfig, SluiceConfig, StageConfig};
use crate::pipeline::{PipelineTemplate, TemplateSet};
use crate::script::TransformRegistry;

/// Stage kinds the configuration may name.
pub const STAGE_KINDS: [&str; 5] = ["handle-body", "split-lines", "join-lines", "tap", "count"];

/// A configured chain that cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("pipeline '{pipeline}' stage {index}: unknown stage kind '{kind}'")]
    UnknownKind {
        pipeline: String,
        index: usize,
        kind: String,
    },

    #[error("pipeline '{pipeline}' stage {index}: {kind} requires a transform")]
    MissingTransform {
        pipeline: String,
        index: usize,
        kind: String,
    },

    #[error("pipeline '{pipeline}' stage {index}: unknown transform '{name}'")]
    UnknownTransform {
        pipeline: String,
        index: usize,
        name: String,
    },
}

/// Build one stage prototype.
pub fn build_stage(
    pipeline: &str,
    index: usize,
    config: &StageConfig,
    registry: &TransformRegistry,
) -> Result<Box<dyn Stage>, BuildError> {
    let stage: Box<dyn Stage> = match config.kind.as_str() {
        "handle-body" => {
            let name = config
                .transform
                .as_deref()
                .ok_or_else(|| BuildError::MissingTransform {
                    pipeline: pipeline.to_string(),
                    index,
                    kind: config.kind.clone(),
                })?;
            let transform = registry
                .resolve(name)
                .ok_or_else(|| BuildError::UnknownTransform {
                    pipeline: pipeline.to_string(),
                    index,
                    name: name.to_string(),
                })?;
            Box::new(
                HandleBody::new(name, transform)
                    .with_max_body_bytes(config.max_body_bytes)
                    .with_buffer_limits(config.limits()),
            )
        }
        "split-lines" => Box::new(SplitLines::new(config.max_line_bytes)),
        "join-lines" => Box::new(JoinLines::new()),
        "tap" => Box::new(Tap::new(
            config.label.clone().unwrap_or_else(|| format!("{pipeline}[{index}]")),
        )),
        "count" => {
            let name = config.counter.as_deref().unwrap_or(pipeline);
            Box::new(Count::new(SharedCounter::named(name)))
        }
        other => {
            return Err(BuildError::UnknownKind {
                pipeline: pipeline.to_string(),
                index,
                kind: other.to_string(),
            })
        }
    };
    Ok(stage)
}

/// Build the template for one configured pipeline.
pub fn build_template(
    name: &str,
    config: &PipelineConfig,
    registry: &TransformRegistry,
) -> Result<PipelineTemplate, BuildError> {
    let mut template = PipelineTemplate::new(name)
        .with_limits(config.limits())
        .with_policy(config.on_protocol_violation);
    for (index, stage) in config.stages.iter().enumerate() {
        template.push_stage(build_stage(name, index, stage, registry)?);
    }
    Ok(template)
}

/// Build every configured pipeline.
pub fn build_templates(
    config: &SluiceConfig,
    registry: &TransformRegistry,
) -> Result<TemplateSet, BuildError> {
    config
        .pipelines
        .iter()
        .map(|(name, pipeline)| {
            let template = build_template(name, pipeline, registry)?;
            tracing::debug!(
                pipeline = %name,
                stages = ?template.stage_names().collect::<Vec<_>>(),
                "Pipeline template built"
            );
            Ok((name.clone(), Arc::new(template)))
        })
        .collect()
}
