//! Pipeline templates: a configured chain cloned once per connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::driver::Pipeline;
use super::sink::{EventSink, NoRuntime, Spawn, TokioSpawner};
use crate::event::BufferLimits;
use crate::stage::{Stage, StageDump};

/// Templates by pipeline name, as built from one configuration.
pub type TemplateSet = BTreeMap<String, Arc<PipelineTemplate>>;

/// What a pipeline does when a stage reports a protocol violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Forward the `Error` and keep the connection open.
    #[default]
    Continue,
    /// Close the connection with `StreamEnd(Some(error))`.
    Close,
}

/// Static description of a template, for `--dump`.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateDump {
    pub name: String,
    pub on_protocol_violation: ViolationPolicy,
    pub limits: BufferLimits,
    pub stages: Vec<StageDump>,
}

/// An ordered list of configured stage prototypes.
///
/// Never processes events itself; [`instantiate`](Self::instantiate) clones
/// every prototype into a fresh [`Pipeline`].
pub struct PipelineTemplate {
    name: Arc<str>,
    stages: Vec<Box<dyn Stage>>,
    limits: BufferLimits,
    policy: ViolationPolicy,
}

impl PipelineTemplate {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            limits: BufferLimits::UNBOUNDED,
            policy: ViolationPolicy::default(),
        }
    }

    /// Append a stage to the end of the chain.
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn push_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Default suspension buffer limits for every slot.
    pub fn with_limits(mut self, limits: BufferLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: ViolationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stages.iter().map(|s| s.name())
    }

    /// New pipeline driving deferred work on the current Tokio runtime.
    ///
    /// Outside a runtime, deferred work is abandoned and the suspension
    /// fails with `AsyncFailure`.
    pub fn instantiate(&self, sink: impl EventSink + 'static) -> Pipeline {
        let spawner: Arc<dyn Spawn> = match TokioSpawner::try_current() {
            Some(spawner) => Arc::new(spawner),
            None => Arc::new(NoRuntime),
        };
        self.instantiate_with(sink, spawner)
    }

    pub fn instantiate_with(&self, sink: impl EventSink + 'static, spawner: Arc<dyn Spawn>) -> Pipeline {
        Pipeline::new(
            self.name.clone(),
            self.stages.iter().map(|s| s.clone_stage()).collect(),
            self.limits,
            self.policy,
            Box::new(sink),
            spawner,
        )
    }

    pub fn dump(&self) -> TemplateDump {
        TemplateDump {
            name: self.name.to_string(),
            on_protocol_violation: self.policy,
            limits: self.limits,
            stages: self
                .stages
                .iter()
                .enumerate()
                .map(|(index, stage)| {
                    let mut out = StageDump {
                        index,
                        name: stage.name().to_string(),
                        ..StageDump::default()
                    };
                    stage.dump(&mut out);
                    out
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for PipelineTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineTemplate")
            .field("name", &self.name)
            .field("stages", &self.stage_names().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::stage::{JoinLines, SplitLines};

    #[test]
    fn instances_do_not_share_state() {
        let template = PipelineTemplate::new("lines")
            .with_stage(SplitLines::new(None))
            .with_stage(JoinLines::new());

        let mut a = template.instantiate(|_e: Event| {});
        let b = template.instantiate(|_e: Event| {});
        a.feed(Event::data("half")).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.dump().stages[0].counters["partial_bytes"], 4);
        assert_eq!(b.dump().stages[0].counters["partial_bytes"], 0);
    }

    #[test]
    fn dump_lists_stages_in_order() {
        let dump = PipelineTemplate::new("lines")
            .with_stage(SplitLines::new(None))
            .with_stage(JoinLines::new())
            .with_policy(ViolationPolicy::Close)
            .dump();
        let names: Vec<_> = dump.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["split-lines", "join-lines"]);
        assert_eq!(dump.on_protocol_violation, ViolationPolicy::Close);
    }
}
