//! Pass-through stage that logs every event.

use std::sync::Arc;

use super::{Flow, Stage, StageContext, StageDump};
use crate::event::Event;

pub struct Tap {
    label: Arc<str>,
    events: u64,
    bytes: u64,
}

impl Tap {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            events: 0,
            bytes: 0,
        }
    }
}

impl Stage for Tap {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(Tap::new(self.label.clone()))
    }

    fn reset(&mut self) {
        self.events = 0;
        self.bytes = 0;
    }

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        self.events += 1;
        self.bytes += event.data_len() as u64;
        tracing::debug!(
            pipeline_id = cx.pipeline_id(),
            index = cx.index(),
            label = %self.label,
            event = event.kind_name(),
            bytes = event.data_len(),
            "Tap"
        );
        cx.emit(event);
        Flow::Ready
    }

    fn dump(&self, out: &mut StageDump) {
        out.counter("events", self.events);
        out.counter("bytes", self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::pipeline::PipelineTemplate;

    #[test]
    fn passes_events_through_and_counts_bytes() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let out = out.clone();
            move |e: Event| out.lock().unwrap().push(e)
        };
        let mut p = PipelineTemplate::new("t").with_stage(Tap::new("probe")).instantiate(sink);

        p.feed(Event::message_start()).unwrap();
        p.feed(Event::data("abc")).unwrap();
        p.feed(Event::MessageEnd).unwrap();

        assert_eq!(
            *out.lock().unwrap(),
            vec![Event::message_start(), Event::data("abc"), Event::MessageEnd]
        );
        let dump = p.dump();
        assert_eq!(dump.stages[0].counters["events"], 3);
        assert_eq!(dump.stages[0].counters["bytes"], 3);
    }
}
