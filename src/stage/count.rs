//! Message counter shared by every connection using the same name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::{Flow, Stage, StageContext, StageDump};
use crate::event::Event;
use crate::observability::metrics;

static COUNTERS: OnceLock<DashMap<String, SharedCounter>> = OnceLock::new();

/// A process-wide named counter.
///
/// Handles with the same name share one value, including across template
/// rebuilds on reload.
#[derive(Debug, Clone)]
pub struct SharedCounter {
    name: Arc<str>,
    value: Arc<AtomicU64>,
}

impl SharedCounter {
    /// Handle to the counter called `name`, creating it on first use.
    pub fn named(name: &str) -> Self {
        COUNTERS
            .get_or_init(DashMap::new)
            .entry(name.to_string())
            .or_insert_with(|| SharedCounter {
                name: Arc::from(name),
                value: Arc::new(AtomicU64::new(0)),
            })
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Counts completed messages into a [`SharedCounter`]; passes every event
/// through unchanged.
pub struct Count {
    counter: SharedCounter,
    seen: u64,
}

impl Count {
    pub fn new(counter: SharedCounter) -> Self {
        Self { counter, seen: 0 }
    }
}

impl Stage for Count {
    fn name(&self) -> &'static str {
        "count"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(Count::new(self.counter.clone()))
    }

    fn reset(&mut self) {
        self.seen = 0;
    }

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        if matches!(event, Event::MessageEnd) {
            self.seen += 1;
            self.counter.increment();
            metrics::record_stage_message(self.counter.name());
        }
        cx.emit(event);
        Flow::Ready
    }

    fn dump(&self, out: &mut StageDump) {
        out.counter("seen", self.seen);
        out.counter("total", self.counter.get());
    }
}
