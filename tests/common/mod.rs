//! Shared utilities for pipeline and server integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::oneshot;

use sluice::buffer::ByteBuffer;
use sluice::event::Event;
use sluice::pipeline::{Bridge, Pipeline};
use sluice::script::{Transform, TransformError, TransformFuture, TransformRequest};
use sluice::stage::{Flow, Stage, StageContext};

pub type Captured = Arc<Mutex<Vec<Event>>>;

/// A sink closure that records egress events, and the record.
pub fn capture() -> (impl FnMut(Event) + Send + 'static, Captured) {
    let captured: Captured = Arc::default();
    let sink = {
        let captured = captured.clone();
        move |event: Event| captured.lock().unwrap().push(event)
    };
    (sink, captured)
}

pub fn snapshot(captured: &Captured) -> Vec<Event> {
    captured.lock().unwrap().clone()
}

/// Wait for a bridge to settle, then apply it.
pub async fn settle(pipeline: &mut Pipeline) {
    let wakeup = pipeline.wakeup();
    tokio::time::timeout(Duration::from_secs(5), wakeup.notified())
        .await
        .expect("no completion within 5s");
    pipeline.run_completions().unwrap();
}

type Parked = oneshot::Sender<Result<ByteBuffer, TransformError>>;

/// Transform that parks every invocation until the test releases it.
#[derive(Clone, Default)]
pub struct Gate {
    parked: Arc<Mutex<VecDeque<(ByteBuffer, Parked)>>>,
}

impl Gate {
    pub fn waiting(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    /// Resolve the oldest invocation with its own body.
    pub fn release(&self) {
        let (body, tx) = self.parked.lock().unwrap().pop_front().expect("nothing parked");
        let _ = tx.send(Ok(body));
    }

    /// Fail the oldest invocation.
    pub fn reject(&self, reason: &str) {
        let (_, tx) = self.parked.lock().unwrap().pop_front().expect("nothing parked");
        let _ = tx.send(Err(TransformError::Failed(reason.to_string())));
    }
}

impl Transform for Gate {
    fn invoke(&self, request: TransformRequest) -> TransformFuture {
        let (tx, rx) = oneshot::channel();
        self.parked.lock().unwrap().push_back((request.body, tx));
        async move {
            rx.await
                .unwrap_or_else(|_| Err(TransformError::Failed("gate dropped".into())))
        }
        .boxed()
    }
}

/// Stage that suspends on every `Data` and hands its bridge to the test.
#[derive(Clone, Default)]
pub struct Parking {
    pub bridges: Arc<Mutex<Vec<Bridge>>>,
}

impl Parking {
    pub fn take(&self) -> Bridge {
        self.bridges.lock().unwrap().remove(0)
    }
}

impl Stage for Parking {
    fn name(&self) -> &'static str {
        "parking"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }

    fn reset(&mut self) {}

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        match event {
            Event::Data(_) => {
                let bridge = cx.suspend();
                self.bridges.lock().unwrap().push(bridge);
                Flow::Pending
            }
            other => {
                cx.emit(other);
                Flow::Ready
            }
        }
    }
}

/// Stage that suspends and immediately drops its bridge.
pub struct Abandoning;

impl Stage for Abandoning {
    fn name(&self) -> &'static str {
        "abandoning"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(Abandoning)
    }

    fn reset(&mut self) {}

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        if let Event::Data(_) = event {
            drop(cx.suspend());
            return Flow::Pending;
        }
        cx.emit(event);
        Flow::Ready
    }
}

/// Stage that claims to be pending without ever obtaining a bridge.
pub struct Stalling;

impl Stage for Stalling {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(Stalling)
    }

    fn reset(&mut self) {}

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        if let Event::Data(_) = event {
            return Flow::Pending;
        }
        cx.emit(event);
        Flow::Ready
    }
}
