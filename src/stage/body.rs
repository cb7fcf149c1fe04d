//! Message-body aggregator.
//!
//! Collects every `Data` between `MessageStart` and `MessageEnd` into one
//! buffer and hands the complete body to a [`Transform`]. The head is
//! forwarded as soon as it arrives; the transformed body follows as one
//! `Data` plus `MessageEnd` once the transform resolves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;

use super::{Flow, Stage, StageContext, StageDump};
use crate::buffer::ByteBuffer;
use crate::event::{BufferLimits, Event, MessageHead, StreamError};
use crate::script::{Transform, TransformRequest};

pub struct HandleBody {
    transform_name: Arc<str>,
    transform: Arc<dyn Transform>,
    max_body_bytes: Option<usize>,
    limits: Option<BufferLimits>,

    head: Option<MessageHead>,
    body: ByteBuffer,
    skipping: bool,
    stats: Arc<BodyStats>,
}

/// Per-instance counters. Survive `reset` and are shared with the task
/// driving a deferred transform, which records its failures.
#[derive(Debug, Default)]
struct BodyStats {
    messages: AtomicU64,
    deferred: AtomicU64,
    failures: AtomicU64,
}

impl BodyStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl HandleBody {
    pub fn new(transform_name: impl Into<Arc<str>>, transform: Arc<dyn Transform>) -> Self {
        Self {
            transform_name: transform_name.into(),
            transform,
            max_body_bytes: None,
            limits: None,
            head: None,
            body: ByteBuffer::new(),
            skipping: false,
            stats: Arc::default(),
        }
    }

    /// Reject bodies larger than `limit` bytes as protocol violations.
    pub fn with_max_body_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Limits for events queued while this stage awaits its transform.
    pub fn with_buffer_limits(mut self, limits: Option<BufferLimits>) -> Self {
        self.limits = limits;
        self
    }

    fn discard_message(&mut self) {
        self.head = None;
        self.body.clear();
        self.skipping = false;
    }

    fn on_data(&mut self, data: ByteBuffer, cx: &mut StageContext<'_>) {
        if self.skipping {
            return;
        }
        if self.head.is_none() {
            cx.violation("data outside of a message");
            return;
        }
        self.body.append(data);

        if let Some(limit) = self.max_body_bytes {
            if self.body.size() > limit {
                cx.violation(format!("message body exceeds {limit} bytes"));
                self.discard_message();
                self.skipping = true;
            }
        }
    }

    fn on_message_end(&mut self, cx: &mut StageContext<'_>) -> Flow {
        if self.skipping {
            self.skipping = false;
            return Flow::Ready;
        }
        let Some(head) = self.head.take() else {
            cx.violation("message end without a message start");
            return Flow::Ready;
        };

        BodyStats::bump(&self.stats.messages);
        let request = TransformRequest {
            head,
            body: std::mem::take(&mut self.body),
            vars: cx.vars().clone(),
        };
        let mut pending = self.transform.invoke(request);

        match (&mut pending).now_or_never() {
            Some(Ok(body)) => {
                for event in completed(body) {
                    cx.emit(event);
                }
                Flow::Ready
            }
            Some(Err(error)) => {
                BodyStats::bump(&self.stats.failures);
                cx.emit(Event::Error(StreamError::async_failure(error.to_string())));
                Flow::Ready
            }
            None => {
                BodyStats::bump(&self.stats.deferred);
                let bridge = cx.suspend();
                let transform = self.transform_name.clone();
                let stats = self.stats.clone();
                cx.spawn(async move {
                    let settled = match pending.await {
                        Ok(body) => bridge.complete(completed(body)),
                        Err(error) => {
                            BodyStats::bump(&stats.failures);
                            bridge.fail(error)
                        }
                    };
                    if let Err(error) = settled {
                        tracing::debug!(%transform, error = %error, "Transform result discarded");
                    }
                });
                Flow::Pending
            }
        }
    }
}

/// Events forwarded for a transformed body.
fn completed(body: ByteBuffer) -> Vec<Event> {
    if body.is_empty() {
        vec![Event::MessageEnd]
    } else {
        vec![Event::Data(body), Event::MessageEnd]
    }
}

impl Stage for HandleBody {
    fn name(&self) -> &'static str {
        "handle-body"
    }

    fn clone_stage(&self) -> Box<dyn Stage> {
        Box::new(
            HandleBody::new(self.transform_name.clone(), self.transform.clone())
                .with_max_body_bytes(self.max_body_bytes)
                .with_buffer_limits(self.limits),
        )
    }

    fn reset(&mut self) {
        self.discard_message();
    }

    fn process(&mut self, event: Event, cx: &mut StageContext<'_>) -> Flow {
        match event {
            Event::MessageStart(head) => {
                if self.head.is_some() {
                    cx.violation("message start inside an open message");
                    self.discard_message();
                }
                self.skipping = false;
                self.head = Some(head.clone());
                cx.emit(Event::MessageStart(head));
                Flow::Ready
            }
            Event::Data(data) => {
                self.on_data(data, cx);
                Flow::Ready
            }
            Event::MessageEnd => self.on_message_end(cx),
            Event::StreamEnd(error) => {
                if self.head.is_some() {
                    cx.violation("stream ended inside an open message");
                }
                self.discard_message();
                cx.emit(Event::StreamEnd(error));
                Flow::Ready
            }
            Event::Error(error) => {
                self.discard_message();
                cx.emit(Event::Error(error));
                Flow::Ready
            }
        }
    }

    fn dump(&self, out: &mut StageDump) {
        out.counter("messages", self.stats.messages.load(Ordering::Relaxed));
        out.counter("deferred", self.stats.deferred.load(Ordering::Relaxed));
        out.counter("failures", self.stats.failures.load(Ordering::Relaxed));
        out.counter("body_bytes", self.body.size() as u64);
    }

    fn buffer_limits(&self) -> Option<BufferLimits> {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTemplate;
    use crate::script::{TransformError, TransformRegistry};
    use crate::stage::Tap;
    use std::sync::Mutex;

    fn template(transform: &str) -> PipelineTemplate {
        let registry = TransformRegistry::builtin();
        let transform_impl = registry.resolve(transform).unwrap();
        PipelineTemplate::new("body").with_stage(HandleBody::new(transform, transform_impl))
    }

    fn collect(template: &PipelineTemplate, input: Vec<Event>) -> Vec<Event> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let out = out.clone();
            move |e: Event| out.lock().unwrap().push(e)
        };
        let mut pipeline = template.instantiate(sink);
        for event in input {
            pipeline.feed(event).unwrap();
        }
        let events = out.lock().unwrap().clone();
        events
    }

    #[test]
    fn identity_reassembles_body() {
        let out = collect(
            &template("identity"),
            vec![
                Event::message_start(),
                Event::data("ab"),
                Event::data("c"),
                Event::MessageEnd,
                Event::stream_end(),
            ],
        );
        assert_eq!(
            out,
            vec![
                Event::message_start(),
                Event::data("abc"),
                Event::MessageEnd,
                Event::stream_end(),
            ]
        );
    }

    #[test]
    fn empty_body_emits_no_data() {
        let out = collect(
            &template("identity"),
            vec![Event::message_start(), Event::MessageEnd, Event::stream_end()],
        );
        assert_eq!(
            out,
            vec![Event::message_start(), Event::MessageEnd, Event::stream_end()]
        );
    }

    #[test]
    fn data_outside_message_is_violation() {
        let out = collect(
            &template("identity"),
            vec![Event::data("stray"), Event::stream_end()],
        );
        assert!(matches!(&out[0], Event::Error(e) if e.kind() == crate::event::ErrorKind::ProtocolViolation));
        assert_eq!(out[1], Event::stream_end());
    }

    #[test]
    fn restart_discards_stale_message() {
        let out = collect(
            &template("identity"),
            vec![
                Event::message_start(),
                Event::data("stale"),
                Event::message_start(),
                Event::data("fresh"),
                Event::MessageEnd,
            ],
        );
        assert_eq!(out.len(), 5);
        assert!(matches!(out[1], Event::Error(_)));
        assert_eq!(out[3], Event::data("fresh"));
    }

    #[test]
    fn oversized_body_is_dropped_until_message_end() {
        let registry = TransformRegistry::builtin();
        let template = PipelineTemplate::new("body").with_stage(
            HandleBody::new("identity", registry.resolve("identity").unwrap())
                .with_max_body_bytes(Some(4)),
        );
        let out = collect(
            &template,
            vec![
                Event::message_start(),
                Event::data("abc"),
                Event::data("defg"),
                Event::data("hij"),
                Event::MessageEnd,
                Event::message_start(),
                Event::data("ok"),
                Event::MessageEnd,
            ],
        );
        let errors = out.iter().filter(|e| matches!(e, Event::Error(_))).count();
        assert_eq!(errors, 1);
        assert_eq!(out.last(), Some(&Event::MessageEnd));
        assert!(out.contains(&Event::data("ok")));
    }

    #[test]
    fn immediate_failure_emits_async_failure() {
        let out = collect(
            &template("reject"),
            vec![Event::message_start(), Event::data("x"), Event::MessageEnd],
        );
        assert!(matches!(&out[1], Event::Error(e) if e.kind() == crate::event::ErrorKind::AsyncFailure));
    }

    #[test]
    fn transform_sees_connection_vars() {
        struct EchoVar;
        impl Transform for EchoVar {
            fn invoke(&self, request: TransformRequest) -> crate::script::TransformFuture {
                let peer = request.vars.get_str("peer").unwrap_or("none").to_string();
                futures_util::future::ready(Ok::<_, TransformError>(ByteBuffer::from(peer))).boxed()
            }
        }
        let template = PipelineTemplate::new("vars")
            .with_stage(Tap::new("before"))
            .with_stage(HandleBody::new("echo-var", Arc::new(EchoVar)));
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let out = out.clone();
            move |e: Event| out.lock().unwrap().push(e)
        };
        let mut pipeline = template.instantiate(sink);
        pipeline.context_mut().insert("peer", "10.0.0.1:9");
        pipeline.feed(Event::message_start()).unwrap();
        pipeline.feed(Event::MessageEnd).unwrap();
        assert_eq!(out.lock().unwrap()[1], Event::data("10.0.0.1:9"));
    }

    #[test]
    fn counters_survive_failed_transform() {
        let template = template("reject");
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let out = out.clone();
            move |e: Event| out.lock().unwrap().push(e)
        };
        let mut pipeline = template.instantiate(sink);
        for _ in 0..2 {
            pipeline.feed(Event::message_start()).unwrap();
            pipeline.feed(Event::MessageEnd).unwrap();
        }
        pipeline.close();

        let dump = pipeline.dump();
        let counters = &dump.stages[0].counters;
        assert_eq!(counters["messages"], 2);
        assert_eq!(counters["failures"], 2);
        assert_eq!(counters["body_bytes"], 0);
    }

    #[tokio::test]
    async fn deferred_failure_is_counted() {
        let mut registry = TransformRegistry::builtin();
        registry.register("late-reject", LateReject);
        let template = PipelineTemplate::new("body").with_stage(HandleBody::new(
            "late-reject",
            registry.resolve("late-reject").unwrap(),
        ));
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let out = out.clone();
            move |e: Event| out.lock().unwrap().push(e)
        };
        let mut pipeline = template.instantiate(sink);
        let wakeup = pipeline.wakeup();

        pipeline.feed(Event::message_start()).unwrap();
        pipeline.feed(Event::MessageEnd).unwrap();
        wakeup.notified().await;
        pipeline.run_completions().unwrap();

        assert!(matches!(&out.lock().unwrap()[1], Event::Error(e) if e.kind() == crate::event::ErrorKind::AsyncFailure));
        let dump = pipeline.dump();
        let counters = &dump.stages[0].counters;
        assert_eq!(counters["messages"], 1);
        assert_eq!(counters["deferred"], 1);
        assert_eq!(counters["failures"], 1);
    }

    /// Fails only after yielding once, so the stage has to suspend.
    struct LateReject;

    impl Transform for LateReject {
        fn invoke(&self, _request: TransformRequest) -> crate::script::TransformFuture {
            async {
                tokio::task::yield_now().await;
                Err(TransformError::Failed("too late".into()))
            }
            .boxed()
        }
    }
}
