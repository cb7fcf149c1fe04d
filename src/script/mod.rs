//! User transforms invoked by body-handling stages.
//!
//! # Responsibilities
//! - Define the [`Transform`] invocation interface: head + body + connection
//!   vars in, a possibly-pending body out
//! - Keep a name → transform registry that stage configuration refers to
//!
//! # Design Decisions
//! - Every invocation returns a boxed future; an immediately-available result
//!   is a future that is ready on first poll, so callers never need a runtime
//!   for synchronous transforms
//! - Transforms receive a snapshot of the connection vars, not a live borrow,
//!   because their futures may outlive the `process` call

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use thiserror::Error;

use crate::buffer::ByteBuffer;
use crate::event::MessageHead;
use crate::pipeline::ContextMap;

/// Future returned by [`Transform::invoke`].
pub type TransformFuture = BoxFuture<'static, Result<ByteBuffer, TransformError>>;

/// Failure reported by a transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("transform rejected the message: {0}")]
    Rejected(String),

    #[error("transform failed: {0}")]
    Failed(String),
}

/// One complete message handed to a transform.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub head: MessageHead,
    pub body: ByteBuffer,
    pub vars: ContextMap,
}

/// A user-supplied message transform.
pub trait Transform: Send + Sync {
    fn invoke(&self, request: TransformRequest) -> TransformFuture;
}

/// Named transforms available to stage configuration.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: BTreeMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in transforms.
    ///
    /// `delay:<ms>` is resolved on lookup rather than registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("identity", Identity);
        registry.register("uppercase", MapBytes(<[u8]>::to_ascii_uppercase));
        registry.register("lowercase", MapBytes(<[u8]>::to_ascii_lowercase));
        registry.register("reverse", MapBytes(reversed));
        registry.register("reject", Reject);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, transform: impl Transform + 'static) {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Transform>> {
        if let Some(found) = self.transforms.get(name) {
            return Some(found.clone());
        }
        let millis = name.strip_prefix("delay:")?.parse::<u64>().ok()?;
        Some(Arc::new(Delay(Duration::from_millis(millis))))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.transforms.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

struct Identity;

impl Transform for Identity {
    fn invoke(&self, request: TransformRequest) -> TransformFuture {
        future::ready(Ok(request.body)).boxed()
    }
}

struct MapBytes(fn(&[u8]) -> Vec<u8>);

impl Transform for MapBytes {
    fn invoke(&self, request: TransformRequest) -> TransformFuture {
        let mapped = (self.0)(&request.body.to_contiguous());
        future::ready(Ok(ByteBuffer::from(mapped))).boxed()
    }
}

fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

struct Delay(Duration);

impl Transform for Delay {
    fn invoke(&self, request: TransformRequest) -> TransformFuture {
        // Tokio's timer panics outside a runtime; the first poll may run inline.
        if tokio::runtime::Handle::try_current().is_err() {
            let reason = format!("delay of {:?} needs an async runtime", self.0);
            return future::ready(Err(TransformError::Failed(reason))).boxed();
        }
        let delay = self.0;
        async move {
            tokio::time::sleep(delay).await;
            Ok(request.body)
        }
        .boxed()
    }
}

struct Reject;

impl Transform for Reject {
    fn invoke(&self, request: TransformRequest) -> TransformFuture {
        let reason = format!("{} byte body refused", request.body.size());
        future::ready(Err(TransformError::Rejected(reason))).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> TransformRequest {
        TransformRequest {
            head: MessageHead::new(),
            body: ByteBuffer::from(body),
            vars: ContextMap::new(),
        }
    }

    fn run(registry: &TransformRegistry, name: &str, body: &str) -> Result<ByteBuffer, TransformError> {
        registry
            .resolve(name)
            .unwrap()
            .invoke(request(body))
            .now_or_never()
            .unwrap()
    }

    #[test]
    fn builtin_transforms_are_immediate() {
        let registry = TransformRegistry::builtin();
        assert_eq!(run(&registry, "identity", "abc").unwrap(), ByteBuffer::from("abc"));
        assert_eq!(run(&registry, "uppercase", "abc").unwrap(), ByteBuffer::from("ABC"));
        assert_eq!(run(&registry, "lowercase", "AbC").unwrap(), ByteBuffer::from("abc"));
        assert_eq!(run(&registry, "reverse", "abc").unwrap(), ByteBuffer::from("cba"));
        assert!(matches!(
            run(&registry, "reject", "abc"),
            Err(TransformError::Rejected(_))
        ));
    }

    #[test]
    fn delay_is_resolved_by_pattern() {
        let registry = TransformRegistry::builtin();
        assert!(registry.resolve("delay:25").is_some());
        assert!(registry.resolve("delay:soon").is_none());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn delay_without_runtime_fails_immediately() {
        let registry = TransformRegistry::builtin();
        assert!(matches!(
            run(&registry, "delay:5", "late"),
            Err(TransformError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn delay_resolves_after_sleep() {
        let registry = TransformRegistry::builtin();
        let out = registry
            .resolve("delay:5")
            .unwrap()
            .invoke(request("late"))
            .await
            .unwrap();
        assert_eq!(out, ByteBuffer::from("late"));
    }
}
