use crate::dispatch::CallPayload;
use crate::registry::NodeTarget;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;
use serde_json::Value;

pub type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, AnyError>> + Send + 'a>>;
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AnyError>> + Send + 'a>>;

/// Capability that actually talks to a node. Supplied by the protocol-specific
/// client layer; the balancer never looks inside payloads or results.
pub trait CallExecutor: Send + Sync + 'static {
    /// Performs `payload` against `node`. Runs on a worker task and may be
    /// dropped mid-flight when the call's deadline elapses.
    fn execute<'a>(&'a self, node: &'a NodeTarget, payload: &'a CallPayload)
        -> ExecuteFuture<'a>;

    /// Lightweight health check used to bring offline nodes back.
    ///
    /// `None` means the executor has no way to check a node. Such nodes are
    /// brought up only while they have no failure on record; a node taken
    /// offline stays there until [`crate::Balancer::mark_online`].
    fn probe<'a>(&'a self, _node: &'a NodeTarget) -> Option<ProbeFuture<'a>> {
        None
    }
}

/// Adapts an async closure into a [`CallExecutor`] without a health check.
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> CallExecutor for FnExecutor<F>
where
    F: Fn(NodeTarget, CallPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AnyError>> + Send + 'static,
{
    fn execute<'a>(
        &'a self,
        node: &'a NodeTarget,
        payload: &'a CallPayload,
    ) -> ExecuteFuture<'a> {
        Box::pin((self.func)(node.clone(), payload.clone()))
    }
}
