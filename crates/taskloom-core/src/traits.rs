use std::future::Future;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::Payload;

/// Task processor: an external collaborator selected by agent type.
///
/// The scheduler and the session graph nodes invoke processors opaquely:
/// a payload goes in, a result payload (or an error) comes out.
pub trait TaskProcessor: Send + Sync + 'static {
    /// Execute one unit of work.
    fn execute(&self, payload: Payload) -> BoxFuture<'_, Result<Payload>>;
}

/// Adapts an async closure into a [`TaskProcessor`].
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    fn execute(&self, payload: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin((self.f)(payload))
    }
}
