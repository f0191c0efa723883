//! Outbound event queues.
//!
//! Events are handed to an [`EventQueue`] which groups them into batches and delivers each batch
//! to an [`EventSink`]. See [`BatchQueue`] for the batching rules and [`PassThroughQueue`] for a
//! queue that delivers every event on its own.
use futures::future::BoxFuture;

use crate::Result;

mod batch_queue;

pub use batch_queue::{BatchQueue, BatchQueueConfig, PassThroughQueue};

/// Destination of event batches, e.g., a telemetry endpoint.
///
/// A sink is called with non-empty batches only.
///
/// # Examples
///
/// Closures returning a boxed future are sinks:
/// ```
/// # use decision_core::{events::EventSink, Error};
/// use futures::FutureExt;
///
/// let sink = |batch: Vec<String>| {
///     async move {
///         println!("sending {} events", batch.len());
///         Ok::<(), Error>(())
///     }
///     .boxed()
/// };
/// # fn assert_sink(_: &impl EventSink<String>) {}
/// # assert_sink(&sink);
/// ```
pub trait EventSink<T>: Send + Sync + 'static {
    fn send(&self, batch: Vec<T>) -> BoxFuture<'static, Result<()>>;
}

impl<T, F> EventSink<T> for F
where
    F: Fn(Vec<T>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
{
    fn send(&self, batch: Vec<T>) -> BoxFuture<'static, Result<()>> {
        self(batch)
    }
}

/// A queue accepting events for delivery.
pub trait EventQueue<T> {
    /// Submit an event. Never blocks and never fails; delivery happens in background.
    fn enqueue(&self, event: T);

    /// Start accepting events.
    fn start(&self);

    /// Stop accepting events and deliver whatever is still queued.
    ///
    /// The returned future resolves with the result of the final delivery.
    fn stop(&self) -> BoxFuture<'static, Result<()>>;
}
