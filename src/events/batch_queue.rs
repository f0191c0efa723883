use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::task::JoinHandle;

use crate::{
    events::{EventQueue, EventSink},
    Error, Result,
};

type Compatibility<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type DeliveryErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Configuration for [`BatchQueue`].
#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Maximum number of events in a batch. A full batch is flushed immediately.
    ///
    /// Zero is treated as one. Defaults to [`BatchQueueConfig::DEFAULT_MAX_SIZE`].
    pub max_size: usize,
    /// Maximum time the first event of a batch waits before the batch is flushed.
    ///
    /// Defaults to [`BatchQueueConfig::DEFAULT_FLUSH_INTERVAL`].
    pub flush_interval: Duration,
}

impl BatchQueueConfig {
    /// Default value for [`BatchQueueConfig::max_size`].
    pub const DEFAULT_MAX_SIZE: usize = 100;
    /// Default value for [`BatchQueueConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

    /// Create a new `BatchQueueConfig` using default configuration.
    pub fn new() -> BatchQueueConfig {
        BatchQueueConfig::default()
    }

    /// Update maximum batch size with `max_size`.
    pub fn with_max_size(mut self, max_size: usize) -> BatchQueueConfig {
        self.max_size = max_size;
        self
    }

    /// Update flush interval with `flush_interval`.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> BatchQueueConfig {
        self.flush_interval = flush_interval;
        self
    }
}

impl Default for BatchQueueConfig {
    fn default() -> BatchQueueConfig {
        BatchQueueConfig {
            max_size: BatchQueueConfig::DEFAULT_MAX_SIZE,
            flush_interval: BatchQueueConfig::DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Hands batches to a sink in background.
struct Delivery<T> {
    sink: Arc<dyn EventSink<T>>,
    on_error: Option<DeliveryErrorHook>,
}

impl<T> Clone for Delivery<T> {
    fn clone(&self) -> Self {
        Delivery {
            sink: Arc::clone(&self.sink),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T: Send + 'static> Delivery<T> {
    /// Call the sink and spawn the returned future. Empty batches are skipped.
    fn deliver(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }

        log::debug!(target: "decision_core", size = batch.len(); "delivering event batch");
        let delivery = self.sink.send(batch);
        let on_error = self.on_error.clone();
        tokio::spawn(async move {
            if let Err(err) = delivery.await {
                log::warn!(target: "decision_core", "failed to deliver event batch: {err}");
                if let Some(on_error) = on_error {
                    on_error(&err);
                }
            }
        });
    }
}

/// An [`EventQueue`] that delivers every event in its own batch, as soon as it is enqueued.
pub struct PassThroughQueue<T> {
    delivery: Delivery<T>,
}

impl<T: Send + 'static> PassThroughQueue<T> {
    pub fn new(sink: impl EventSink<T>) -> PassThroughQueue<T> {
        PassThroughQueue {
            delivery: Delivery {
                sink: Arc::new(sink),
                on_error: None,
            },
        }
    }

    /// Observe failures of background deliveries.
    pub fn with_delivery_error_hook(
        mut self,
        hook: impl Fn(&Error) + Send + Sync + 'static,
    ) -> PassThroughQueue<T> {
        self.delivery.on_error = Some(Arc::new(hook));
        self
    }
}

impl<T: Send + 'static> EventQueue<T> for PassThroughQueue<T> {
    fn enqueue(&self, event: T) {
        self.delivery.deliver(vec![event]);
    }

    fn start(&self) {}

    fn stop(&self) -> BoxFuture<'static, Result<()>> {
        async { Ok(()) }.boxed()
    }
}

struct BatchState<T> {
    buffer: Vec<T>,
    started: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush, so a timer armed for an earlier batch doesn't flush a later one.
    generation: u64,
}

impl<T> BatchState<T> {
    /// Take the current batch and disarm the timer.
    fn take_batch(&mut self) -> Vec<T> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        std::mem::take(&mut self.buffer)
    }
}

/// An [`EventQueue`] that groups events into batches.
///
/// A batch is flushed to the sink when any of the following happens:
/// - it reaches [`max_size`](BatchQueueConfig::max_size),
/// - [`flush_interval`](BatchQueueConfig::flush_interval) elapses since its first event was
///   enqueued,
/// - an event arrives that is not compatible with the first event of the batch (the new event then
///   starts the next batch),
/// - the queue is stopped.
///
/// Delivery runs in background and its failures are not retried. They are logged and passed to
/// the [delivery error hook](BatchQueue::with_delivery_error_hook) if one is set.
///
/// Events enqueued before [`start()`](EventQueue::start) or after [`stop()`](EventQueue::stop) are
/// dropped.
///
/// The queue spawns tasks, so it must be used from within a Tokio runtime.
pub struct BatchQueue<T> {
    max_size: usize,
    flush_interval: Duration,
    delivery: Delivery<T>,
    closing_sink: Option<Arc<dyn EventSink<T>>>,
    compatible: Compatibility<T>,
    state: Arc<Mutex<BatchState<T>>>,
}

impl<T: Send + 'static> BatchQueue<T> {
    pub fn new(sink: impl EventSink<T>, config: BatchQueueConfig) -> BatchQueue<T> {
        BatchQueue {
            max_size: config.max_size.max(1),
            flush_interval: config.flush_interval,
            delivery: Delivery {
                sink: Arc::new(sink),
                on_error: None,
            },
            closing_sink: None,
            compatible: Arc::new(|_: &T, _: &T| true),
            state: Arc::new(Mutex::new(BatchState {
                buffer: Vec::new(),
                started: false,
                timer: None,
                generation: 0,
            })),
        }
    }

    /// Deliver the final batch on [`stop()`](EventQueue::stop) to `sink` instead of the regular
    /// sink.
    pub fn with_closing_sink(mut self, sink: impl EventSink<T>) -> BatchQueue<T> {
        self.closing_sink = Some(Arc::new(sink));
        self
    }

    /// Only batch together events that are compatible with the first event of the batch.
    pub fn with_compatibility(
        mut self,
        compatible: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> BatchQueue<T> {
        self.compatible = Arc::new(compatible);
        self
    }

    /// Observe failures of background deliveries.
    pub fn with_delivery_error_hook(
        mut self,
        hook: impl Fn(&Error) + Send + Sync + 'static,
    ) -> BatchQueue<T> {
        self.delivery.on_error = Some(Arc::new(hook));
        self
    }

    /// Deliver the current batch now. Does nothing if the batch is empty.
    pub fn flush(&self) {
        let batch = self.state().take_batch();
        self.delivery.deliver(batch);
    }

    /// Number of events waiting in the current batch.
    pub fn len(&self) -> usize {
        self.state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<BatchState<T>> {
        self.state.lock().expect("thread holding batch queue lock should not panic")
    }

    fn arm_timer(&self, state: &mut BatchState<T>) {
        let generation = state.generation;
        let weak_state = Arc::downgrade(&self.state);
        let delivery = self.delivery.clone();
        let flush_interval = self.flush_interval;

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(flush_interval).await;
            flush_on_timer(weak_state, generation, delivery);
        }));
    }
}

fn flush_on_timer<T: Send + 'static>(
    state: Weak<Mutex<BatchState<T>>>,
    generation: u64,
    delivery: Delivery<T>,
) {
    // Queue dropped.
    let Some(state) = state.upgrade() else {
        return;
    };

    let batch = {
        let mut state = state
            .lock()
            .expect("thread holding batch queue lock should not panic");
        if state.generation != generation {
            return;
        }
        // This is the timer task itself.
        drop(state.timer.take());
        state.take_batch()
    };

    log::debug!(target: "decision_core", "flush interval elapsed");
    delivery.deliver(batch);
}

impl<T: Send + 'static> EventQueue<T> for BatchQueue<T> {
    fn enqueue(&self, event: T) {
        let (previous, full) = {
            let mut state = self.state();
            if !state.started {
                log::debug!(target: "decision_core", "event queue is not started, dropping event");
                return;
            }

            let incompatible = state
                .buffer
                .first()
                .is_some_and(|first| !(self.compatible)(first, &event));
            let previous = if incompatible {
                state.take_batch()
            } else {
                Vec::new()
            };

            state.buffer.push(event);

            let full = if state.buffer.len() >= self.max_size {
                state.take_batch()
            } else {
                if state.buffer.len() == 1 {
                    self.arm_timer(&mut state);
                }
                Vec::new()
            };
            (previous, full)
        };

        // Sinks are called synchronously and may enqueue, so the lock is released first.
        self.delivery.deliver(previous);
        self.delivery.deliver(full);
    }

    fn start(&self) {
        self.state().started = true;
    }

    fn stop(&self) -> BoxFuture<'static, Result<()>> {
        let batch = {
            let mut state = self.state();
            state.started = false;
            state.take_batch()
        };

        if batch.is_empty() {
            return async { Ok(()) }.boxed();
        }

        log::debug!(target: "decision_core", size = batch.len(); "delivering final event batch");
        self.closing_sink
            .as_ref()
            .unwrap_or(&self.delivery.sink)
            .send(batch)
    }
}

impl<T> Drop for BatchQueue<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}
