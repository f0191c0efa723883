//! A background poller task that periodically refreshes a set of keys in a [`ReadThroughCache`].
use std::{hash::Hash, panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use rand::{thread_rng, Rng};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    cache::{ReadThroughCache, RefreshDirective, RefreshStrategy},
    Error, Result,
};

/// Configuration for [`Poller`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval to wait between refreshes.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between refreshes. This helps to avoid
    /// multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerConfig {
    /// Default value for [`PollerConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollerConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    /// Create a new `PollerConfig` using default configuration.
    pub fn new() -> PollerConfig {
        PollerConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A cache poller.
///
/// The poller refreshes every key it was started with, waits for
/// [`interval`](PollerConfig::interval) minus a random jitter, and repeats. A refresh failure is
/// retried on the next round unless it's unrecoverable ([`Error::Unauthorized`] or
/// [`Error::InvalidBaseUrl`]), in which case the poller stops.
///
/// Dropping the poller stops the task as well.
pub struct Poller {
    join_handle: JoinHandle<()>,

    /// Used to send a stop command to the poller task.
    stop_sender: watch::Sender<bool>,

    /// Holds `None` until the first round of refreshes succeeds or the poller stops on an error.
    result: watch::Receiver<Option<Result<()>>>,
}

impl Poller {
    /// Start polling `keys` of `cache` in a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<K, V, S>(
        cache: ReadThroughCache<K, V, S>,
        keys: Vec<K>,
        config: PollerConfig,
    ) -> Poller
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        S: RefreshStrategy<K, V>,
    {
        let (stop_sender, stop_receiver) = watch::channel(false);
        let (result_sender, result) = watch::channel(None);

        let join_handle = tokio::spawn(async move {
            let outcome =
                AssertUnwindSafe(poll(cache, keys, config, stop_receiver, &result_sender))
                    .catch_unwind()
                    .await;

            // If catch_unwind returns Err, it means a panic occurred.
            if outcome.is_err() {
                result_sender.send_replace(Some(Err(Error::PollerPanicked)));
            }
        });

        Poller {
            join_handle,
            stop_sender,
            result,
        }
    }

    /// Waits for the first round of refreshes to complete.
    ///
    /// # Errors
    ///
    /// This method can fail with the following errors:
    ///
    /// - [`Error::PollerPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidBaseUrl`]
    ///
    /// # Example
    ///
    /// ```
    /// # async fn test(poller: decision_core::poller::Poller) {
    /// match poller.wait_for_first_refresh().await {
    ///     Ok(()) => println!("Cache is warm."),
    ///     Err(err) => eprintln!("Cannot refresh cache: {:?}", err),
    /// }
    /// # }
    /// ```
    pub async fn wait_for_first_refresh(&self) -> Result<()> {
        let mut result = self.result.clone();
        let result = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::PollerPanicked)?
            .clone();
        result.unwrap_or(Err(Error::PollerPanicked))
    }

    /// Stop the poller task.
    ///
    /// This function does not wait for the task to actually stop.
    pub fn stop(&self) {
        // Error means that the task has exited already.
        let _ = self.stop_sender.send(true);
    }

    /// Stop the poller task and wait for it to exit.
    ///
    /// If you don't need to wait for the task to exit, use [`Poller::stop`] instead.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerPanicked`] if the task has panicked.
    pub async fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        self.join_handle
            .await
            .map_err(|_| Error::PollerPanicked)?;

        if let Some(Err(Error::PollerPanicked)) = &*self.result.borrow() {
            return Err(Error::PollerPanicked);
        }
        Ok(())
    }
}

async fn poll<K, V, S>(
    cache: ReadThroughCache<K, V, S>,
    keys: Vec<K>,
    config: PollerConfig,
    mut stop_receiver: watch::Receiver<bool>,
    result: &watch::Sender<Option<Result<()>>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: RefreshStrategy<K, V>,
{
    loop {
        log::debug!(target: "decision_core", keys = keys.len(); "polling cache keys");

        let mut succeeded = true;
        for key in &keys {
            match cache
                .get_async(key, Some(RefreshDirective::RefreshAndAwait))
                .await
            {
                Ok(_) => {}
                Err(err @ (Error::Unauthorized | Error::InvalidBaseUrl(_))) => {
                    // Unrecoverable errors
                    log::warn!(target: "decision_core", "stopping poller: {err}");
                    result.send_replace(Some(Err(err)));
                    return;
                }
                Err(_) => {
                    // Other errors are retriable.
                    succeeded = false;
                }
            }
        }

        if succeeded {
            result.send_if_modified(|result| match result {
                Some(Ok(())) => false,
                _ => {
                    *result = Some(Ok(()));
                    true
                }
            });
        }

        let timeout = jitter(config.interval, config.jitter);
        match tokio::time::timeout(timeout, stop_receiver.changed()).await {
            Err(_elapsed) => {
                // Timed out. Loop back to refresh again.
            }
            Ok(Ok(())) => {
                log::debug!(target: "decision_core", "poller received stop command");
                return;
            }
            Ok(Err(_)) => {
                // The poller handle was dropped.
                log::debug!(target: "decision_core", "poller handle dropped, stopping");
                return;
            }
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use futures::{future::BoxFuture, FutureExt};
    use reqwest::StatusCode;

    use super::{Poller, PollerConfig};
    use crate::{
        cache::{ReadThroughCache, RefreshStrategy, Refreshed},
        Error, Result,
    };

    /// Returns scripted results in order, then keeps producing `Unchanged`.
    struct Scripted {
        calls: Arc<AtomicUsize>,
        results: Mutex<VecDeque<Result<Refreshed<u32>>>>,
    }

    impl RefreshStrategy<String, u32> for Scripted {
        fn refresh(
            &self,
            _key: &String,
            _current: Option<&u32>,
        ) -> BoxFuture<'static, Result<Refreshed<u32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Refreshed::Unchanged));
            async move { result }.boxed()
        }
    }

    fn cache(
        results: impl IntoIterator<Item = Result<Refreshed<u32>>>,
    ) -> (ReadThroughCache<String, u32, Scripted>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = ReadThroughCache::new(Scripted {
            calls: Arc::clone(&calls),
            results: Mutex::new(results.into_iter().collect()),
        });
        (cache, calls)
    }

    fn config() -> PollerConfig {
        PollerConfig::new()
            .with_interval(Duration::from_secs(30))
            .with_jitter(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_periodically() {
        let (cache, calls) = cache([Ok(Refreshed::Fresh(1)), Ok(Refreshed::Fresh(2))]);
        let poller = Poller::start(cache.clone(), vec!["flags".to_owned()], config());

        poller.wait_for_first_refresh().await.unwrap();
        assert_eq!(cache.get(&"flags".to_owned()), Some(1));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&"flags".to_owned()), Some(2));

        poller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recoverable_errors() {
        let (cache, _calls) = cache([
            Err(Error::UnexpectedStatus(StatusCode::BAD_GATEWAY)),
            Ok(Refreshed::Fresh(1)),
        ]);
        let poller = Poller::start(cache.clone(), vec!["flags".to_owned()], config());

        poller.wait_for_first_refresh().await.unwrap();

        assert_eq!(cache.get(&"flags".to_owned()), Some(1));
        poller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_unauthorized() {
        let (cache, calls) = cache([Err(Error::Unauthorized)]);
        let poller = Poller::start(cache, vec!["flags".to_owned()], config());

        assert!(matches!(
            poller.wait_for_first_refresh().await,
            Err(Error::Unauthorized)
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        poller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_polling() {
        let (cache, calls) = cache([Ok(Refreshed::Fresh(1))]);
        let poller = Poller::start(cache, vec!["flags".to_owned()], config());
        poller.wait_for_first_refresh().await.unwrap();

        poller.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        poller.shutdown().await.unwrap();
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let result = super::jitter(Duration::ZERO, Duration::from_secs(30));

        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn zero_jitter_keeps_interval() {
        let result = super::jitter(Duration::from_secs(30), Duration::ZERO);

        assert_eq!(result, Duration::from_secs(30));
    }
}
