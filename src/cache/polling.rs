use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::{
    cache::{CacheEntry, ReadThroughCache, RefreshDirective, RefreshStrategy, Refreshed},
    fetcher::{Fetcher, Validators},
    Error, Result,
};

/// A read-through cache of remote resources kept fresh with conditional requests.
pub type PollingResourceCache<F> =
    ReadThroughCache<String, Arc<PolledResource>, PollingStrategy<F>>;

/// A fetched resource along with the validators needed to revalidate it.
#[derive(Debug, PartialEq)]
pub struct PolledResource {
    pub body: Bytes,
    pub validators: Validators,
}

impl PolledResource {
    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// [`RefreshStrategy`] that fetches resources with a [`Fetcher`].
///
/// Each fetch carries the validators of the currently cached response, so an unchanged resource
/// costs a `304 Not Modified` and leaves the cache entry untouched.
pub struct PollingStrategy<F> {
    fetcher: F,
    max_age: Option<Duration>,
}

impl<F> PollingStrategy<F> {
    pub fn new(fetcher: F) -> PollingStrategy<F> {
        PollingStrategy {
            fetcher,
            max_age: None,
        }
    }

    /// Serve cached resources older than `max_age` while refreshing them in background.
    ///
    /// Without a max age, cached resources are served as is and only refreshed on request (e.g.,
    /// by a [`Poller`](crate::poller::Poller)).
    pub fn with_max_age(mut self, max_age: Duration) -> PollingStrategy<F> {
        self.max_age = Some(max_age);
        self
    }
}

impl<K, F> RefreshStrategy<K, Arc<PolledResource>> for PollingStrategy<F>
where
    F: Fetcher<K>,
{
    fn refresh(
        &self,
        key: &K,
        current: Option<&Arc<PolledResource>>,
    ) -> BoxFuture<'static, Result<Refreshed<Arc<PolledResource>>>> {
        let validators = current
            .map(|resource| resource.validators.clone())
            .unwrap_or_default();
        let response = self.fetcher.fetch(key, &validators);

        async move {
            let response = response.await?;
            match response.status {
                StatusCode::NOT_MODIFIED => Ok(Refreshed::Unchanged),
                StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
                status if status.is_success() => Ok(Refreshed::Fresh(Arc::new(PolledResource {
                    validators: Validators::from_headers(&response.headers),
                    body: response.body,
                }))),
                status => Err(Error::UnexpectedStatus(status)),
            }
        }
        .boxed()
    }

    fn policy(&self, _key: &K, entry: &CacheEntry<Arc<PolledResource>>) -> RefreshDirective {
        let Some(max_age) = self.max_age else {
            return RefreshDirective::OnlyIfCacheMiss;
        };

        let stale = match entry.last_refreshed_at() {
            // Seeded and never refreshed.
            None => true,
            // to_std() fails on negative durations, i.e., refreshed "in the future".
            Some(refreshed_at) => (Utc::now() - refreshed_at)
                .to_std()
                .map_or(false, |age| age >= max_age),
        };

        if stale {
            RefreshDirective::RefreshInBackground
        } else {
            RefreshDirective::OnlyIfCacheMiss
        }
    }
}
