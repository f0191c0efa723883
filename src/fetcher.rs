//! Conditional fetching of remote resources.
//!
//! [`Fetcher`] is the transport seam used by
//! [`PollingStrategy`](crate::cache::PollingStrategy). [`HttpFetcher`] is the default
//! implementation over HTTP.
use std::fmt::Display;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use reqwest::{
    header::{
        HeaderMap, HeaderName, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    },
    StatusCode, Url,
};

use crate::{Error, Result};

/// Validators from a previous response, used to ask the server whether the resource changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// Entity tag of the previous response.
    pub etag: Option<String>,
    /// `Last-Modified` value of the previous response.
    pub last_modified: Option<String>,
}

impl Validators {
    /// Extract validators from response headers. Header names are matched case-insensitively.
    pub fn from_headers(headers: &HeaderMap) -> Validators {
        let get = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        Validators {
            etag: get(ETAG),
            last_modified: get(LAST_MODIFIED),
        }
    }

    /// Request headers that make the next request conditional.
    pub fn to_request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = self
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
        headers
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Raw response of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fetches the resource identified by a key, using `validators` from the previous response to
/// make the request conditional.
///
/// Implementations return the response for any status; interpreting the status is up to the
/// caller.
pub trait Fetcher<K>: Send + Sync + 'static {
    fn fetch(&self, key: &K, validators: &Validators) -> BoxFuture<'static, Result<FetchResponse>>;
}

impl<K, F> Fetcher<K> for F
where
    F: Fn(&K, &Validators) -> BoxFuture<'static, Result<FetchResponse>> + Send + Sync + 'static,
{
    fn fetch(&self, key: &K, validators: &Validators) -> BoxFuture<'static, Result<FetchResponse>> {
        self(key, validators)
    }
}

pub struct HttpFetcherConfig {
    pub base_url: String,
    /// SDK name. Usually, language name.
    pub sdk_name: String,
    /// Version of SDK.
    pub sdk_version: String,
}

const DATAFILE_ENDPOINT: &str = "/datafiles";

/// A [`Fetcher`] that requests `{base_url}/datafiles/{key}.json` over HTTP.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: HttpFetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> HttpFetcher {
        HttpFetcher {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, key: &impl Display) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}/{}.json", self.config.base_url, DATAFILE_ENDPOINT, key),
            &[
                ("sdkName", &*self.config.sdk_name),
                ("sdkVersion", &*self.config.sdk_version),
                ("coreVersion", env!("CARGO_PKG_VERSION")),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

impl<K: Display> Fetcher<K> for HttpFetcher {
    fn fetch(&self, key: &K, validators: &Validators) -> BoxFuture<'static, Result<FetchResponse>> {
        let request = self
            .url(key)
            .map(|url| self.client.get(url).headers(validators.to_request_headers()));

        async move {
            let request = request?;

            log::debug!(target: "decision_core", "fetching resource");
            let response = request.send().await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                log::warn!(target: "decision_core", "client is not authorized. Check your SDK key");
            } else if !status.is_success() && status != StatusCode::NOT_MODIFIED {
                log::warn!(target: "decision_core", "received unexpected response while fetching resource: {status}");
            }

            let headers = response.headers().clone();
            let body = response.bytes().await?;

            Ok(FetchResponse {
                status,
                headers,
                body,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

    use super::{HttpFetcher, HttpFetcherConfig, Validators};
    use crate::Error;

    fn fetcher(base_url: &str) -> HttpFetcher {
        HttpFetcher::new(HttpFetcherConfig {
            base_url: base_url.to_owned(),
            sdk_name: "rust".to_owned(),
            sdk_version: "1.0.0".to_owned(),
        })
    }

    #[test]
    fn validators_from_mixed_case_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"ETag").unwrap(),
            HeaderValue::from_static("\"abc\""),
        );
        headers.insert(
            HeaderName::from_bytes(b"LAST-MODIFIED").unwrap(),
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );

        let validators = Validators::from_headers(&headers);

        assert_eq!(validators.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            validators.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[test]
    fn validators_become_conditional_headers() {
        let validators = Validators {
            etag: Some("\"abc\"".to_owned()),
            last_modified: None,
        };

        let headers = validators.to_request_headers();

        assert_eq!(headers.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert!(headers.get(IF_MODIFIED_SINCE).is_none());
        assert!(Validators::default().to_request_headers().is_empty());
        assert!(Validators::default().is_empty());
    }

    #[test]
    fn url_includes_key_and_sdk_params() {
        let url = fetcher("https://cdn.test").url(&"sdk-key").unwrap();

        assert_eq!(url.path(), "/datafiles/sdk-key.json");
        let query = url.query().unwrap();
        assert!(query.contains("sdkName=rust"));
        assert!(query.contains("sdkVersion=1.0.0"));
    }

    #[test]
    fn invalid_base_url() {
        assert!(matches!(
            fetcher("not a url").url(&"sdk-key"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }
}
