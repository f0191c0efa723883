use std::sync::Arc;

use reqwest::StatusCode;

/// Represents a result type for operations in this crate.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-wide [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while refreshing cached resources or
/// delivering events.
///
/// `Error` is `Clone` because a single refresh failure is handed to every caller that was waiting
/// on the same refresh.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk key is likely invalid")]
    Unauthorized,

    /// The server answered with a status that is neither a success nor "not modified".
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(StatusCode),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Resource body could not be parsed.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Json(Arc<serde_json::Error>),

    /// Derived object could not be built from its source resource.
    #[error("failed to build derived object: {0}")]
    Build(String),

    /// Event sink failed to deliver a batch.
    #[error("failed to deliver events: {0}")]
    Delivery(String),

    /// Indicates that a refresh task panicked. This should normally never happen.
    #[error("refresh task panicked")]
    RefreshPanicked,

    /// Indicates that the poller task panicked. This should normally never happen.
    #[error("poller task panicked")]
    PollerPanicked,
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
