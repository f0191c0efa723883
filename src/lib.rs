//! `decision_core` is the runtime core of a feature-flag and experimentation client. It decides
//! which rules match a user, keeps remotely hosted resources and objects compiled from them fresh,
//! and ships outbound events in batches.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks:
//!
//! [`ConditionTree`](condition_tree::ConditionTree) is a boolean rule tree (`and`/`or`/`not` over
//! leaf conditions) evaluated with three-valued logic: every condition is either matched,
//! not matched, or unknown ([`TriState`](condition_tree::TriState)). Unknown results propagate
//! through the tree following Kleene logic, so missing or mistyped data never crashes evaluation.
//! [`custom_attribute`] provides the standard leaf condition that matches user
//! [`Attributes`].
//!
//! [`ReadThroughCache`](cache::ReadThroughCache) stores values by key, de-duplicates concurrent
//! refreshes, and notifies listeners of new values.
//! [`PollingResourceCache`](cache::PollingResourceCache) fetches remote resources with
//! conditional requests ([`fetcher`]), and
//! [`DerivedResourceCache`](cache::DerivedResourceCache) keeps an object built from another cached
//! value up-to-date with its source. [`Poller`](poller::Poller) refreshes a cache periodically.
//!
//! [`BatchQueue`](events::BatchQueue) groups events by size, elapsed time, and compatibility, and
//! hands each batch to an [`EventSink`](events::EventSink).
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Rule evaluation never fails: conditions that
//! cannot be evaluated yield an unknown result instead.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with `decision_core` target.
//! Consider integrating a `log`-compatible logger implementation for better visibility into cache
//! refreshes and event deliveries.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod condition_tree;
pub mod custom_attribute;
pub mod events;
pub mod fetcher;
pub mod poller;

mod attributes;
mod error;

pub use attributes::{AttributeValue, Attributes};
pub use error::{Error, Result};
