//! Read-through caches that keep remote resources, and objects derived from them, fresh.
//!
//! [`ReadThroughCache`] is the generic engine: it stores one value per key, de-duplicates
//! concurrent refreshes of the same key (singleflight), and notifies listeners when a refresh
//! produces a new value. What a refresh does and when a cached value is stale is decided by a
//! [`RefreshStrategy`].
//!
//! Two strategies are provided:
//!
//! - [`PollingStrategy`] fetches a resource with a [`Fetcher`](crate::fetcher::Fetcher), using
//!   conditional requests so an unchanged resource doesn't produce a new value
//!   ([`PollingResourceCache`]).
//! - [`DerivedStrategy`] builds an object from an [`Upstream`] value and rebuilds it whenever the
//!   upstream value changes ([`DerivedResourceCache`]).
mod derived;
mod polling;
mod read_through;

pub use derived::{Derived, DerivedResourceCache, DerivedStrategy, Upstream};
pub use polling::{PolledResource, PollingResourceCache, PollingStrategy};
pub use read_through::{
    CacheEntry, Listener, ReadThroughCache, RefreshDirective, RefreshStrategy, Refreshed,
    WeakReadThroughCache,
};
