//! Customer profile aggregation with a stale-while-revalidate cache.
//!
//! [`state::AppState`] wires the pieces together: upstream [`sources`] are
//! called through the timeout guard in [`fetch`], merged by [`aggregator`]
//! into a [`types::CustomerProfile`] (timeline and stats from [`timeline`]),
//! cached in [`cache`] and served by [`revalidate::ProfileService`].

pub mod aggregator;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod latency;
pub mod prefetch;
pub mod revalidate;
pub mod sources;
pub mod state;
pub mod timeline;
pub mod types;
pub mod util;
