//! Keyed query cache for read results.
//!
//! This module is resource-agnostic. It:
//! - Keys reads by resource name + structural parameter set
//! - Deduplicates concurrent fetches for the same key
//! - Serves stale values while revalidating in the background
//! - Invalidates single keys or whole key families
//! - Runs interval refreshes only while a key has subscribers

mod key;
mod layer;
mod subscription;
mod traits;

pub use key::{KeyPattern, QueryKey};
pub use layer::{QueryCache, DEFAULT_STALE_TIME};
pub use subscription::Subscription;
pub use traits::{
  CacheEvent, CacheSource, CacheStats, EntryStatus, FetchOutcome, FixedInterval, ReadOptions,
  RefreshPolicy, Snapshot,
};
