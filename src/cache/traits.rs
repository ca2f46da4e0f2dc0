//! Core traits and types for the caching system.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;

/// Result of a cache read, including data and metadata about the source.
#[derive(Debug)]
pub struct Snapshot<T> {
  /// The actual data
  pub data: Arc<T>,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched
  pub fetched_at: DateTime<Utc>,
}

impl<T> Snapshot<T> {
  /// True unless the value is being served while a refresh runs.
  pub fn is_fresh(&self) -> bool {
    !matches!(self.source, CacheSource::CacheStale)
  }
}

impl<T: Clone> Snapshot<T> {
  pub fn into_inner(self) -> T {
    Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
  }
}

impl<T> Clone for Snapshot<T> {
  fn clone(&self) -> Self {
    Self {
      data: Arc::clone(&self.data),
      source: self.source,
      fetched_at: self.fetched_at,
    }
  }
}

impl<T> Deref for Snapshot<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.data
  }
}

/// Indicates where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// The reader waited for a network fetch
  Network,
  /// Cached and within the staleness window
  CacheFresh,
  /// Cached but past the window; a background refresh was started
  CacheStale,
}

/// Lifecycle state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Absent,
  Loading,
  Fresh,
  /// Invalidated, waiting for the next read or subscriber to refetch
  Stale,
  Errored,
}

/// What subscribers observe. The channel keeps only the latest event, so a
/// slow subscriber may see `Updated` without the `Loading` that preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// Nothing fetched yet
  Idle,
  Loading,
  /// A fetch with this sequence number stored a new value
  Updated { seq: u64 },
  /// The entry was invalidated
  Stale,
  Errored { seq: u64, error: Error },
}

/// Value carried by an entry's watch channel: the public event plus the
/// highest sequence number that has settled, which readers wait on.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
  pub event: CacheEvent,
  pub settled: u64,
}

/// Outcome of the fetch a refresh policy is asked about.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome<'a, T> {
  Success(&'a T),
  Failure(&'a Error),
}

/// Decides, after each settled fetch, when the entry should be fetched again.
pub trait RefreshPolicy<T>: Send + Sync {
  /// `previous` is the value held before this fetch, if any.
  /// `None` means no further scheduled refresh.
  fn next_refresh(&self, outcome: FetchOutcome<'_, T>, previous: Option<&T>) -> Option<Duration>;
}

/// Refresh on a fixed interval no matter what the fetch returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval(pub Duration);

impl<T> RefreshPolicy<T> for FixedInterval {
  fn next_refresh(&self, _outcome: FetchOutcome<'_, T>, _previous: Option<&T>) -> Option<Duration> {
    Some(self.0)
  }
}

/// Per-read options.
pub struct ReadOptions<T> {
  /// Acceptable staleness; `None` uses the cache default
  pub stale_time: Option<Duration>,
  pub refresh: Option<Arc<dyn RefreshPolicy<T>>>,
}

impl<T> ReadOptions<T> {
  pub fn new() -> Self {
    Self {
      stale_time: None,
      refresh: None,
    }
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn refresh(mut self, policy: Arc<dyn RefreshPolicy<T>>) -> Self {
    self.refresh = Some(policy);
    self
  }
}

impl<T> Default for ReadOptions<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> fmt::Debug for ReadOptions<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReadOptions")
      .field("stale_time", &self.stale_time)
      .field("refresh", &self.refresh.is_some())
      .finish()
  }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub in_flight: usize,
  pub subscribers: usize,
  pub timers: usize,
}
