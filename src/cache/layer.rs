//! Query cache that orchestrates freshness, deduplication and refresh timers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::{KeyPattern, QueryKey};
use super::subscription::Subscription;
use super::traits::{
  CacheEvent, CacheSource, CacheStats, EntryStatus, FetchOutcome, ReadOptions, RefreshPolicy,
  Signal, Snapshot,
};
use crate::error::{Error, Result};

/// Default window in which a cached value is served without refetching.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

type AnyValue = Arc<dyn Any + Send + Sync>;
type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<AnyValue>> + Send + Sync>;
type ErasedPolicy = Arc<
  dyn Fn(std::result::Result<&AnyValue, &Error>, Option<&AnyValue>) -> Option<Duration>
    + Send
    + Sync,
>;

struct Entry {
  key: QueryKey,
  hash: String,
  value: Option<AnyValue>,
  fetched_at: Option<DateTime<Utc>>,
  fetched_instant: Option<Instant>,
  /// Latest failure, cleared by the next success
  error: Option<(u64, Error)>,
  status: EntryStatus,
  invalidated: bool,
  /// Last dispatched fetch
  seq: u64,
  /// Last completion that was applied
  applied_seq: u64,
  in_flight: Option<u64>,
  subscribers: usize,
  fetcher: Option<ErasedFetcher>,
  policy: Option<ErasedPolicy>,
  next_refresh: Option<Duration>,
  timer: Option<(u64, JoinHandle<()>)>,
  timer_seq: u64,
  events: watch::Sender<Signal>,
  last_used: Instant,
}

impl Entry {
  fn new(key: QueryKey, hash: String) -> Self {
    let (events, _) = watch::channel(Signal {
      event: CacheEvent::Idle,
      settled: 0,
    });
    Self {
      key,
      hash,
      value: None,
      fetched_at: None,
      fetched_instant: None,
      error: None,
      status: EntryStatus::Absent,
      invalidated: false,
      seq: 0,
      applied_seq: 0,
      in_flight: None,
      subscribers: 0,
      fetcher: None,
      policy: None,
      next_refresh: None,
      timer: None,
      timer_seq: 0,
      events,
      last_used: Instant::now(),
    }
  }

  fn is_fresh(&self, stale_time: Duration) -> bool {
    !self.invalidated
      && self
        .fetched_instant
        .is_some_and(|at| at.elapsed() <= stale_time)
  }

  fn status(&self) -> EntryStatus {
    if self.in_flight.is_some() {
      EntryStatus::Loading
    } else if self.invalidated {
      EntryStatus::Stale
    } else {
      self.status
    }
  }

  fn signal(&self, event: CacheEvent) {
    self.events.send_replace(Signal {
      event,
      settled: self.applied_seq,
    });
  }

  fn cancel_timer(&mut self) {
    if let Some((_, timer)) = self.timer.take() {
      timer.abort();
    }
  }
}

enum ReadPlan {
  Ready {
    value: AnyValue,
    fetched_at: Option<DateTime<Utc>>,
    source: CacheSource,
  },
  Wait {
    events: watch::Receiver<Signal>,
    target: u64,
  },
}

struct Inner {
  entries: Mutex<HashMap<String, Entry>>,
  stale_time: Duration,
}

/// Process-wide keyed cache of read results.
///
/// One context is built per process (or per test) and shared by cloning;
/// clones share the same entries. Entry state is guarded by a single mutex
/// that is never held across an `.await`, so the fetch-sequence check and the
/// write it guards are one atomic step.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl QueryCache {
  pub fn new() -> Self {
    Self::with_stale_time(DEFAULT_STALE_TIME)
  }

  /// Set the default staleness window used when a read does not name one.
  pub fn with_stale_time(stale_time: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(HashMap::new()),
        stale_time,
      }),
    }
  }

  pub fn stale_time(&self) -> Duration {
    self.inner.stale_time
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
    self
      .inner
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Read `key`, fetching with `fetcher` per the freshness policy.
  ///
  /// 1. Fresh value: returned, no fetch
  /// 2. Stale value: returned immediately, background refresh started
  /// 3. No value (or invalidated): waits for the in-flight fetch, starting one if needed
  ///
  /// The fetcher is kept on the entry for invalidation and interval refreshes.
  pub async fn read<T, F, Fut>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: ReadOptions<T>,
  ) -> Result<Snapshot<T>>
  where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let stale_time = options.stale_time.unwrap_or(self.inner.stale_time);
    let policy = options.refresh.map(erase_policy);

    match self.begin_read(key, erase_fetcher(fetcher), policy, stale_time) {
      ReadPlan::Ready {
        value,
        fetched_at,
        source,
      } => snapshot(key, value, fetched_at, source),
      ReadPlan::Wait { events, target } => self.wait_for(key, events, target).await,
    }
  }

  fn begin_read(
    &self,
    key: &QueryKey,
    fetcher: ErasedFetcher,
    policy: Option<ErasedPolicy>,
    stale_time: Duration,
  ) -> ReadPlan {
    let mut entries = self.lock();
    let entry = entry_mut(&mut entries, key);
    entry.fetcher = Some(fetcher);
    if policy.is_some() {
      entry.policy = policy;
    }
    entry.last_used = Instant::now();

    if !entry.invalidated {
      if let Some(value) = entry.value.clone() {
        let fresh = entry.is_fresh(stale_time);
        if !fresh && entry.in_flight.is_none() {
          debug!(key = %entry.key, "serving stale value while revalidating");
          self.dispatch(entry);
        }
        return ReadPlan::Ready {
          value,
          fetched_at: entry.fetched_at,
          source: if fresh {
            CacheSource::CacheFresh
          } else {
            CacheSource::CacheStale
          },
        };
      }
    }

    let in_flight = entry.in_flight;
    let target = in_flight
      .or_else(|| self.dispatch(entry))
      .unwrap_or(entry.seq);
    if in_flight.is_some() {
      debug!(key = %entry.key, seq = target, "attaching to in-flight fetch");
    }
    ReadPlan::Wait {
      events: entry.events.subscribe(),
      target,
    }
  }

  async fn wait_for<T: Send + Sync + 'static>(
    &self,
    key: &QueryKey,
    mut events: watch::Receiver<Signal>,
    target: u64,
  ) -> Result<Snapshot<T>> {
    events
      .wait_for(|signal| signal.settled >= target)
      .await
      .map_err(|_| Error::Cancelled {
        key: key.to_string(),
      })?;

    let entries = self.lock();
    let entry = entries
      .get(&key.cache_hash())
      .ok_or_else(|| Error::Cancelled {
        key: key.to_string(),
      })?;

    if let Some((seq, error)) = &entry.error {
      if *seq >= target {
        return Err(error.clone());
      }
    }
    match entry.value.clone() {
      Some(value) => snapshot(key, value, entry.fetched_at, CacheSource::Network),
      None => Err(Error::Cancelled {
        key: key.to_string(),
      }),
    }
  }

  /// Start a fetch for the entry. Returns its sequence number, or `None`
  /// when no reader has registered a fetcher yet.
  fn dispatch(&self, entry: &mut Entry) -> Option<u64> {
    let fetcher = entry.fetcher.clone()?;
    entry.seq += 1;
    let seq = entry.seq;
    entry.in_flight = Some(seq);
    entry.status = EntryStatus::Loading;
    entry.signal(CacheEvent::Loading);
    debug!(key = %entry.key, seq, "dispatching fetch");

    let cache = self.clone();
    let hash = entry.hash.clone();
    tokio::spawn(async move {
      let result = fetcher().await;
      cache.complete(&hash, seq, result);
    });
    Some(seq)
  }

  fn complete(&self, hash: &str, seq: u64, result: Result<AnyValue>) {
    let mut entries = self.lock();
    let Some(entry) = entries.get_mut(hash) else {
      debug!(seq, "fetch completed for an evicted entry");
      return;
    };

    if seq <= entry.applied_seq {
      debug!(key = %entry.key, seq, applied = entry.applied_seq, "discarding stale completion");
      return;
    }
    // A newer fetch was dispatched after this one (invalidation superseded it).
    let superseded = entry.in_flight.is_some_and(|current| current > seq);

    let next_refresh = match result {
      Ok(value) => {
        let previous = entry.value.replace(Arc::clone(&value));
        entry.fetched_at = Some(Utc::now());
        entry.fetched_instant = Some(Instant::now());
        entry.applied_seq = seq;
        if superseded {
          debug!(key = %entry.key, seq, "stored superseded result, newer fetch still pending");
          return;
        }
        entry.error = None;
        entry.status = EntryStatus::Fresh;
        entry.invalidated = false;
        entry.in_flight = None;
        let next = entry
          .policy
          .as_ref()
          .and_then(|policy| policy(Ok(&value), previous.as_ref()));
        entry.signal(CacheEvent::Updated { seq });
        next
      }
      Err(error) => {
        if superseded {
          debug!(key = %entry.key, seq, error = %error, "dropping superseded failure");
          return;
        }
        warn!(key = %entry.key, seq, error = %error, "fetch failed");
        entry.applied_seq = seq;
        entry.in_flight = None;
        entry.status = EntryStatus::Errored;
        entry.error = Some((seq, error.clone()));
        let next = entry
          .policy
          .as_ref()
          .and_then(|policy| policy(Err(&error), entry.value.as_ref()));
        entry.signal(CacheEvent::Errored { seq, error });
        next
      }
    };

    entry.next_refresh = next_refresh;
    self.schedule(entry);
  }

  /// (Re)arm the entry's refresh timer. Timers only run while someone is subscribed.
  fn schedule(&self, entry: &mut Entry) {
    entry.cancel_timer();
    if entry.subscribers == 0 {
      return;
    }
    let Some(delay) = entry.next_refresh else {
      return;
    };

    entry.timer_seq += 1;
    let timer_id = entry.timer_seq;
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let hash = entry.hash.clone();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(inner) = weak.upgrade() {
        QueryCache { inner }.refresh_due(&hash, timer_id);
      }
    });
    debug!(key = %entry.key, ?delay, "scheduled refresh");
    entry.timer = Some((timer_id, handle));
  }

  fn refresh_due(&self, hash: &str, timer_id: u64) {
    let mut entries = self.lock();
    let Some(entry) = entries.get_mut(hash) else {
      return;
    };
    match &entry.timer {
      Some((current, _)) if *current == timer_id => entry.timer = None,
      _ => return,
    }
    if entry.in_flight.is_none() {
      self.dispatch(entry);
    }
  }

  /// Mark every entry matching `pattern` stale. Returns how many matched.
  ///
  /// Entries with subscribers (or a fetch already in flight, which may carry
  /// pre-invalidation data) refetch immediately; the rest refetch on next read.
  pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
    let mut entries = self.lock();
    let mut count = 0;
    for entry in entries.values_mut().filter(|e| pattern.matches(&e.key)) {
      count += 1;
      entry.invalidated = true;
      entry.cancel_timer();
      entry.signal(CacheEvent::Stale);
      if entry.subscribers > 0 || entry.in_flight.is_some() {
        self.dispatch(entry);
      }
    }
    debug!(pattern = %pattern, count, "invalidated");
    count
  }

  /// Attach a subscriber. While at least one is attached, refresh timers run
  /// and invalidations refetch eagerly.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let mut entries = self.lock();
    let entry = entry_mut(&mut entries, key);
    entry.subscribers += 1;
    entry.last_used = Instant::now();

    if entry.subscribers == 1 && entry.in_flight.is_none() {
      if entry.invalidated {
        self.dispatch(entry);
      } else if entry.timer.is_none() {
        self.schedule(entry);
      }
    }

    Subscription::new(
      self.clone(),
      key.clone(),
      entry.hash.clone(),
      entry.events.subscribe(),
    )
  }

  pub(super) fn detach(&self, hash: &str) {
    let mut entries = self.lock();
    if let Some(entry) = entries.get_mut(hash) {
      entry.subscribers = entry.subscribers.saturating_sub(1);
      if entry.subscribers == 0 {
        entry.cancel_timer();
        debug!(key = %entry.key, "last subscriber detached");
      }
    }
  }

  /// Current value without fetching.
  pub fn get<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Result<Option<Snapshot<T>>> {
    let entries = self.lock();
    let Some(entry) = entries.get(&key.cache_hash()) else {
      return Ok(None);
    };
    let Some(value) = entry.value.clone() else {
      return Ok(None);
    };
    let source = if entry.is_fresh(self.inner.stale_time) {
      CacheSource::CacheFresh
    } else {
      CacheSource::CacheStale
    };
    snapshot(key, value, entry.fetched_at, source).map(Some)
  }

  /// Seed or overwrite a value. Any fetch in flight for the key is superseded.
  pub fn set<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) {
    let mut entries = self.lock();
    let entry = entry_mut(&mut entries, key);
    entry.seq += 1;
    let seq = entry.seq;
    entry.value = Some(Arc::new(value));
    entry.fetched_at = Some(Utc::now());
    entry.fetched_instant = Some(Instant::now());
    entry.applied_seq = seq;
    entry.error = None;
    entry.status = EntryStatus::Fresh;
    entry.invalidated = false;
    entry.in_flight = None;
    entry.last_used = Instant::now();
    entry.signal(CacheEvent::Updated { seq });
  }

  pub fn status(&self, key: &QueryKey) -> EntryStatus {
    self
      .lock()
      .get(&key.cache_hash())
      .map(Entry::status)
      .unwrap_or(EntryStatus::Absent)
  }

  /// Drop entries nobody is subscribed to, nothing is fetching, and no one
  /// has read for at least `idle`.
  pub fn evict_unused(&self, idle: Duration) -> usize {
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|_, entry| {
      entry.subscribers > 0 || entry.in_flight.is_some() || entry.last_used.elapsed() < idle
    });
    let evicted = before - entries.len();
    if evicted > 0 {
      debug!(evicted, "evicted unused cache entries");
    }
    evicted
  }

  /// Periodically run [`evict_unused`](Self::evict_unused) until the cache is dropped.
  pub fn spawn_gc(&self, idle: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(idle);
      interval.tick().await;
      loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        QueryCache { inner }.evict_unused(idle);
      }
    })
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self.lock();
    entries.values().fold(
      CacheStats {
        entries: entries.len(),
        ..CacheStats::default()
      },
      |mut stats, entry| {
        stats.in_flight += usize::from(entry.in_flight.is_some());
        stats.subscribers += entry.subscribers;
        stats.timers += usize::from(entry.timer.is_some());
        stats
      },
    )
  }

  /// Cancel every timer and drop every entry. Pending readers get `Cancelled`.
  pub fn shutdown(&self) {
    let mut entries = self.lock();
    for entry in entries.values_mut() {
      entry.cancel_timer();
    }
    let dropped = entries.len();
    entries.clear();
    debug!(dropped, "query cache shut down");
  }
}

impl Default for QueryCache {
  fn default() -> Self {
    Self::new()
  }
}

fn entry_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &QueryKey) -> &'a mut Entry {
  let hash = key.cache_hash();
  entries
    .entry(hash.clone())
    .or_insert_with(|| Entry::new(key.clone(), hash))
}

fn erase_fetcher<T, F, Fut>(fetcher: F) -> ErasedFetcher
where
  T: Send + Sync + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move || {
    fetcher()
      .map(|result| result.map(|value| Arc::new(value) as AnyValue))
      .boxed()
  })
}

fn erase_policy<T: Send + Sync + 'static>(policy: Arc<dyn RefreshPolicy<T>>) -> ErasedPolicy {
  Arc::new(
    move |outcome: std::result::Result<&AnyValue, &Error>, previous: Option<&AnyValue>| {
      let previous = previous.and_then(|value| value.as_ref().downcast_ref::<T>());
      match outcome {
        Ok(value) => {
          let value = value.as_ref().downcast_ref::<T>()?;
          policy.next_refresh(FetchOutcome::Success(value), previous)
        }
        Err(error) => policy.next_refresh(FetchOutcome::Failure(error), previous),
      }
    },
  )
}

fn snapshot<T: Send + Sync + 'static>(
  key: &QueryKey,
  value: AnyValue,
  fetched_at: Option<DateTime<Utc>>,
  source: CacheSource,
) -> Result<Snapshot<T>> {
  let data = value.downcast::<T>().map_err(|_| Error::CacheType {
    key: key.to_string(),
  })?;
  Ok(Snapshot {
    data,
    source,
    fetched_at: fetched_at.unwrap_or_else(Utc::now),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::FixedInterval;
  use crate::error::TransportError;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_fetcher(
    counter: Arc<AtomicU32>,
  ) -> impl Fn() -> futures::future::Ready<Result<u32>> + Send + Sync + 'static {
    move || futures::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
  }

  fn key() -> QueryKey {
    QueryKey::new("leads").with("status", "new")
  }

  #[tokio::test]
  async fn test_two_reads_within_window_fetch_once() {
    let cache = QueryCache::with_stale_time(Duration::from_secs(60));
    let counter = Arc::new(AtomicU32::new(0));

    let first = cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();
    let second = cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();

    assert_eq!(*first, 1);
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(*second, 1);
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_readers_share_one_in_flight_fetch() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let slow = {
      let counter = counter.clone();
      move || {
        let counter = counter.clone();
        async move {
          tokio::time::sleep(Duration::from_millis(50)).await;
          Ok::<_, Error>(counter.fetch_add(1, Ordering::SeqCst) + 1)
        }
      }
    };

    let key = key();
    let (a, b) = tokio::join!(
      cache.read(&key, slow.clone(), ReadOptions::new()),
      cache.read(&key, slow, ReadOptions::new()),
    );

    assert_eq!(*a.unwrap(), 1);
    assert_eq!(*b.unwrap(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_without_subscribers_then_read_fetches_exactly_once() {
    let cache = QueryCache::with_stale_time(Duration::from_secs(60));
    let counter = Arc::new(AtomicU32::new(0));

    cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();

    assert_eq!(cache.invalidate(&KeyPattern::family("leads")), 1);
    tokio::task::yield_now().await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cache.status(&key()), EntryStatus::Stale);

    let after = cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();

    assert_eq!(*after, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(cache.status(&key()), EntryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_value_served_while_revalidating() {
    let cache = QueryCache::with_stale_time(Duration::from_millis(500));
    let counter = Arc::new(AtomicU32::new(0));

    cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;

    let stale = cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();
    assert_eq!(*stale, 1);
    assert!(!stale.is_fresh());

    // Let the background refresh land.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let fresh = cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();
    assert_eq!(*fresh, 2);
    assert!(fresh.is_fresh());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_superseded_completion_never_overwrites_newer_result() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
      let calls = calls.clone();
      move || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          // First fetch is slow and returns pre-invalidation data.
          if call == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>("old")
          } else {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("new")
          }
        }
      }
    };

    let reader = {
      let cache = cache.clone();
      let fetcher = fetcher.clone();
      tokio::spawn(async move { cache.read(&key(), fetcher, ReadOptions::new()).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(cache.status(&key()), EntryStatus::Loading);

    cache.invalidate(&KeyPattern::from(key()));

    let read = reader.await.unwrap().unwrap();
    assert_eq!(*read, "new");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cached = cache.get::<&'static str>(&key()).unwrap().unwrap();
    assert_eq!(*cached, "new");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_fetch_reaches_reader_and_next_read_retries() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
      let calls = calls.clone();
      move || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if call == 0 {
            Err(TransportError::network("connection refused").into())
          } else {
            Ok(7u32)
          }
        }
      }
    };

    let err = cache
      .read(&key(), fetcher.clone(), ReadOptions::new())
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "connection refused");
    assert_eq!(cache.status(&key()), EntryStatus::Errored);

    let value = cache.read(&key(), fetcher, ReadOptions::new()).await.unwrap();
    assert_eq!(*value, 7);
  }

  #[tokio::test(start_paused = true)]
  async fn test_interval_runs_only_while_subscribed() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let options = || ReadOptions::new().refresh(Arc::new(FixedInterval(Duration::from_secs(1))));

    let subscription = cache.subscribe(&key());
    cache
      .read(&key(), counting_fetcher(counter.clone()), options())
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let while_subscribed = counter.load(Ordering::SeqCst);
    assert!(while_subscribed >= 3, "got {}", while_subscribed);

    drop(subscription);
    assert_eq!(cache.stats().timers, 0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(counter.load(Ordering::SeqCst), while_subscribed);

    let _again = cache.subscribe(&key());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(counter.load(Ordering::SeqCst) > while_subscribed);
  }

  #[tokio::test]
  async fn test_subscription_sees_updates() {
    let cache = QueryCache::new();
    let mut subscription = cache.subscribe(&key());
    assert_eq!(subscription.current(), CacheEvent::Idle);

    cache.set(&key(), 5u32);
    let event = subscription.changed().await.unwrap();
    assert!(matches!(event, CacheEvent::Updated { .. }));

    cache.invalidate(&KeyPattern::family("leads"));
    assert_eq!(subscription.changed().await.unwrap(), CacheEvent::Stale);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_with_subscriber_refetches_without_a_read() {
    let cache = QueryCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let _subscription = cache.subscribe(&key());
    cache
      .read(&key(), counting_fetcher(counter.clone()), ReadOptions::new())
      .await
      .unwrap();

    cache.invalidate(&KeyPattern::family("leads"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(*cache.get::<u32>(&key()).unwrap().unwrap(), 2);
    assert_eq!(cache.status(&key()), EntryStatus::Fresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_finishing_after_last_detach_still_stores() {
    let cache = QueryCache::new();
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
      let calls = calls.clone();
      move || {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
          if call > 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
          }
          Ok::<_, Error>(call)
        }
      }
    };
    let options = || ReadOptions::new().refresh(Arc::new(FixedInterval(Duration::from_secs(1))));

    let subscription = cache.subscribe(&key());
    cache.read(&key(), fetcher, options()).await.unwrap();
    cache.invalidate(&KeyPattern::family("leads"));
    assert_eq!(cache.stats().in_flight, 1);

    drop(subscription);
    assert_eq!(cache.stats().subscribers, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*cache.get::<u32>(&key()).unwrap().unwrap(), 2);
    assert_eq!(cache.stats().timers, 0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_forged_filter_does_not_share_an_entry() {
    let cache = QueryCache::new();
    let forged = QueryKey::new("leads").with("search", "a&tag=vip");
    let split = QueryKey::new("leads")
      .with("search", "a")
      .with("tag", "vip");

    let first = cache
      .read(&forged, || async { Ok::<_, Error>("forged") }, ReadOptions::new())
      .await
      .unwrap();
    let second = cache
      .read(&split, || async { Ok::<_, Error>("split") }, ReadOptions::new())
      .await
      .unwrap();

    assert_eq!(*first, "forged");
    assert_eq!(*second, "split");
    assert_eq!(second.source, CacheSource::Network);
    assert_eq!(cache.stats().entries, 2);
  }

  #[tokio::test]
  async fn test_subscription_stream_yields_events() {
    use futures::StreamExt;

    let cache = QueryCache::new();
    let mut events = Box::pin(cache.subscribe(&key()).into_stream());

    cache.set(&key(), 1u32);
    assert!(matches!(events.next().await, Some(CacheEvent::Updated { .. })));

    cache.shutdown();
    assert_eq!(events.next().await, None);
  }

  #[tokio::test]
  async fn test_type_mismatch_is_an_error_not_a_panic() {
    let cache = QueryCache::new();
    cache.set(&key(), 5u32);

    let err = cache.get::<String>(&key()).unwrap_err();
    assert!(matches!(err, Error::CacheType { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_evict_unused_keeps_subscribed_entries() {
    let cache = QueryCache::new();
    let watched = QueryKey::new("job").with("id", "J1");
    cache.set(&key(), 1u32);
    cache.set(&watched, 2u32);
    let _subscription = cache.subscribe(&watched);

    tokio::time::advance(Duration::from_secs(120)).await;

    assert_eq!(cache.evict_unused(Duration::from_secs(60)), 1);
    assert_eq!(cache.status(&key()), EntryStatus::Absent);
    assert_eq!(cache.status(&watched), EntryStatus::Fresh);
  }

  #[tokio::test]
  async fn test_shutdown_cancels_waiting_readers() {
    let cache = QueryCache::new();
    let reader = {
      let cache = cache.clone();
      tokio::spawn(async move {
        cache
          .read(&key(), || futures::future::pending::<Result<u32>>(), ReadOptions::new())
          .await
      })
    };
    tokio::task::yield_now().await;

    cache.shutdown();

    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(cache.stats(), CacheStats::default());
  }
}
