//! Subscriber handles for cache entries.

use futures::stream::{self, Stream};
use tokio::sync::watch;

use super::key::QueryKey;
use super::layer::QueryCache;
use super::traits::{CacheEvent, Signal};

/// Keeps an entry's refresh timer alive and reports its changes.
///
/// Dropping the last subscription for a key cancels that key's interval
/// refresh. Fetches already dispatched still complete and store their result.
pub struct Subscription {
  cache: QueryCache,
  key: QueryKey,
  hash: String,
  events: watch::Receiver<Signal>,
}

impl Subscription {
  pub(super) fn new(
    cache: QueryCache,
    key: QueryKey,
    hash: String,
    events: watch::Receiver<Signal>,
  ) -> Self {
    Self {
      cache,
      key,
      hash,
      events,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Latest event without waiting.
  pub fn current(&self) -> CacheEvent {
    self.events.borrow().event.clone()
  }

  /// Wait for the next event. `None` once the entry is gone (evicted or shut down).
  pub async fn changed(&mut self) -> Option<CacheEvent> {
    self.events.changed().await.ok()?;
    let event = self.events.borrow_and_update().event.clone();
    Some(event)
  }

  pub fn into_stream(self) -> impl Stream<Item = CacheEvent> + Send + 'static {
    stream::unfold(self, |mut subscription| async move {
      let event = subscription.changed().await?;
      Some((event, subscription))
    })
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cache.detach(&self.hash);
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .finish_non_exhaustive()
  }
}
