//! User-facing notifications for write outcomes.
//!
//! Delivery is at-most-once: receivers that fall behind the channel capacity
//! miss notifications, and nothing is replayed to late subscribers.

use std::fmt;

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Success,
  Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub level: Level,
  pub title: String,
  pub description: Option<String>,
}

impl Notification {
  pub fn success(title: impl Into<String>) -> Self {
    Self {
      level: Level::Success,
      title: title.into(),
      description: None,
    }
  }

  pub fn failure(title: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      level: Level::Failure,
      title: title.into(),
      description: Some(description.into()),
    }
  }

  pub fn is_failure(&self) -> bool {
    self.level == Level::Failure
  }
}

impl fmt::Display for Notification {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.description {
      Some(description) => write!(f, "{}: {}", self.title, description),
      None => f.write_str(&self.title),
    }
  }
}

/// Broadcast sink for notifications. Clones share the channel.
#[derive(Clone)]
pub struct Notifier {
  sender: broadcast::Sender<Notification>,
}

impl Notifier {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity);
    Self { sender }
  }

  /// Publish to every current subscriber. Returns how many received it.
  pub fn publish(&self, notification: Notification) -> usize {
    self.sender.send(notification).unwrap_or(0)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.sender.subscribe()
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Notifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Notifier")
      .field("subscribers", &self.sender.receiver_count())
      .finish()
  }
}
