//! Query keys and the patterns used to invalidate them.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Identifies one cached read: a resource name plus a parameter set.
///
/// Parameters live in a `BTreeMap`, so two keys built from the same
/// parameters in any order compare (and hash) equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  resource: String,
  params: BTreeMap<String, String>,
}

impl QueryKey {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      params: BTreeMap::new(),
    }
  }

  /// Add a parameter. Values are trimmed so `" NYC "` and `"NYC"` share a key.
  pub fn with(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
    self
      .params
      .insert(name.into(), normalize(&value.to_string()));
    self
  }

  /// Add a parameter only when present; an absent filter and no filter are the same key.
  pub fn with_opt<V: fmt::Display>(self, name: impl Into<String>, value: Option<V>) -> Self {
    match value {
      Some(value) => self.with(name, value),
      None => self,
    }
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn param(&self, name: &str) -> Option<&str> {
    self.params.get(name).map(String::as_str)
  }

  /// Canonical `resource:k1=v1&k2=v2` form, form-urlencoded so free-text
  /// values cannot forge extra parameters.
  pub fn description(&self) -> String {
    format!("{}:{}", encode(&self.resource), encode_params(&self.params))
  }

  /// SHA-256 of the canonical form: stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

/// Selects the entries an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
  /// Exactly one key
  Exact(QueryKey),
  /// Every key of a resource whose parameters include all of `params`
  Family {
    resource: String,
    params: BTreeMap<String, String>,
  },
}

impl KeyPattern {
  pub fn family(resource: impl Into<String>) -> Self {
    Self::Family {
      resource: resource.into(),
      params: BTreeMap::new(),
    }
  }

  pub fn family_with(
    resource: impl Into<String>,
    name: impl Into<String>,
    value: impl fmt::Display,
  ) -> Self {
    let mut params = BTreeMap::new();
    params.insert(name.into(), normalize(&value.to_string()));
    Self::Family {
      resource: resource.into(),
      params,
    }
  }

  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      Self::Exact(exact) => exact == key,
      Self::Family { resource, params } => {
        key.resource == *resource
          && params
            .iter()
            .all(|(name, value)| key.params.get(name) == Some(value))
      }
    }
  }
}

impl From<QueryKey> for KeyPattern {
  fn from(key: QueryKey) -> Self {
    Self::Exact(key)
  }
}

impl fmt::Display for KeyPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Exact(key) => write!(f, "{}", key),
      Self::Family { resource, params } if params.is_empty() => write!(f, "{}:*", resource),
      Self::Family { resource, params } => {
        write!(f, "{}:{}&*", resource, encode_params(params))
      }
    }
  }
}

fn normalize(value: &str) -> String {
  value.trim().to_string()
}

fn encode(value: &str) -> String {
  form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn encode_params(params: &BTreeMap<String, String>) -> String {
  form_urlencoded::Serializer::new(String::new())
    .extend_pairs(params)
    .finish()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_structurally_equal_params_share_a_key() {
    let a = QueryKey::new("leads")
      .with("status", "new")
      .with("tag", "vip");
    let b = QueryKey::new("leads")
      .with("tag", " vip ")
      .with("status", "new");

    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn test_free_text_value_cannot_forge_a_parameter() {
    let forged = QueryKey::new("leads").with("search", "a&tag=vip");
    let split = QueryKey::new("leads")
      .with("search", "a")
      .with("tag", "vip");

    assert_ne!(forged, split);
    assert_ne!(forged.description(), split.description());
    assert_ne!(forged.cache_hash(), split.cache_hash());
    assert_eq!(forged.description(), "leads:search=a%26tag%3Dvip");
  }

  #[test]
  fn test_absent_param_matches_no_param() {
    let none: Option<&str> = None;
    assert_eq!(
      QueryKey::new("jobs").with_opt("type", none),
      QueryKey::new("jobs")
    );
    assert_ne!(
      QueryKey::new("jobs").with_opt("type", Some("csv")),
      QueryKey::new("jobs")
    );
  }

  #[test]
  fn test_family_pattern_matches_every_parameter_set() {
    let pattern = KeyPattern::family("leads");

    assert!(pattern.matches(&QueryKey::new("leads")));
    assert!(pattern.matches(&QueryKey::new("leads").with("status", "closed")));
    assert!(!pattern.matches(&QueryKey::new("leadStats")));
  }

  #[test]
  fn test_family_with_param_narrows_the_match() {
    let pattern = KeyPattern::family_with("leadNotes", "lead_id", "L1");

    assert!(pattern.matches(&QueryKey::new("leadNotes").with("lead_id", "L1")));
    assert!(!pattern.matches(&QueryKey::new("leadNotes").with("lead_id", "L2")));
    assert!(!pattern.matches(&QueryKey::new("leadNotes")));
  }

  #[test]
  fn test_exact_pattern() {
    let key = QueryKey::new("job").with("id", "J1");
    let pattern = KeyPattern::from(key.clone());

    assert!(pattern.matches(&key));
    assert!(!pattern.matches(&QueryKey::new("job").with("id", "J2")));
    assert_eq!(pattern.to_string(), "job:id=J1");
  }
}
