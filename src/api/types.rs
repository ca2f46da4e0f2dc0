use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Lifecycle of a job. Moves forward only; `Ok` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Working,
  Ok,
  Failed,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Ok | Self::Failed)
  }

  /// Position in the lifecycle, for detecting backwards transitions.
  pub fn rank(self) -> u8 {
    match self {
      Self::Pending => 0,
      Self::Working => 1,
      Self::Ok | Self::Failed => 2,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Working => "working",
      Self::Ok => "ok",
      Self::Failed => "failed",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Kind of scraper a job runs. Unknown kinds from a newer server are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
  GoogleMaps,
  Linkedin,
  Csv,
  Website,
  Api,
  Other(String),
}

impl JobKind {
  pub fn as_str(&self) -> &str {
    match self {
      Self::GoogleMaps => "google_maps",
      Self::Linkedin => "linkedin",
      Self::Csv => "csv",
      Self::Website => "website",
      Self::Api => "api",
      Self::Other(kind) => kind,
    }
  }
}

impl From<&str> for JobKind {
  fn from(kind: &str) -> Self {
    match kind {
      "google_maps" => Self::GoogleMaps,
      "linkedin" => Self::Linkedin,
      "csv" => Self::Csv,
      "website" => Self::Website,
      "api" => Self::Api,
      other => Self::Other(other.to_string()),
    }
  }
}

impl fmt::Display for JobKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Serialize for JobKind {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for JobKind {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let kind = String::deserialize(deserializer)?;
    Ok(Self::from(kind.as_str()))
  }
}

/// A unit of asynchronous remote work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
  pub id: String,
  pub name: String,
  #[serde(rename = "type")]
  pub kind: JobKind,
  pub status: JobStatus,
  /// Kind-specific configuration
  pub parameters: Map<String, Value>,
  pub results_count: u64,
  pub error: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }

  /// File name the results download is saved under. Always a single path
  /// component: separators become `_` and leading dots are dropped.
  pub fn download_file_name(&self) -> String {
    let stem: String = self
      .name
      .chars()
      .map(|c| match c {
        ' ' | '/' | '\\' | ':' => '_',
        c if c.is_control() => '_',
        c => c,
      })
      .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
      format!("job_{}_results.csv", self.id)
    } else {
      format!("{}_results.csv", stem)
    }
  }
}

/// Submission payload. Serializes to `{name, type, ...parameters, tags?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
  pub name: String,
  #[serde(rename = "type")]
  pub kind: JobKind,
  #[serde(flatten)]
  pub parameters: Map<String, Value>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
}

impl JobSpec {
  pub fn new(name: impl Into<String>, kind: JobKind) -> Self {
    Self {
      name: name.into(),
      kind,
      parameters: Map::new(),
      tags: Vec::new(),
    }
  }

  pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.parameters.insert(name.into(), value.into());
    self
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tags.push(tag.into());
    self
  }
}

/// One row scraped by a job. The shape depends on the job kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrapedRecord(pub Map<String, Value>);

impl ScrapedRecord {
  pub fn get_str(&self, field: &str) -> Option<&str> {
    self.0.get(field).and_then(Value::as_str)
  }

  pub fn name(&self) -> Option<&str> {
    self.get_str("name").or_else(|| self.get_str("title"))
  }

  pub fn phone(&self) -> Option<&str> {
    self.get_str("phone")
  }

  pub fn website(&self) -> Option<&str> {
    self.get_str("website")
  }

  pub fn address(&self) -> Option<&str> {
    self.get_str("address")
  }
}

/// Binary results payload, ready for the consumer to save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
  pub file_name: String,
  pub bytes: Vec<u8>,
}

// ============================================================================
// Leads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
  #[serde(deserialize_with = "super::api_types::deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  pub email: Option<String>,
  pub phone: Option<String>,
  pub company: Option<String>,
  pub website: Option<String>,
  pub address: Option<String>,
  #[serde(default)]
  pub status: String,
  pub source: Option<String>,
  pub job_id: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
  /// Fields this client does not model, preserved as-is
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewLead {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub website: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
}

/// Partial update; only `Some` fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub company: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub website: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

impl LeadPatch {
  pub fn status(status: impl Into<String>) -> Self {
    Self {
      status: Some(status.into()),
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LeadFilter {
  pub status: Option<String>,
  pub tag: Option<String>,
  pub search: Option<String>,
  pub job_id: Option<String>,
}

impl LeadFilter {
  /// Query-string pairs for the present fields, in a fixed order.
  pub fn pairs(&self) -> Vec<(&'static str, &str)> {
    [
      ("status", self.status.as_deref()),
      ("tag", self.tag.as_deref()),
      ("search", self.search.as_deref()),
      ("job_id", self.job_id.as_deref()),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.map(|v| (name, v)))
    .collect()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadStats {
  #[serde(default)]
  pub total: u64,
  #[serde(default)]
  pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
  pub imported: u64,
  pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteSummary {
  pub deleted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUpdateSummary {
  pub updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
  #[serde(deserialize_with = "super::api_types::deserialize_id")]
  pub id: String,
  #[serde(deserialize_with = "super::api_types::deserialize_id")]
  pub lead_id: String,
  pub content: String,
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
  #[serde(deserialize_with = "super::api_types::deserialize_id")]
  pub id: String,
  pub name: String,
  pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTag {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub color: Option<String>,
}
