//! Serde-deserializable types matching the job service's responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::types::{Job, JobKind, JobStatus, ScrapedRecord};

/// Accept ids sent as either JSON strings or numbers.
pub fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::String(id) => Ok(id),
    Value::Number(id) => Ok(id.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

// ============================================================================
// Jobs
// ============================================================================

/// Job record as the service sends it (PascalCase keys).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiJob {
  #[serde(rename = "ID", deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(rename = "Type")]
  pub kind: JobKind,
  pub status: JobStatus,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub results_count: Option<u64>,
  #[serde(default)]
  pub error: Option<String>,
  #[serde(default)]
  pub date: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
}

impl From<ApiJob> for Job {
  fn from(job: ApiJob) -> Self {
    let parameters = match job.data {
      Some(Value::Object(map)) => map,
      _ => Map::new(),
    };
    Job {
      id: job.id,
      name: job.name,
      kind: job.kind,
      status: job.status,
      parameters,
      results_count: job.results_count.unwrap_or(0),
      error: job.error.filter(|e| !e.is_empty()),
      created_at: real_timestamp(job.date),
      updated_at: real_timestamp(job.updated_at),
      completed_at: real_timestamp(job.completed_at),
    }
  }
}

/// The service sends year-1 zero timestamps for unset times.
fn real_timestamp(at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
  at.filter(|at| at.year() > 1)
}

/// One element of `/jobs/{id}/results`.
#[derive(Debug, Deserialize)]
pub struct ApiResultRow {
  #[serde(default)]
  pub data: ScrapedRecord,
}

// ============================================================================
// Shared shapes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiCreated {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
}

/// Error body on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub code: Option<i64>,
  pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiImportRequest<'a> {
  pub job_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ApiBulkRequest<'a> {
  pub ids: &'a [String],
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct ApiNoteRequest<'a> {
  pub content: &'a str,
}
