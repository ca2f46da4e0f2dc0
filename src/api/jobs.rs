use reqwest::Method;
use tracing::{debug, info};

use super::api_types::{ApiCreated, ApiJob, ApiResultRow};
use super::transport::Transport;
use super::types::{Job, JobKind, JobSpec, ScrapedRecord};
use crate::error::{Error, Result, TransportError, TransportReason};

/// Job service wrapper: submit, track and collect scraping jobs.
#[derive(Clone)]
pub struct JobService {
  transport: Transport,
}

impl JobService {
  pub fn new(transport: Transport) -> Self {
    Self { transport }
  }

  /// Submit a job. Parameters are forwarded verbatim; the server validates them.
  pub async fn create(&self, spec: &JobSpec) -> Result<String> {
    let created: ApiCreated = self.transport.post("/jobs", spec).await?;
    info!(job_id = %created.id, kind = %spec.kind, "job submitted");
    Ok(created.id)
  }

  /// Get a single job by id
  pub async fn get(&self, id: &str) -> Result<Job> {
    let job: ApiJob = self
      .transport
      .get(&format!("/jobs/{}", id), &[])
      .await
      .map_err(|e| not_found("job", id, e))?;
    Ok(job.into())
  }

  /// List jobs, optionally only those of one kind
  pub async fn list(&self, kind: Option<&JobKind>) -> Result<Vec<Job>> {
    let query: Vec<(&str, &str)> = kind.map(|k| ("type", k.as_str())).into_iter().collect();
    // The service sends `null` rather than `[]` when there are no jobs.
    let jobs: Option<Vec<ApiJob>> = self.transport.get("/jobs", &query).await?;
    Ok(jobs.unwrap_or_default().into_iter().map(Job::from).collect())
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    self
      .transport
      .send_empty(Method::DELETE, &format!("/jobs/{}", id))
      .await
      .map_err(|e| not_found("job", id, e))?;
    info!(job_id = id, "job deleted");
    Ok(())
  }

  /// Scraped rows, unwrapped from their `{data}` envelopes
  pub async fn results(&self, id: &str) -> Result<Vec<ScrapedRecord>> {
    let rows: Option<Vec<ApiResultRow>> = self
      .transport
      .get(&format!("/jobs/{}/results", id), &[])
      .await
      .map_err(|e| not_found("job", id, e))?;
    Ok(rows.unwrap_or_default().into_iter().map(|row| row.data).collect())
  }

  /// Results as the service's CSV export
  pub async fn download_results(&self, id: &str) -> Result<Vec<u8>> {
    let bytes = self
      .transport
      .send_bytes(Method::GET, &format!("/jobs/{}/download", id))
      .await
      .map_err(|e| not_found("job", id, e))?;
    debug!(job_id = id, size = bytes.len(), "downloaded results");
    Ok(bytes)
  }

  /// Job kinds the service can run. Failure yields an empty list.
  pub async fn scrapers(&self) -> Vec<String> {
    match self
      .transport
      .get::<Option<Vec<String>>>("/scrapers", &[])
      .await
    {
      Ok(kinds) => kinds.unwrap_or_default(),
      Err(e) => {
        debug!(error = %e, "scraper listing unavailable");
        Vec::new()
      }
    }
  }

  /// Whether the service answers. Failure means unavailable, not an error.
  pub async fn health(&self) -> bool {
    match self.transport.send::<()>(Method::GET, "/health", &[], None).await {
      Ok(_) => true,
      // A success status with a non-JSON body still means the service is up.
      Err(TransportError {
        reason: TransportReason::Decode,
        ..
      }) => true,
      Err(e) => {
        debug!(error = %e, "health probe failed");
        false
      }
    }
  }
}

/// Map a 404 on an id-addressed call to a logical absence.
pub(super) fn not_found(resource: &'static str, id: &str, error: TransportError) -> Error {
  if error.is_not_found() {
    Error::NotFound {
      resource,
      id: id.to_string(),
    }
  } else {
    error.into()
  }
}
