use reqwest::Method;
use tracing::info;

use super::api_types::{ApiBulkRequest, ApiCreated, ApiImportRequest, ApiNoteRequest};
use super::jobs::not_found;
use super::transport::Transport;
use super::types::{
  BulkDeleteSummary, BulkUpdateSummary, ImportSummary, Lead, LeadFilter, LeadPatch, LeadStats,
  NewLead, NewTag, Note, Tag,
};
use crate::error::Result;

/// Lead service wrapper: leads plus their notes and tags.
#[derive(Clone)]
pub struct LeadService {
  transport: Transport,
}

impl LeadService {
  pub fn new(transport: Transport) -> Self {
    Self { transport }
  }

  pub async fn create(&self, lead: &NewLead) -> Result<String> {
    let created: ApiCreated = self.transport.post("/leads", lead).await?;
    Ok(created.id)
  }

  pub async fn get(&self, id: &str) -> Result<Lead> {
    self
      .transport
      .get(&format!("/leads/{}", id), &[])
      .await
      .map_err(|e| not_found("lead", id, e))
  }

  pub async fn list(&self, filter: &LeadFilter) -> Result<Vec<Lead>> {
    let leads: Option<Vec<Lead>> = self.transport.get("/leads", &filter.pairs()).await?;
    Ok(leads.unwrap_or_default())
  }

  pub async fn update(&self, id: &str, patch: &LeadPatch) -> Result<Lead> {
    self
      .transport
      .patch(&format!("/leads/{}", id), patch)
      .await
      .map_err(|e| not_found("lead", id, e))
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    self
      .transport
      .send_empty(Method::DELETE, &format!("/leads/{}", id))
      .await
      .map_err(|e| not_found("lead", id, e))
  }

  pub async fn stats(&self) -> Result<LeadStats> {
    Ok(self.transport.get("/leads/stats", &[]).await?)
  }

  /// Turn a finished job's scraped rows into leads.
  pub async fn import_from_job(&self, job_id: &str) -> Result<ImportSummary> {
    let summary: ImportSummary = self
      .transport
      .post("/leads/import", &ApiImportRequest { job_id })
      .await
      .map_err(|e| not_found("job", job_id, e))?;
    info!(
      job_id,
      imported = summary.imported,
      total = summary.total,
      "imported leads"
    );
    Ok(summary)
  }

  /// Ids already gone server-side are not an error; `deleted` counts what was removed.
  pub async fn bulk_delete(&self, ids: &[String]) -> Result<BulkDeleteSummary> {
    let request = ApiBulkRequest { ids, status: None };
    Ok(self.transport.post("/leads/bulk/delete", &request).await?)
  }

  pub async fn bulk_update_status(&self, ids: &[String], status: &str) -> Result<BulkUpdateSummary> {
    let request = ApiBulkRequest {
      ids,
      status: Some(status),
    };
    Ok(self.transport.post("/leads/bulk/status", &request).await?)
  }

  // ==========================================================================
  // Notes
  // ==========================================================================

  pub async fn notes(&self, lead_id: &str) -> Result<Vec<Note>> {
    let notes: Option<Vec<Note>> = self
      .transport
      .get(&format!("/leads/{}/notes", lead_id), &[])
      .await
      .map_err(|e| not_found("lead", lead_id, e))?;
    Ok(notes.unwrap_or_default())
  }

  pub async fn add_note(&self, lead_id: &str, content: &str) -> Result<Note> {
    self
      .transport
      .post(
        &format!("/leads/{}/notes", lead_id),
        &ApiNoteRequest { content },
      )
      .await
      .map_err(|e| not_found("lead", lead_id, e))
  }

  pub async fn delete_note(&self, lead_id: &str, note_id: &str) -> Result<()> {
    self
      .transport
      .send_empty(
        Method::DELETE,
        &format!("/leads/{}/notes/{}", lead_id, note_id),
      )
      .await
      .map_err(|e| not_found("note", note_id, e))
  }

  // ==========================================================================
  // Tags
  // ==========================================================================

  pub async fn tags(&self) -> Result<Vec<Tag>> {
    let tags: Option<Vec<Tag>> = self.transport.get("/tags", &[]).await?;
    Ok(tags.unwrap_or_default())
  }

  pub async fn create_tag(&self, tag: &NewTag) -> Result<Tag> {
    Ok(self.transport.post("/tags", tag).await?)
  }

  pub async fn delete_tag(&self, tag_id: &str) -> Result<()> {
    self
      .transport
      .send_empty(Method::DELETE, &format!("/tags/{}", tag_id))
      .await
      .map_err(|e| not_found("tag", tag_id, e))
  }

  pub async fn tag_lead(&self, lead_id: &str, tag_id: &str) -> Result<()> {
    self
      .transport
      .send_empty(Method::POST, &format!("/leads/{}/tags/{}", lead_id, tag_id))
      .await
      .map_err(|e| not_found("lead", lead_id, e))
  }

  pub async fn untag_lead(&self, lead_id: &str, tag_id: &str) -> Result<()> {
    self
      .transport
      .send_empty(Method::DELETE, &format!("/leads/{}/tags/{}", lead_id, tag_id))
      .await
      .map_err(|e| not_found("lead", lead_id, e))
  }
}
