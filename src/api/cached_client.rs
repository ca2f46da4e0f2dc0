//! Cached client that routes reads through the query cache and writes
//! through the mutation coordinator.

use std::time::Duration;

use futures::stream::{self, Stream};
use tracing::debug;

use crate::cache::{CacheEvent, QueryCache, ReadOptions, Snapshot, Subscription};
use crate::config::Config;
use crate::error::{Error, MutationError, Result};
use crate::mutation::{Mutation, MutationCoordinator};
use crate::notify::Notifier;
use crate::poller::PollingController;

use super::jobs::JobService;
use super::keys::CrmQuery;
use super::leads::LeadService;
use super::transport::Transport;
use super::types::{
  BulkDeleteSummary, BulkUpdateSummary, Download, ImportSummary, Job, JobKind, JobSpec, Lead,
  LeadFilter, LeadPatch, LeadStats, NewLead, NewTag, Note, ScrapedRecord, Tag,
};

/// Job service client with transparent caching, polling and invalidation.
///
/// Clones share the cache, so every consumer in the process sees the same
/// entries and the same in-flight fetches.
#[derive(Clone)]
pub struct CachedClient {
  jobs: JobService,
  leads: LeadService,
  cache: QueryCache,
  poller: PollingController,
  mutations: MutationCoordinator,
}

impl CachedClient {
  pub fn new(config: &Config) -> Result<Self> {
    let transport = Transport::new(
      &config.api.base_url,
      config.api.timeout(),
      Config::get_api_token(),
    )?;
    let cache = QueryCache::with_stale_time(Duration::from_secs(config.cache.stale_secs));
    let poller = PollingController::from_config(&config.polling);
    Ok(Self::from_parts(transport, cache, poller))
  }

  pub fn from_parts(transport: Transport, cache: QueryCache, poller: PollingController) -> Self {
    let mutations = MutationCoordinator::new(cache.clone(), Notifier::new());
    Self {
      jobs: JobService::new(transport.clone()),
      leads: LeadService::new(transport),
      cache,
      poller,
      mutations,
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn notifier(&self) -> &Notifier {
    self.mutations.notifier()
  }

  /// Attach to a query so its refresh schedule keeps running.
  pub fn subscribe(&self, query: &CrmQuery) -> Subscription {
    self.cache.subscribe(&query.key())
  }

  pub fn shutdown(&self) {
    self.cache.shutdown();
  }

  // ==========================================================================
  // Job reads
  // ==========================================================================

  pub async fn jobs(&self, kind: Option<JobKind>) -> Result<Snapshot<Vec<Job>>> {
    let key = CrmQuery::Jobs { kind: kind.clone() }.key();
    let service = self.jobs.clone();
    self
      .cache
      .read(
        &key,
        move || {
          let service = service.clone();
          let kind = kind.clone();
          async move { service.list(kind.as_ref()).await }
        },
        ReadOptions::new().refresh(self.poller.job_list()),
      )
      .await
  }

  pub async fn job(&self, id: &str) -> Result<Snapshot<Job>> {
    let key = CrmQuery::Job { id: id.to_string() }.key();
    let service = self.jobs.clone();
    let id = id.to_string();
    self
      .cache
      .read(
        &key,
        move || {
          let service = service.clone();
          let id = id.clone();
          async move { service.get(&id).await }
        },
        ReadOptions::new().refresh(self.poller.job_detail()),
      )
      .await
  }

  pub async fn job_results(&self, id: &str) -> Result<Snapshot<Vec<ScrapedRecord>>> {
    let key = CrmQuery::JobResults { id: id.to_string() }.key();
    let service = self.jobs.clone();
    let id = id.to_string();
    self
      .cache
      .read(
        &key,
        move || {
          let service = service.clone();
          let id = id.clone();
          async move { service.results(&id).await }
        },
        ReadOptions::new(),
      )
      .await
  }

  pub async fn scrapers(&self) -> Result<Snapshot<Vec<String>>> {
    let service = self.jobs.clone();
    self
      .cache
      .read(
        &CrmQuery::Scrapers.key(),
        move || {
          let service = service.clone();
          async move { Ok::<_, Error>(service.scrapers().await) }
        },
        ReadOptions::new(),
      )
      .await
  }

  pub async fn health(&self) -> Result<Snapshot<bool>> {
    let service = self.jobs.clone();
    let interval = self.poller.health_interval();
    self
      .cache
      .read(
        &CrmQuery::Health.key(),
        move || {
          let service = service.clone();
          async move { Ok::<_, Error>(service.health().await) }
        },
        ReadOptions::new()
          .stale_time(interval)
          .refresh(self.poller.health()),
      )
      .await
  }

  /// Stream a job's state until it settles.
  ///
  /// Yields the current job, then every refreshed snapshot. Ends after a
  /// terminal status or once the job is gone; transient fetch failures are
  /// yielded and polling continues.
  pub fn watch_job(&self, id: &str) -> impl Stream<Item = Result<Job>> + Send + 'static {
    let watch = JobWatch {
      client: self.clone(),
      id: id.to_string(),
      subscription: None,
      done: false,
    };
    stream::unfold(watch, |mut watch| async move {
      if watch.done {
        return None;
      }
      let item = watch.next().await?;
      watch.done = match &item {
        Ok(job) => job.is_terminal(),
        Err(error) => error.is_not_found(),
      };
      Some((item, watch))
    })
  }

  // ==========================================================================
  // Lead reads
  // ==========================================================================

  pub async fn leads(&self, filter: LeadFilter) -> Result<Snapshot<Vec<Lead>>> {
    let key = CrmQuery::Leads {
      filter: filter.clone(),
    }
    .key();
    let service = self.leads.clone();
    self
      .cache
      .read(
        &key,
        move || {
          let service = service.clone();
          let filter = filter.clone();
          async move { service.list(&filter).await }
        },
        ReadOptions::new(),
      )
      .await
  }

  pub async fn lead(&self, id: &str) -> Result<Snapshot<Lead>> {
    let key = CrmQuery::Lead { id: id.to_string() }.key();
    let service = self.leads.clone();
    let id = id.to_string();
    self
      .cache
      .read(
        &key,
        move || {
          let service = service.clone();
          let id = id.clone();
          async move { service.get(&id).await }
        },
        ReadOptions::new(),
      )
      .await
  }

  pub async fn lead_stats(&self) -> Result<Snapshot<LeadStats>> {
    let service = self.leads.clone();
    self
      .cache
      .read(
        &CrmQuery::LeadStats.key(),
        move || {
          let service = service.clone();
          async move { service.stats().await }
        },
        ReadOptions::new(),
      )
      .await
  }

  pub async fn lead_notes(&self, lead_id: &str) -> Result<Snapshot<Vec<Note>>> {
    let key = CrmQuery::LeadNotes {
      lead_id: lead_id.to_string(),
    }
    .key();
    let service = self.leads.clone();
    let lead_id = lead_id.to_string();
    self
      .cache
      .read(
        &key,
        move || {
          let service = service.clone();
          let lead_id = lead_id.clone();
          async move { service.notes(&lead_id).await }
        },
        ReadOptions::new(),
      )
      .await
  }

  pub async fn tags(&self) -> Result<Snapshot<Vec<Tag>>> {
    let service = self.leads.clone();
    self
      .cache
      .read(
        &CrmQuery::Tags.key(),
        move || {
          let service = service.clone();
          async move { service.tags().await }
        },
        ReadOptions::new(),
      )
      .await
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  pub async fn submit_job(&self, spec: &JobSpec) -> Result<String, MutationError> {
    self
      .mutations
      .mutate(Mutation::SubmitJob, self.jobs.create(spec))
      .await
  }

  pub async fn delete_job(&self, id: &str) -> Result<(), MutationError> {
    let mutation = Mutation::DeleteJob {
      job_id: id.to_string(),
    };
    self.mutations.mutate(mutation, self.jobs.delete(id)).await
  }

  /// Fetch a job's CSV export. Failure is reported as a notification and
  /// produces no file.
  pub async fn download_results(&self, job: &Job) -> Result<Download> {
    match self.jobs.download_results(&job.id).await {
      Ok(bytes) => Ok(Download {
        file_name: job.download_file_name(),
        bytes,
      }),
      Err(error) => {
        self.mutations.report("Download failed", &error);
        Err(error)
      }
    }
  }

  pub async fn create_lead(&self, lead: &NewLead) -> Result<String, MutationError> {
    self
      .mutations
      .mutate(Mutation::CreateLead, self.leads.create(lead))
      .await
  }

  pub async fn update_lead(&self, id: &str, patch: &LeadPatch) -> Result<Lead, MutationError> {
    let mutation = Mutation::UpdateLead {
      lead_id: id.to_string(),
    };
    self.mutations.mutate(mutation, self.leads.update(id, patch)).await
  }

  pub async fn delete_lead(&self, id: &str) -> Result<(), MutationError> {
    let mutation = Mutation::DeleteLead {
      lead_id: id.to_string(),
    };
    self.mutations.mutate(mutation, self.leads.delete(id)).await
  }

  pub async fn bulk_delete_leads(&self, ids: &[String]) -> Result<BulkDeleteSummary, MutationError> {
    self
      .mutations
      .mutate_with(
        Mutation::BulkDeleteLeads,
        self.leads.bulk_delete(ids),
        |summary| Some(format!("{} of {} deleted", summary.deleted, ids.len())),
      )
      .await
  }

  pub async fn bulk_update_lead_status(
    &self,
    ids: &[String],
    status: &str,
  ) -> Result<BulkUpdateSummary, MutationError> {
    self
      .mutations
      .mutate_with(
        Mutation::BulkUpdateLeadStatus,
        self.leads.bulk_update_status(ids, status),
        |summary| Some(format!("{} set to {}", summary.updated, status)),
      )
      .await
  }

  pub async fn import_leads_from_job(&self, job_id: &str) -> Result<ImportSummary, MutationError> {
    let mutation = Mutation::ImportLeadsFromJob {
      job_id: job_id.to_string(),
    };
    self
      .mutations
      .mutate_with(mutation, self.leads.import_from_job(job_id), |summary| {
        Some(format!("{} of {} records imported", summary.imported, summary.total))
      })
      .await
  }

  pub async fn add_note(&self, lead_id: &str, content: &str) -> Result<Note, MutationError> {
    let mutation = Mutation::AddNote {
      lead_id: lead_id.to_string(),
    };
    self
      .mutations
      .mutate(mutation, self.leads.add_note(lead_id, content))
      .await
  }

  pub async fn delete_note(&self, lead_id: &str, note_id: &str) -> Result<(), MutationError> {
    let mutation = Mutation::DeleteNote {
      lead_id: lead_id.to_string(),
    };
    self
      .mutations
      .mutate(mutation, self.leads.delete_note(lead_id, note_id))
      .await
  }

  pub async fn create_tag(&self, tag: &NewTag) -> Result<Tag, MutationError> {
    self
      .mutations
      .mutate(Mutation::CreateTag, self.leads.create_tag(tag))
      .await
  }

  pub async fn delete_tag(&self, tag_id: &str) -> Result<(), MutationError> {
    self
      .mutations
      .mutate(Mutation::DeleteTag, self.leads.delete_tag(tag_id))
      .await
  }

  pub async fn tag_lead(&self, lead_id: &str, tag_id: &str) -> Result<(), MutationError> {
    let mutation = Mutation::TagLead {
      lead_id: lead_id.to_string(),
    };
    self
      .mutations
      .mutate(mutation, self.leads.tag_lead(lead_id, tag_id))
      .await
  }

  pub async fn untag_lead(&self, lead_id: &str, tag_id: &str) -> Result<(), MutationError> {
    let mutation = Mutation::UntagLead {
      lead_id: lead_id.to_string(),
    };
    self
      .mutations
      .mutate(mutation, self.leads.untag_lead(lead_id, tag_id))
      .await
  }
}

/// State behind [`CachedClient::watch_job`].
struct JobWatch {
  client: CachedClient,
  id: String,
  subscription: Option<Subscription>,
  done: bool,
}

impl JobWatch {
  async fn next(&mut self) -> Option<Result<Job>> {
    if self.subscription.is_none() {
      // First poll: read, then attach so the refresh timer starts from that read.
      let first = self.client.job(&self.id).await.map(Snapshot::into_inner);
      self.subscription = Some(self.client.subscribe(&CrmQuery::Job {
        id: self.id.clone(),
      }));
      return Some(first);
    }
    let subscription = self.subscription.as_mut()?;

    loop {
      match subscription.changed().await? {
        CacheEvent::Updated { seq } => match self.client.cache.get::<Job>(subscription.key()) {
          Ok(Some(snapshot)) => return Some(Ok(snapshot.into_inner())),
          Ok(None) => debug!(job_id = %self.id, seq, "update without a value"),
          Err(error) => return Some(Err(error)),
        },
        CacheEvent::Errored { error, .. } => return Some(Err(error)),
        CacheEvent::Idle | CacheEvent::Loading | CacheEvent::Stale => {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryStatus;
  use crate::notify::Level;
  use futures::StreamExt;
  use mockito::{Matcher, Server};
  use serde_json::json;

  fn client(server: &Server) -> CachedClient {
    let transport = Transport::new(&server.url(), Duration::from_secs(5), None).unwrap();
    CachedClient::from_parts(
      transport,
      QueryCache::with_stale_time(Duration::from_secs(60)),
      PollingController::default(),
    )
  }

  fn api_job(status: &str) -> String {
    json!({
      "ID": "J1",
      "Name": "Acme Search",
      "Type": "google_maps",
      "Status": status,
      "Data": { "location": "NYC" },
    })
    .to_string()
  }

  #[tokio::test]
  async fn test_update_then_read_sees_the_update() {
    let mut server = Server::new_async().await;
    let before = server
      .mock("GET", "/leads")
      .with_status(200)
      .with_body(r#"[{"id": "L1", "name": "Joe's Pizza", "status": "new"}]"#)
      .expect(1)
      .create_async()
      .await;
    server
      .mock("PATCH", "/leads/L1")
      .with_status(200)
      .with_body(r#"{"id": "L1", "name": "Joe's Pizza", "status": "closed"}"#)
      .create_async()
      .await;

    let client = client(&server);
    let initial = client.leads(LeadFilter::default()).await.unwrap();
    assert_eq!(initial[0].status, "new");

    // Within the staleness window a second read is served from cache.
    let cached = client.leads(LeadFilter::default()).await.unwrap();
    assert!(cached.is_fresh());
    before.assert_async().await;
    before.remove_async().await;

    server
      .mock("GET", "/leads")
      .with_status(200)
      .with_body(r#"[{"id": "L1", "name": "Joe's Pizza", "status": "closed"}]"#)
      .create_async()
      .await;

    client
      .update_lead("L1", &LeadPatch::status("closed"))
      .await
      .unwrap();
    let after = client.leads(LeadFilter::default()).await.unwrap();
    assert_eq!(after[0].status, "closed");
  }

  #[tokio::test]
  async fn test_bulk_delete_with_missing_id_invalidates_lists_and_stats() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/leads")
      .with_status(200)
      .with_body(r#"[{"id": "L1", "name": "A", "status": "new"}]"#)
      .create_async()
      .await;
    server
      .mock("GET", "/leads/stats")
      .with_status(200)
      .with_body(r#"{"total": 1, "by_status": {"new": 1}}"#)
      .create_async()
      .await;
    server
      .mock("POST", "/leads/bulk/delete")
      .match_body(Matcher::Json(json!({ "ids": ["L1", "L404"] })))
      .with_status(200)
      .with_body(r#"{"deleted": 1}"#)
      .create_async()
      .await;

    let client = client(&server);
    client.leads(LeadFilter::default()).await.unwrap();
    client.lead_stats().await.unwrap();
    let mut notifications = client.notifier().subscribe();

    let ids = vec!["L1".to_string(), "L404".to_string()];
    let summary = client.bulk_delete_leads(&ids).await.unwrap();

    assert_eq!(summary.deleted, 1);
    let leads_key = CrmQuery::Leads {
      filter: LeadFilter::default(),
    }
    .key();
    assert_eq!(client.cache().status(&leads_key), EntryStatus::Stale);
    assert_eq!(
      client.cache().status(&CrmQuery::LeadStats.key()),
      EntryStatus::Stale
    );
    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.title, "Leads deleted");
    assert_eq!(notification.description.as_deref(), Some("1 of 2 deleted"));
  }

  #[tokio::test]
  async fn test_failed_download_notifies_and_produces_nothing() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/jobs/J1/download")
      .with_status(500)
      .with_body(r#"{"code": 500, "message": "export unavailable"}"#)
      .create_async()
      .await;
    server
      .mock("GET", "/jobs/J1")
      .with_status(200)
      .with_body(api_job("ok"))
      .create_async()
      .await;

    let client = client(&server);
    let job = client.job("J1").await.unwrap().into_inner();
    let mut notifications = client.notifier().subscribe();

    let result = client.download_results(&job).await;

    assert!(result.is_err());
    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.level, Level::Failure);
    assert_eq!(notification.title, "Download failed");
    assert_eq!(notification.description.as_deref(), Some("export unavailable"));
  }

  #[tokio::test]
  async fn test_download_names_file_after_job() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/jobs/J1/download")
      .with_status(200)
      .with_body("name,phone\nA,555-0100\n")
      .create_async()
      .await;
    server
      .mock("GET", "/jobs/J1")
      .with_status(200)
      .with_body(api_job("ok"))
      .create_async()
      .await;

    let client = client(&server);
    let job = client.job("J1").await.unwrap().into_inner();
    let download = client.download_results(&job).await.unwrap();

    assert_eq!(download.file_name, "Acme_Search_results.csv");
    assert!(download.bytes.starts_with(b"name,phone"));
  }

  #[tokio::test]
  async fn test_watch_ends_on_terminal_job() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/jobs/J1")
      .with_status(200)
      .with_body(api_job("ok"))
      .create_async()
      .await;

    let client = client(&server);
    let seen: Vec<_> = client.watch_job("J1").collect().await;

    assert_eq!(seen.len(), 1);
    assert!(seen[0].as_ref().unwrap().is_terminal());
    assert_eq!(client.cache().stats().timers, 0);
  }

  #[tokio::test]
  async fn test_watch_ends_when_job_is_gone() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/jobs/J9")
      .with_status(404)
      .create_async()
      .await;

    let client = client(&server);
    let seen: Vec<_> = client.watch_job("J9").collect().await;

    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Err(Error::NotFound { resource: "job", .. })));
  }

  #[tokio::test]
  async fn test_failed_mutation_is_tagged() {
    let mut server = Server::new_async().await;
    server
      .mock("DELETE", "/jobs/J1")
      .with_status(409)
      .with_body(r#"{"code": 7, "message": "job is running"}"#)
      .create_async()
      .await;

    let err = client(&server).delete_job("J1").await.unwrap_err();
    assert_eq!(err.to_string(), "Failed to delete job: job is running");
  }
}
