//! Writes: run the operation, invalidate what it affected, then notify.

use std::future::Future;

use tracing::{info, warn};

use crate::api::keys::{CrmQuery, JOBS, LEADS, LEAD_NOTES, TAGS};
use crate::cache::{KeyPattern, QueryCache};
use crate::error::{Error, MutationError, Result};
use crate::notify::{Notification, Notifier};

/// Every write the client can perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
  SubmitJob,
  DeleteJob { job_id: String },
  CreateLead,
  UpdateLead { lead_id: String },
  DeleteLead { lead_id: String },
  BulkDeleteLeads,
  BulkUpdateLeadStatus,
  ImportLeadsFromJob { job_id: String },
  AddNote { lead_id: String },
  DeleteNote { lead_id: String },
  CreateTag,
  DeleteTag,
  TagLead { lead_id: String },
  UntagLead { lead_id: String },
}

impl Mutation {
  /// Cached reads a successful write makes stale.
  ///
  /// Bulk operations invalidate the whole lead family rather than the
  /// individual ids they touched.
  pub fn invalidation_set(&self) -> Vec<KeyPattern> {
    let leads = || KeyPattern::family(LEADS);
    let stats = || CrmQuery::LeadStats.pattern();
    match self {
      Self::SubmitJob => vec![KeyPattern::family(JOBS)],
      Self::DeleteJob { job_id } => vec![
        KeyPattern::family(JOBS),
        CrmQuery::Job { id: job_id.clone() }.pattern(),
        CrmQuery::JobResults { id: job_id.clone() }.pattern(),
      ],
      Self::CreateLead
      | Self::BulkDeleteLeads
      | Self::BulkUpdateLeadStatus
      | Self::ImportLeadsFromJob { .. } => vec![leads(), stats()],
      Self::UpdateLead { lead_id } | Self::DeleteLead { lead_id } => vec![
        leads(),
        stats(),
        CrmQuery::Lead {
          id: lead_id.clone(),
        }
        .pattern(),
      ],
      Self::AddNote { lead_id } | Self::DeleteNote { lead_id } => {
        vec![KeyPattern::family_with(LEAD_NOTES, "lead_id", lead_id)]
      }
      Self::CreateTag => vec![KeyPattern::family(TAGS)],
      Self::DeleteTag => vec![KeyPattern::family(TAGS), leads()],
      Self::TagLead { lead_id } | Self::UntagLead { lead_id } => vec![
        CrmQuery::Lead {
          id: lead_id.clone(),
        }
        .pattern(),
        leads(),
      ],
    }
  }

  pub fn success_title(&self) -> &'static str {
    match self {
      Self::SubmitJob => "Job submitted",
      Self::DeleteJob { .. } => "Job deleted",
      Self::CreateLead => "Lead created",
      Self::UpdateLead { .. } => "Lead updated",
      Self::DeleteLead { .. } => "Lead deleted",
      Self::BulkDeleteLeads => "Leads deleted",
      Self::BulkUpdateLeadStatus => "Lead status updated",
      Self::ImportLeadsFromJob { .. } => "Leads imported",
      Self::AddNote { .. } => "Note added",
      Self::DeleteNote { .. } => "Note deleted",
      Self::CreateTag => "Tag created",
      Self::DeleteTag => "Tag deleted",
      Self::TagLead { .. } => "Tag added",
      Self::UntagLead { .. } => "Tag removed",
    }
  }

  pub fn failure_title(&self) -> &'static str {
    match self {
      Self::SubmitJob => "Failed to submit job",
      Self::DeleteJob { .. } => "Failed to delete job",
      Self::CreateLead => "Failed to create lead",
      Self::UpdateLead { .. } => "Failed to update lead",
      Self::DeleteLead { .. } => "Failed to delete lead",
      Self::BulkDeleteLeads => "Failed to delete leads",
      Self::BulkUpdateLeadStatus => "Failed to update lead status",
      Self::ImportLeadsFromJob { .. } => "Failed to import leads",
      Self::AddNote { .. } => "Failed to add note",
      Self::DeleteNote { .. } => "Failed to delete note",
      Self::CreateTag => "Failed to create tag",
      Self::DeleteTag => "Failed to delete tag",
      Self::TagLead { .. } => "Failed to tag lead",
      Self::UntagLead { .. } => "Failed to untag lead",
    }
  }
}

/// Runs writes and keeps the cache consistent with them.
///
/// Invalidation always happens before the success notification is
/// published, so a consumer reacting to the notification reads fresh data.
#[derive(Clone)]
pub struct MutationCoordinator {
  cache: QueryCache,
  notifier: Notifier,
}

impl MutationCoordinator {
  pub fn new(cache: QueryCache, notifier: Notifier) -> Self {
    Self { cache, notifier }
  }

  pub fn notifier(&self) -> &Notifier {
    &self.notifier
  }

  pub async fn mutate<T, Fut>(&self, mutation: Mutation, operation: Fut) -> Result<T, MutationError>
  where
    Fut: Future<Output = Result<T>>,
  {
    self.mutate_with(mutation, operation, |_| None).await
  }

  /// Like [`mutate`](Self::mutate), with a success description built from the result.
  pub async fn mutate_with<T, Fut, D>(
    &self,
    mutation: Mutation,
    operation: Fut,
    describe: D,
  ) -> Result<T, MutationError>
  where
    Fut: Future<Output = Result<T>>,
    D: FnOnce(&T) -> Option<String>,
  {
    match operation.await {
      Ok(value) => {
        let invalidated: usize = mutation
          .invalidation_set()
          .iter()
          .map(|pattern| self.cache.invalidate(pattern))
          .sum();
        info!(?mutation, invalidated, "mutation applied");

        let mut notification = Notification::success(mutation.success_title());
        notification.description = describe(&value);
        self.notifier.publish(notification);
        Ok(value)
      }
      Err(source) => {
        let error = MutationError::new(mutation, source);
        warn!(mutation = ?error.mutation, error = %error.description, "mutation failed");
        self
          .notifier
          .publish(Notification::failure(error.title(), error.description.clone()));
        Err(error)
      }
    }
  }

  /// Publish a failure for a non-mutating action, such as a download.
  pub fn report(&self, title: &str, error: &Error) {
    warn!(title, error = %error, "operation failed");
    self
      .notifier
      .publish(Notification::failure(title, error.to_string()));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::keys::LEAD;
  use crate::cache::{EntryStatus, QueryKey, ReadOptions};
  use crate::error::TransportError;
  use crate::notify::Level;

  async fn seed(cache: &QueryCache, key: &QueryKey) {
    cache
      .read(key, || async { Ok::<_, Error>(1u32) }, ReadOptions::new())
      .await
      .unwrap();
  }

  #[test]
  fn test_bulk_writes_invalidate_the_whole_lead_family() {
    let set = Mutation::BulkDeleteLeads.invalidation_set();
    let filtered = CrmQuery::Leads {
      filter: crate::api::types::LeadFilter {
        status: Some("new".into()),
        ..Default::default()
      },
    }
    .key();

    assert!(set.iter().any(|p| p.matches(&filtered)));
    assert!(set.iter().any(|p| p.matches(&CrmQuery::LeadStats.key())));
    assert!(!set.iter().any(|p| p.matches(&CrmQuery::Tags.key())));
  }

  #[test]
  fn test_note_writes_only_touch_that_leads_notes() {
    let set = Mutation::AddNote {
      lead_id: "L1".into(),
    }
    .invalidation_set();

    assert_eq!(set.len(), 1);
    assert!(set[0].matches(&CrmQuery::LeadNotes {
      lead_id: "L1".into()
    }
    .key()));
    assert!(!set[0].matches(&CrmQuery::LeadNotes {
      lead_id: "L2".into()
    }
    .key()));
  }

  #[test]
  fn test_delete_job_invalidates_detail_and_results() {
    let set = Mutation::DeleteJob {
      job_id: "J1".into(),
    }
    .invalidation_set();
    for query in [
      CrmQuery::Jobs { kind: None },
      CrmQuery::Job { id: "J1".into() },
      CrmQuery::JobResults { id: "J1".into() },
    ] {
      assert!(set.iter().any(|p| p.matches(&query.key())), "{:?}", query);
    }
  }

  #[tokio::test]
  async fn test_success_invalidates_before_notifying() {
    let cache = QueryCache::new();
    let notifier = Notifier::new();
    let coordinator = MutationCoordinator::new(cache.clone(), notifier.clone());
    let lead = QueryKey::new(LEAD).with("id", "L1");
    seed(&cache, &lead).await;

    let mut rx = notifier.subscribe();
    let updated = coordinator
      .mutate(
        Mutation::UpdateLead {
          lead_id: "L1".into(),
        },
        async { Ok("L1") },
      )
      .await
      .unwrap();

    assert_eq!(updated, "L1");
    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.level, Level::Success);
    assert_eq!(notification.title, "Lead updated");
    assert_eq!(cache.status(&lead), EntryStatus::Stale);
  }

  #[tokio::test]
  async fn test_failure_leaves_cache_untouched() {
    let cache = QueryCache::new();
    let notifier = Notifier::new();
    let coordinator = MutationCoordinator::new(cache.clone(), notifier.clone());
    let stats = CrmQuery::LeadStats.key();
    seed(&cache, &stats).await;

    let mut rx = notifier.subscribe();
    let err = coordinator
      .mutate(
        Mutation::CreateLead,
        async { Err::<(), _>(TransportError::status(422, None, "email is invalid").into()) },
      )
      .await
      .unwrap_err();

    assert_eq!(err.title(), "Failed to create lead");
    assert_eq!(err.description, "email is invalid");
    assert_eq!(cache.status(&stats), EntryStatus::Fresh);

    let notification = rx.recv().await.unwrap();
    assert!(notification.is_failure());
    assert_eq!(notification.description.as_deref(), Some("email is invalid"));
  }

  #[tokio::test]
  async fn test_describe_fills_success_description() {
    let notifier = Notifier::new();
    let coordinator = MutationCoordinator::new(QueryCache::new(), notifier.clone());
    let mut rx = notifier.subscribe();

    coordinator
      .mutate_with(
        Mutation::ImportLeadsFromJob {
          job_id: "J1".into(),
        },
        async { Ok(12u64) },
        |imported| Some(format!("{} leads imported", imported)),
      )
      .await
      .unwrap();

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.description.as_deref(), Some("12 leads imported"));
  }
}
