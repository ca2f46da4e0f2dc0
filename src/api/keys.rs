//! Query keys for the job service's read operations.

use crate::cache::{KeyPattern, QueryKey};

use super::types::{JobKind, LeadFilter};

pub const JOBS: &str = "jobs";
pub const JOB: &str = "job";
pub const JOB_RESULTS: &str = "jobResults";
pub const SCRAPERS: &str = "scrapers";
pub const HEALTH: &str = "health";
pub const LEADS: &str = "leads";
pub const LEAD: &str = "lead";
pub const LEAD_STATS: &str = "leadStats";
pub const LEAD_NOTES: &str = "leadNotes";
pub const TAGS: &str = "tags";

/// Every cached read the client performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrmQuery {
  /// List jobs, optionally of one kind
  Jobs { kind: Option<JobKind> },
  Job { id: String },
  JobResults { id: String },
  Scrapers,
  Health,
  /// List leads matching a filter
  Leads { filter: LeadFilter },
  Lead { id: String },
  LeadStats,
  LeadNotes { lead_id: String },
  Tags,
}

impl CrmQuery {
  pub fn key(&self) -> QueryKey {
    match self {
      Self::Jobs { kind } => QueryKey::new(JOBS).with_opt("type", kind.as_ref()),
      Self::Job { id } => QueryKey::new(JOB).with("id", id),
      Self::JobResults { id } => QueryKey::new(JOB_RESULTS).with("id", id),
      Self::Scrapers => QueryKey::new(SCRAPERS),
      Self::Health => QueryKey::new(HEALTH),
      Self::Leads { filter } => QueryKey::new(LEADS)
        .with_opt("status", filter.status.as_deref())
        .with_opt("tag", filter.tag.as_deref())
        .with_opt("search", filter.search.as_deref())
        .with_opt("job_id", filter.job_id.as_deref()),
      Self::Lead { id } => QueryKey::new(LEAD).with("id", id),
      Self::LeadStats => QueryKey::new(LEAD_STATS),
      Self::LeadNotes { lead_id } => QueryKey::new(LEAD_NOTES).with("lead_id", lead_id),
      Self::Tags => QueryKey::new(TAGS),
    }
  }

  /// The exact-key pattern for this query.
  pub fn pattern(&self) -> KeyPattern {
    KeyPattern::Exact(self.key())
  }
}
