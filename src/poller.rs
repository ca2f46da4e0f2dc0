//! Refresh schedules for job status, job lists and service health.
//!
//! The policies here are handed to the query cache, which only runs their
//! timers while something is subscribed to the key.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api::types::Job;
use crate::cache::{FetchOutcome, FixedInterval, RefreshPolicy};
use crate::config::PollingConfig;

pub const JOB_DETAIL_INTERVAL: Duration = Duration::from_secs(3);
pub const JOB_LIST_INTERVAL: Duration = Duration::from_secs(5);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingController {
  job_detail: Duration,
  job_list: Duration,
  health: Duration,
}

impl PollingController {
  pub fn new(job_detail: Duration, job_list: Duration, health: Duration) -> Self {
    Self {
      job_detail,
      job_list,
      health,
    }
  }

  pub fn from_config(config: &PollingConfig) -> Self {
    Self::new(
      Duration::from_secs(config.job_detail_secs),
      Duration::from_secs(config.job_list_secs),
      Duration::from_secs(config.health_secs),
    )
  }

  pub fn job_detail_interval(&self) -> Duration {
    self.job_detail
  }

  pub fn job_list_interval(&self) -> Duration {
    self.job_list
  }

  pub fn health_interval(&self) -> Duration {
    self.health
  }

  /// Poll a single job until it reaches a terminal status.
  pub fn job_detail(&self) -> Arc<dyn RefreshPolicy<Job>> {
    Arc::new(JobDetailPolicy {
      interval: self.job_detail,
    })
  }

  /// Poll a job list while any job in it is still running.
  pub fn job_list(&self) -> Arc<dyn RefreshPolicy<Vec<Job>>> {
    Arc::new(JobListPolicy {
      interval: self.job_list,
    })
  }

  pub fn health(&self) -> Arc<dyn RefreshPolicy<bool>> {
    Arc::new(FixedInterval(self.health))
  }
}

impl Default for PollingController {
  fn default() -> Self {
    Self::new(JOB_DETAIL_INTERVAL, JOB_LIST_INTERVAL, HEALTH_INTERVAL)
  }
}

struct JobDetailPolicy {
  interval: Duration,
}

impl RefreshPolicy<Job> for JobDetailPolicy {
  fn next_refresh(&self, outcome: FetchOutcome<'_, Job>, previous: Option<&Job>) -> Option<Duration> {
    match outcome {
      FetchOutcome::Success(job) => {
        if let Some(previous) = previous {
          if job.status.rank() < previous.status.rank() {
            warn!(
              job_id = %job.id,
              from = %previous.status,
              to = %job.status,
              "job status moved backwards"
            );
          }
        }
        if job.is_terminal() {
          debug!(job_id = %job.id, status = %job.status, "job settled, polling stopped");
          None
        } else {
          Some(self.interval)
        }
      }
      FetchOutcome::Failure(error) if error.is_not_found() => {
        debug!(error = %error, "job gone, polling stopped");
        None
      }
      // Transient failure: keep the cadence unless the job already settled.
      FetchOutcome::Failure(_) => match previous {
        Some(job) if job.is_terminal() => None,
        _ => Some(self.interval),
      },
    }
  }
}

struct JobListPolicy {
  interval: Duration,
}

fn any_active(jobs: &[Job]) -> bool {
  jobs.iter().any(|job| !job.is_terminal())
}

impl RefreshPolicy<Vec<Job>> for JobListPolicy {
  fn next_refresh(
    &self,
    outcome: FetchOutcome<'_, Vec<Job>>,
    previous: Option<&Vec<Job>>,
  ) -> Option<Duration> {
    match outcome {
      FetchOutcome::Success(jobs) => any_active(jobs).then_some(self.interval),
      FetchOutcome::Failure(_) => match previous {
        Some(jobs) if !any_active(jobs) => None,
        _ => Some(self.interval),
      },
    }
  }
}
