//! Client-side data synchronization for a lead-generation CRM: cached,
//! deduplicated reads of jobs and leads, status polling for running jobs,
//! and writes that invalidate what they change.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod mutation;
pub mod notify;
pub mod poller;

pub use error::{Error, MutationError, Result};
