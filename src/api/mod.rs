//! Access to the remote job and lead service.

pub mod api_types;
pub mod cached_client;
pub mod jobs;
pub mod keys;
pub mod leads;
pub mod transport;
pub mod types;

pub use cached_client::CachedClient;
pub use jobs::JobService;
pub use keys::CrmQuery;
pub use leads::LeadService;
pub use transport::Transport;
