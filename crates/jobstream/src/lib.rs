//! Jobstream - resilient client for the background job event feed.
//!
//! Subscribes to a server-sent event stream of job lifecycle events, keeps an
//! in-memory snapshot of every job it has seen and notifies observers of job
//! updates and connection state changes.
//!
//! ```no_run
//! use jobstream::{ConnectionManager, Credentials, StreamConfig};
//!
//! # async fn run() -> Result<(), jobstream::StreamError> {
//! let manager = ConnectionManager::new(StreamConfig::default())?;
//! manager.on_job_update(|job| println!("{} is {}", job.id, job.status));
//!
//! let handle = manager.subscribe(
//!     "https://example.com/api/jobs/stream",
//!     Credentials::Cookie("session=abc".to_string()),
//! )?;
//! manager.wait_connected(handle).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod store;
pub mod stream;

pub use config::StreamConfig;
pub use error::{FatalError, StreamError, TransportError};
pub use jobstream_proto::{Job, JobId, JobStatus, StreamEvent};
pub use store::{JobSnapshot, JobStore};
pub use stream::{
    ConnectionManager, ConnectionState, ConnectionStatus, CredentialProvider, Credentials,
    StateChange, SubscriptionHandle,
};
