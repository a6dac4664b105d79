//! # jobstream-proto
//!
//! Wire definitions for the jobstream job event feed: the job record, the
//! stream event union and the decoder that turns a raw server-sent event into
//! a typed [`StreamEvent`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod types;

pub use error::{DecodeError, DecodeErrorKind, ProtoError};
pub use events::{EventKind, StreamEvent, decode};
pub use types::{Job, JobId, JobStatus, SessionDescriptor};
