//! Core types for the job event feed.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Opaque identifier of a server-side job.
///
/// Stable for the lifetime of the job. The client never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for JobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a job.
///
/// `Waiting -> Active -> {Completed, Failed}`. The client does not enforce
/// the transitions; the server is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, not started yet.
    Waiting,
    /// Running.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full snapshot of a job as carried by every job event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job ID.
    pub id: JobId,
    /// Human-readable label.
    #[serde(default)]
    pub name: String,
    /// Current status.
    pub status: JobStatus,
    /// Progress percentage, meaningful while active.
    #[serde(default)]
    pub progress: u32,
    /// Result payload, present once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message, present once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Owning principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Visibility scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

impl Job {
    /// Create a job with the given ID, name and status.
    #[must_use]
    pub fn new(id: impl Into<JobId>, name: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
            progress: 0,
            result: None,
            error: None,
            created_at: None,
            owner_id: None,
            visibility: None,
        }
    }

    /// Set progress.
    #[must_use]
    pub const fn with_progress(mut self, progress: u32) -> Self {
        self.progress = progress;
        self
    }

    /// Set the result payload.
    #[must_use]
    pub fn with_result(mut self, result: impl Into<serde_json::Value>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Set the error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set the creation time.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Set the owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Check the status-dependent field rules.
    ///
    /// `result` may only be set when completed, `error` only when failed and
    /// `progress` may not exceed 100.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first violated rule.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.result.is_some() && self.status != JobStatus::Completed {
            return Err(ProtoError::Validation(format!(
                "job {} carries a result while {}",
                self.id, self.status
            )));
        }
        if self.error.is_some() && self.status != JobStatus::Failed {
            return Err(ProtoError::Validation(format!(
                "job {} carries an error while {}",
                self.id, self.status
            )));
        }
        if self.progress > 100 {
            return Err(ProtoError::Validation(format!(
                "job {} progress {} exceeds 100",
                self.id, self.progress
            )));
        }
        Ok(())
    }
}

/// Session details sent by the server when the stream opens.
///
/// Every field is optional; the event is recognized by its tag alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Server-side session ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Authenticated principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Interval at which the server emits heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
}
