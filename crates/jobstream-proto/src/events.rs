//! Stream event definitions and the event decoder.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, DecodeErrorKind, ProtoError};
use crate::types::{Job, SessionDescriptor};

/// The event type tags recognized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `job:created`
    JobCreated,
    /// `job:active`
    JobActive,
    /// `job:progress`
    JobProgress,
    /// `job:completed`
    JobCompleted,
    /// `job:failed`
    JobFailed,
    /// `heartbeat`
    Heartbeat,
    /// `connection:opened`
    ConnectionOpened,
}

impl EventKind {
    /// All recognized kinds.
    pub const ALL: [Self; 7] = [
        Self::JobCreated,
        Self::JobActive,
        Self::JobProgress,
        Self::JobCompleted,
        Self::JobFailed,
        Self::Heartbeat,
        Self::ConnectionOpened,
    ];

    /// Look up a kind by its wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "job:created" => Some(Self::JobCreated),
            "job:active" => Some(Self::JobActive),
            "job:progress" => Some(Self::JobProgress),
            "job:completed" => Some(Self::JobCompleted),
            "job:failed" => Some(Self::JobFailed),
            "heartbeat" => Some(Self::Heartbeat),
            "connection:opened" => Some(Self::ConnectionOpened),
            _ => None,
        }
    }

    /// The wire tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::JobCreated => "job:created",
            Self::JobActive => "job:active",
            Self::JobProgress => "job:progress",
            Self::JobCompleted => "job:completed",
            Self::JobFailed => "job:failed",
            Self::Heartbeat => "heartbeat",
            Self::ConnectionOpened => "connection:opened",
        }
    }

    /// Returns true if events of this kind carry a job payload.
    #[must_use]
    pub const fn carries_job(self) -> bool {
        !matches!(self, Self::Heartbeat | Self::ConnectionOpened)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A decoded event from the job stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A job was created.
    JobCreated(Job),
    /// A job started running.
    JobActive(Job),
    /// A running job reported progress.
    JobProgress(Job),
    /// A job finished successfully.
    JobCompleted(Job),
    /// A job finished with an error.
    JobFailed(Job),
    /// Server liveness signal.
    Heartbeat {
        /// Server time, if the payload carried a readable one.
        server_time: Option<DateTime<Utc>>,
    },
    /// The server accepted the stream.
    ConnectionOpened(SessionDescriptor),
}

impl StreamEvent {
    /// Create a heartbeat stamped with the current time.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            server_time: Some(Utc::now()),
        }
    }

    /// The kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::JobCreated(_) => EventKind::JobCreated,
            Self::JobActive(_) => EventKind::JobActive,
            Self::JobProgress(_) => EventKind::JobProgress,
            Self::JobCompleted(_) => EventKind::JobCompleted,
            Self::JobFailed(_) => EventKind::JobFailed,
            Self::Heartbeat { .. } => EventKind::Heartbeat,
            Self::ConnectionOpened(_) => EventKind::ConnectionOpened,
        }
    }

    /// The job payload, for job lifecycle events.
    #[must_use]
    pub const fn job(&self) -> Option<&Job> {
        match self {
            Self::JobCreated(job)
            | Self::JobActive(job)
            | Self::JobProgress(job)
            | Self::JobCompleted(job)
            | Self::JobFailed(job) => Some(job),
            Self::Heartbeat { .. } | Self::ConnectionOpened(_) => None,
        }
    }

    /// Serialize the payload carried in the `data:` field.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn payload_json(&self) -> Result<String, ProtoError> {
        let result = match self {
            Self::Heartbeat { server_time } => serde_json::to_string(&HeartbeatBody {
                timestamp: server_time.map(ServerTime::Rfc3339),
            }),
            Self::ConnectionOpened(session) => serde_json::to_string(session),
            Self::JobCreated(job)
            | Self::JobActive(job)
            | Self::JobProgress(job)
            | Self::JobCompleted(job)
            | Self::JobFailed(job) => serde_json::to_string(job),
        };
        result.map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Render the event as a server-sent-events frame, terminated by a blank
    /// line.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_sse_frame(&self) -> Result<String, ProtoError> {
        Ok(format!(
            "event: {}\ndata: {}\n\n",
            self.kind().tag(),
            self.payload_json()?
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<ServerTime>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ServerTime {
    Millis(i64),
    Rfc3339(DateTime<Utc>),
}

impl ServerTime {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(ms),
            Self::Rfc3339(time) => Some(time),
        }
    }
}

/// Decode one raw event.
///
/// `declared_type` is the `event:` tag and `raw` the `data:` payload. Job
/// events must carry a full job; heartbeat and connection-opened events are
/// recognized by tag alone and a payload that does not parse leaves their
/// body empty.
///
/// # Errors
///
/// Returns a [`DecodeError`] holding the raw payload when the tag is unknown
/// or a job payload is malformed.
pub fn decode(raw: &[u8], declared_type: &str) -> Result<StreamEvent, DecodeError> {
    let kind = EventKind::from_tag(declared_type)
        .ok_or_else(|| DecodeError::new(declared_type, raw, DecodeErrorKind::UnknownType))?;

    match kind {
        EventKind::Heartbeat => {
            let server_time = serde_json::from_slice::<HeartbeatBody>(raw)
                .ok()
                .and_then(|body| body.timestamp)
                .and_then(ServerTime::into_datetime);
            Ok(StreamEvent::Heartbeat { server_time })
        }
        EventKind::ConnectionOpened => {
            let session = serde_json::from_slice(raw).unwrap_or_default();
            Ok(StreamEvent::ConnectionOpened(session))
        }
        _ => {
            let text =
                std::str::from_utf8(raw).map_err(|e| DecodeError::new(declared_type, raw, e))?;
            let job: Job =
                serde_json::from_str(text).map_err(|e| DecodeError::new(declared_type, raw, e))?;
            Ok(match kind {
                EventKind::JobCreated => StreamEvent::JobCreated(job),
                EventKind::JobActive => StreamEvent::JobActive(job),
                EventKind::JobProgress => StreamEvent::JobProgress(job),
                EventKind::JobCompleted => StreamEvent::JobCompleted(job),
                _ => StreamEvent::JobFailed(job),
            })
        }
    }
}
