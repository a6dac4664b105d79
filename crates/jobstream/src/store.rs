//! In-memory job state.
//!
//! Every job event carries a complete job, so applying an event replaces the
//! stored record for that ID. Arrival order decides: when two events for the
//! same job arrive out of order, the later arrival wins. The wire format has
//! no per-job sequence number to do better.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use jobstream_proto::{Job, JobId, StreamEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Read-only, cheaply cloneable view of the job map.
///
/// Clone the inner map with [`JobSnapshot::to_map`] before mutating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSnapshot(Arc<HashMap<JobId, Job>>);

impl JobSnapshot {
    /// Copy the jobs into an owned map.
    #[must_use]
    pub fn to_map(&self) -> HashMap<JobId, Job> {
        self.0.as_ref().clone()
    }

    /// Jobs sorted by ID.
    #[must_use]
    pub fn sorted(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.0.values().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }
}

impl Deref for JobSnapshot {
    type Target = HashMap<JobId, Job>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Latest known state of every job seen on the stream.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Arc<HashMap<JobId, Job>>,
    finished_at: HashMap<JobId, Instant>,
    terminal_ttl: Option<Duration>,
}

impl JobStore {
    /// Create a store that never evicts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that drops finished jobs `ttl` after they finished.
    #[must_use]
    pub fn with_terminal_ttl(ttl: Option<Duration>) -> Self {
        Self {
            terminal_ttl: ttl,
            ..Self::default()
        }
    }

    /// Apply one event.
    ///
    /// Returns the stored job for job events and `None` for heartbeat and
    /// connection events, which leave the store untouched. Applying the same
    /// event twice yields the same snapshot as applying it once.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<Job> {
        let job = event.job()?;
        let now = Instant::now();
        self.evict_expired(now);

        if let Some(previous) = self.jobs.get(&job.id) {
            if previous.status.is_terminal() && !job.status.is_terminal() {
                warn!(
                    job_id = %job.id,
                    from = %previous.status,
                    to = %job.status,
                    "job left a terminal status; applying server state"
                );
            }
        }
        if let Err(e) = job.validate() {
            debug!(job_id = %job.id, error = %e, "job payload breaks status field rules");
        }

        if job.status.is_terminal() {
            self.finished_at.entry(job.id.clone()).or_insert(now);
        } else {
            self.finished_at.remove(&job.id);
        }

        Arc::make_mut(&mut self.jobs).insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, kind = %event.kind(), status = %job.status, "applied job event");
        Some(job.clone())
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot(Arc::clone(&self.jobs))
    }

    /// Look up one job.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Number of jobs held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if the store holds no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop every job.
    pub fn clear(&mut self) {
        self.jobs = Arc::default();
        self.finished_at.clear();
    }

    /// Drop finished jobs older than the TTL. Returns how many were dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.terminal_ttl else {
            return 0;
        };

        let expired: Vec<JobId> = self
            .finished_at
            .iter()
            .filter(|(_, finished)| now.saturating_duration_since(**finished) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let jobs = Arc::make_mut(&mut self.jobs);
        for id in &expired {
            jobs.remove(id);
            self.finished_at.remove(id);
        }
        debug!(count = expired.len(), "evicted finished jobs");
        expired.len()
    }
}
