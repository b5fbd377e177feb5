//! Classification jobs

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "Waiting",
            JobState::Running => "Running",
            JobState::Complete => "Complete",
            JobState::Error => "Error",
            JobState::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct JobProgress {
    state: JobState,
    progress: f64,
    error_message: Option<String>,
    started: Option<Instant>,
    finished: Option<Instant>,
    items_classified: usize,
    taggings: usize,
}

/// Point-in-time copy of a job's mutable fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub tag_url: String,
    pub state: JobState,
    /// Fraction of items processed, 0.0 to 1.0
    pub progress: f64,
    pub error_message: Option<String>,
    /// Seconds spent running
    pub duration: f64,
    pub items_classified: usize,
    pub taggings: usize,
    pub created_at: DateTime<Utc>,
}

/// One request to classify the cached items against a tag.
///
/// The worker that owns a running job mutates it; anyone may read it or
/// cancel it concurrently.
#[derive(Debug)]
pub struct ClassificationJob {
    id: String,
    tag_url: String,
    created_at: DateTime<Utc>,
    inner: Mutex<JobProgress>,
}

impl ClassificationJob {
    pub(crate) fn new(tag_url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tag_url: tag_url.into(),
            created_at: Utc::now(),
            inner: Mutex::new(JobProgress {
                state: JobState::Waiting,
                progress: 0.0,
                error_message: None,
                started: None,
                finished: None,
                items_classified: 0,
                taggings: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag_url(&self) -> &str {
        &self.tag_url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn progress(&self) -> f64 {
        self.inner.lock().progress
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().error_message.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == JobState::Cancelled
    }

    /// Seconds between start and finish; running jobs measure up to now
    pub fn duration(&self) -> f64 {
        let inner = self.inner.lock();
        match (inner.started, inner.finished) {
            (Some(started), Some(finished)) => finished.duration_since(started).as_secs_f64(),
            (Some(started), None) => started.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let duration = self.duration();
        let inner = self.inner.lock();
        JobSnapshot {
            id: self.id.clone(),
            tag_url: self.tag_url.clone(),
            state: inner.state,
            progress: inner.progress,
            error_message: inner.error_message.clone(),
            duration,
            items_classified: inner.items_classified,
            taggings: inner.taggings,
            created_at: self.created_at,
        }
    }

    /// Mark the job cancelled if it has not finished yet
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            JobState::Waiting | JobState::Running => {
                inner.state = JobState::Cancelled;
                if inner.started.is_some() && inner.finished.is_none() {
                    inner.finished = Some(Instant::now());
                }
                true
            }
            _ => false,
        }
    }

    /// Move a waiting job to running; false if it was cancelled meanwhile
    pub(crate) fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Waiting {
            return false;
        }
        inner.state = JobState::Running;
        inner.started = Some(Instant::now());
        true
    }

    pub(crate) fn set_progress(&self, progress: f64) {
        self.inner.lock().progress = progress.clamp(0.0, 1.0);
    }

    pub(crate) fn record_counts(&self, items_classified: usize, taggings: usize) {
        let mut inner = self.inner.lock();
        inner.items_classified = items_classified;
        inner.taggings = taggings;
    }

    /// Finish successfully unless a cancel arrived first
    pub(crate) fn complete(&self) -> JobState {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Running {
            inner.state = JobState::Complete;
            inner.progress = 1.0;
            inner.finished = Some(Instant::now());
        }
        inner.state
    }

    /// Finish with an error unless a cancel arrived first
    pub(crate) fn fail(&self, message: impl Into<String>) -> JobState {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Running {
            inner.state = JobState::Error;
            inner.error_message = Some(message.into());
            inner.finished = Some(Instant::now());
        }
        inner.state
    }
}
