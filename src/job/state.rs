//! Job state machine and the values a finished job hands out.

use crate::error::{ErrorCode, TemplateError};
use crate::render::{MissingData, RenderMode, RenderReport};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `Pending -> Running -> {Completed | Failed | Cancelled}`; terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Pending => next != JobState::Pending,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GeneratedOutput {
    Bytes(Arc<Vec<u8>>),
    File(PathBuf),
}

impl GeneratedOutput {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            GeneratedOutput::Bytes(bytes) => Some(bytes.as_slice()),
            GeneratedOutput::File(_) => None,
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            GeneratedOutput::File(path) => Some(path),
            GeneratedOutput::Bytes(_) => None,
        }
    }
}

/// Result owned by a completed job.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub output: GeneratedOutput,
    pub rows: u64,
    pub duration: Duration,
    pub mode: RenderMode,
    pub missing: MissingData,
}

impl GenerationResult {
    pub fn new(output: GeneratedOutput, report: RenderReport) -> Self {
        Self {
            output,
            rows: report.rows,
            duration: report.duration,
            mode: report.mode,
            missing: report.missing,
        }
    }
}

/// Why a job did not complete.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error(transparent)]
    Failed(Arc<TemplateError>),
    #[error("job was cancelled")]
    Cancelled,
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::Failed(err) => err.code(),
            JobError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(GenerationResult),
    Failed(Arc<TemplateError>),
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<GenerationResult, JobError> {
        match self {
            JobOutcome::Completed(result) => Ok(result),
            JobOutcome::Failed(err) => Err(JobError::Failed(err)),
            JobOutcome::Cancelled => Err(JobError::Cancelled),
        }
    }
}

/// Snapshot published on the job's watch channel.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    pub written: u64,
    pub planned: u64,
    pub outcome: Option<JobOutcome>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            written: 0,
            planned: 0,
            outcome: None,
        }
    }

    /// Apply a transition; `false` when it is not allowed from the current
    /// state.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    /// Commit a terminal outcome unless one was committed already.
    pub fn finish(&mut self, outcome: JobOutcome) -> bool {
        if !self.advance(outcome.state()) {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }
}
