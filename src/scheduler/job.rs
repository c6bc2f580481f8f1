// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Job bookkeeping for the scheduler: states, errors, and the stored
//! callable/callback pair.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// Index of a submitted job within its scheduler. Stable for the
/// scheduler's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) usize);

impl JobId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle state of a job. Transitions are monotonic: Idle → Running →
/// one terminal state, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Finished,
    TimedOut,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::TimedOut | JobState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Idle => 0,
            JobState::Running => 1,
            JobState::Finished | JobState::TimedOut | JobState::Failed => 2,
        }
    }

    /// Whether moving to `next` respects monotonicity.
    pub(crate) fn may_become(&self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Idle => "Idle",
            JobState::Running => "Running",
            JobState::Finished => "Finished",
            JobState::TimedOut => "Failure (timeout)",
            JobState::Failed => "Failure (unknown)",
        };
        f.write_str(label)
    }
}

/// Structured failure record, always built inside the worker before the
/// result crosses the task boundary.
#[derive(Debug, Clone)]
pub struct JobError {
    /// Coarse failure class ("error", "panic", "missing_result").
    pub kind: String,
    pub message: String,
    /// Pre-rendered debug representation of the failure.
    pub trace: String,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Parameter map handed to job callables and callbacks.
pub type JobParams = HashMap<String, serde_json::Value>;

/// Value produced by a job callable and handed to its callback.
pub type JobOutput = serde_json::Value;

pub(crate) type JobFn =
    Box<dyn FnOnce(JobParams) -> BoxFuture<'static, anyhow::Result<JobOutput>> + Send>;

pub(crate) type JobCallback = Box<dyn FnOnce(JobOutput, &JobParams) + Send>;

/// One submitted unit of background work.
pub(crate) struct Job {
    pub(crate) state: JobState,
    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) error: Option<JobError>,
    /// Taken when the job is assigned to a slot.
    pub(crate) callable: Option<JobFn>,
    pub(crate) params: JobParams,
    pub(crate) callback: Option<JobCallback>,
    pub(crate) callback_params: JobParams,
}

impl Job {
    pub(crate) fn new(
        callable: JobFn,
        params: JobParams,
        callback: JobCallback,
        callback_params: JobParams,
    ) -> Self {
        Self {
            state: JobState::Idle,
            submitted_at: Utc::now(),
            error: None,
            callable: Some(callable),
            params,
            callback: Some(callback),
            callback_params,
        }
    }

    /// Advance the state, refusing regressions.
    pub(crate) fn advance(&mut self, next: JobState) {
        if self.state.may_become(next) {
            self.state = next;
        } else {
            tracing::error!(
                "refusing job state regression {} -> {next}",
                self.state
            );
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("state", &self.state)
            .field("submitted_at", &self.submitted_at)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
