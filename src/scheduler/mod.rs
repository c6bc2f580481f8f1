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

//! Concurrent background-job scheduling with a recurring watchdog.
//!
//! A [`JobScheduler`] owns a fixed number of worker slots and a watchdog
//! task that wakes on an interval. Each tick it reaps finished workers,
//! assigns idle jobs to free slots in submission order, and force-aborts
//! workers past the timeout. Job callables run as tokio tasks on the
//! multithreaded runtime; every failure (error return, panic, vanished
//! result) is captured as a structured [`JobError`] inside the worker
//! before it crosses the task boundary.
//!
//! The public surface never returns errors. All failure is observable as
//! job state plus the logged captured error; callers poll
//! [`state`](JobScheduler::state) to learn of failures.

mod job;

pub use job::{JobError, JobId, JobOutput, JobParams, JobState};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use job::{Job, JobCallback, JobFn};

/// Sizing and timing knobs for a [`JobScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker slots, and so the concurrency ceiling.
    pub max_workers: usize,
    /// Watchdog wakeup interval.
    pub wakeup_interval: Duration,
    /// A job running longer than this is forcibly terminated.
    pub job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            wakeup_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1500),
        }
    }
}

/// A worker slot currently bound to a running job.
struct ActiveWorker {
    job: usize,
    started_at: Instant,
    handle: JoinHandle<()>,
    result_rx: oneshot::Receiver<Result<JobOutput, JobError>>,
}

struct Inner {
    jobs: Vec<Job>,
    /// Exactly `max_workers` slots, reused for the scheduler's lifetime.
    slots: Vec<Option<ActiveWorker>>,
}

/// Runs submitted jobs concurrently, bounded by a fixed worker-slot count.
///
/// Explicitly constructed and owned by the caller; drop it to stop the
/// watchdog and abort any still-running workers.
pub struct JobScheduler {
    inner: Arc<Mutex<Inner>>,
    watchdog: JoinHandle<()>,
}

impl JobScheduler {
    /// Create a scheduler and start its watchdog. Must be called from
    /// within a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        let inner = Arc::new(Mutex::new(Inner {
            jobs: Vec::new(),
            slots: (0..max_workers).map(|_| None).collect(),
        }));

        let watchdog_inner = Arc::clone(&inner);
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.wakeup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick(&watchdog_inner, config.job_timeout);
            }
        });

        Self { inner, watchdog }
    }

    /// Queue a job. Non-blocking; the watchdog assigns it to a worker slot
    /// once one is free, earliest submission first.
    ///
    /// `callback` is invoked synchronously from the watchdog, with the
    /// job's output and `callback_params`, on success only.
    pub fn submit<F, Fut, CB>(
        &self,
        callable: F,
        params: JobParams,
        callback: CB,
        callback_params: JobParams,
    ) -> JobId
    where
        F: FnOnce(JobParams) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<JobOutput>> + Send + 'static,
        CB: FnOnce(JobOutput, &JobParams) + Send + 'static,
    {
        let callable: JobFn = Box::new(move |params| callable(params).boxed());
        let callback: JobCallback = Box::new(callback);

        let mut inner = self.lock();
        let id = JobId(inner.jobs.len());
        inner
            .jobs
            .push(Job::new(callable, params, callback, callback_params));
        tracing::debug!("submitted {id}");
        id
    }

    /// Current state of a job, if the id is known.
    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.lock().jobs.get(id.0).map(|job| job.state)
    }

    /// The captured failure record of a failed job.
    pub fn error(&self, id: JobId) -> Option<JobError> {
        self.lock().jobs.get(id.0).and_then(|job| job.error.clone())
    }

    /// When a job was submitted.
    pub fn submitted_at(&self, id: JobId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.lock().jobs.get(id.0).map(|job| job.submitted_at)
    }

    /// The earliest-submitted job still in Idle state.
    pub fn find_idle(&self) -> Option<JobId> {
        find_idle_index(&self.lock().jobs).map(JobId)
    }

    /// Ids of jobs whose callback parameters carry `param_name == value`.
    /// Lets callers correlate jobs with an external selection.
    pub fn jobs_matching(&self, param_name: &str, value: &serde_json::Value) -> Vec<JobId> {
        self.lock()
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.callback_params.get(param_name) == Some(value))
            .map(|(i, _)| JobId(i))
            .collect()
    }

    /// Number of jobs ever submitted.
    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Number of worker slots currently bound to a running job.
    pub fn running_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Recover from poisoning; the bookkeeping stays consistent because
        // every mutation completes before the guard is released.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.watchdog.abort();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for slot in inner.slots.iter_mut() {
            if let Some(worker) = slot.take() {
                worker.handle.abort();
            }
        }
    }
}

/// One watchdog pass: reap, run callbacks, assign, enforce timeouts.
///
/// The pass runs in three phases so the scheduler lock is never held while
/// user code executes: callbacks are collected during the reap phase and
/// invoked with the lock released, which lets a callback call back into its
/// scheduler (`jobs_matching`, `state`, even `submit`) without deadlocking
/// the watchdog.
fn tick(inner: &Mutex<Inner>, job_timeout: Duration) {
    let mut callbacks: Vec<(JobCallback, JobOutput, JobParams)> = Vec::new();

    // Phase 1: reap finished workers and free their slots.
    {
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        let Inner { jobs, slots } = &mut *guard;

        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|w| w.handle.is_finished()) {
                if let Some(mut worker) = slot.take() {
                    let job_idx = worker.job;
                    match worker.result_rx.try_recv() {
                        Ok(Ok(output)) => {
                            if let Some(job) = jobs.get_mut(job_idx) {
                                job.advance(JobState::Finished);
                                if let Some(callback) = job.callback.take() {
                                    callbacks.push((
                                        callback,
                                        output,
                                        job.callback_params.clone(),
                                    ));
                                }
                            }
                        }
                        Ok(Err(error)) => {
                            tracing::error!("{} failed:\n{}", JobId(job_idx), error.trace);
                            if let Some(job) = jobs.get_mut(job_idx) {
                                job.advance(JobState::Failed);
                                job.error = Some(error);
                            }
                        }
                        Err(_) => {
                            // The worker ended without sending a result;
                            // nothing more specific can be known about what
                            // happened.
                            tracing::error!("{} vanished without a result", JobId(job_idx));
                            if let Some(job) = jobs.get_mut(job_idx) {
                                job.advance(JobState::Failed);
                                job.error = Some(JobError {
                                    kind: "missing_result".into(),
                                    message: "worker ended without reporting a result".into(),
                                    trace: String::new(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    // Phase 2: completion callbacks, outside the lock. A panicking
    // callback is contained here so the watchdog keeps ticking.
    for (callback, output, params) in callbacks {
        let invocation = std::panic::catch_unwind(AssertUnwindSafe(|| callback(output, &params)));
        if invocation.is_err() {
            tracing::error!("a completion callback panicked; continuing");
        }
    }

    // Phase 3: assign idle jobs and enforce the timeout.
    {
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        let Inner { jobs, slots } = &mut *guard;

        for slot in slots.iter_mut() {
            // Assign the earliest idle job to a free slot.
            if slot.is_none() {
                if let Some(next) = find_idle_index(jobs) {
                    let job = &mut jobs[next];
                    if let Some(callable) = job.callable.take() {
                        job.advance(JobState::Running);
                        let params = std::mem::take(&mut job.params);
                        let (tx, rx) = oneshot::channel();
                        let handle = tokio::spawn(run_worker(callable, params, tx));
                        tracing::debug!("assigned {} to a worker slot", JobId(next));
                        *slot = Some(ActiveWorker {
                            job: next,
                            started_at: Instant::now(),
                            handle,
                            result_rx: rx,
                        });
                    }
                }
            }

            // Abort a worker past its deadline. Fire-and-forget; the slot
            // is freed immediately and the aborted task is never reaped.
            if slot
                .as_ref()
                .is_some_and(|w| w.started_at.elapsed() > job_timeout)
            {
                if let Some(worker) = slot.take() {
                    tracing::warn!(
                        "{} exceeded the watchdog timeout, killing it",
                        JobId(worker.job)
                    );
                    worker.handle.abort();
                    if let Some(job) = jobs.get_mut(worker.job) {
                        job.advance(JobState::TimedOut);
                    }
                }
            }
        }
    }
}

fn find_idle_index(jobs: &[Job]) -> Option<usize> {
    jobs.iter().position(|job| job.state == JobState::Idle)
}

/// Worker body. Every failure mode is converted into a [`JobError`] here,
/// on the worker side of the channel.
async fn run_worker(
    callable: JobFn,
    params: JobParams,
    tx: oneshot::Sender<Result<JobOutput, JobError>>,
) {
    let outcome = match AssertUnwindSafe(callable(params)).catch_unwind().await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(JobError {
            kind: "error".into(),
            message: err.to_string(),
            trace: format!("{err:?}"),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            Err(JobError {
                kind: "panic".into(),
                message: message.clone(),
                trace: message,
            })
        }
    };
    // The receiver is gone if the job was aborted in the meantime.
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job() -> Job {
        Job::new(
            Box::new(|_params| futures::future::ready(Ok(serde_json::Value::Null)).boxed()),
            JobParams::new(),
            Box::new(|_output, _params| {}),
            JobParams::new(),
        )
    }

    #[tokio::test]
    async fn test_vanished_worker_is_failed_with_synthesized_record() {
        let (tx, rx) = oneshot::channel::<Result<JobOutput, JobError>>();
        // A worker that ends without ever reporting a result.
        let handle = tokio::spawn(async move {
            drop(tx);
        });
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert!(handle.is_finished());

        let mut job = queued_job();
        job.advance(JobState::Running);
        let inner = Mutex::new(Inner {
            jobs: vec![job],
            slots: vec![Some(ActiveWorker {
                job: 0,
                started_at: Instant::now(),
                handle,
                result_rx: rx,
            })],
        });

        tick(&inner, Duration::from_secs(1000));

        let guard = inner.lock().unwrap();
        assert_eq!(guard.jobs[0].state, JobState::Failed);
        let error = guard.jobs[0]
            .error
            .as_ref()
            .expect("a synthesized record must be attached");
        assert_eq!(error.kind, "missing_result");
        assert!(!error.message.is_empty());
        assert!(guard.slots[0].is_none(), "the slot must be freed for reuse");
    }
}
