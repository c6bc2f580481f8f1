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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use opsrig::scheduler::{JobParams, JobScheduler, JobState, SchedulerConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(max_workers: usize, timeout_secs: u64) -> SchedulerConfig {
    SchedulerConfig {
        max_workers,
        wakeup_interval: Duration::from_secs(1),
        job_timeout: Duration::from_secs(timeout_secs),
    }
}

fn noop_callback(_result: Value, _params: &JobParams) {}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_worker_slots() {
    init_tracing();
    let scheduler = JobScheduler::new(config(2, 1000));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for _ in 0..3 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let id = scheduler.submit(
            move |_params| async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            },
            JobParams::new(),
            noop_callback,
            JobParams::new(),
        );
        ids.push(id);
    }

    tokio::time::sleep(Duration::from_secs(30)).await;

    for id in &ids {
        assert_eq!(scheduler.state(*id), Some(JobState::Finished));
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2, "third job must wait for a free slot");
    assert_eq!(scheduler.running_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlong_job_is_killed_and_marked_timed_out() {
    let scheduler = JobScheduler::new(config(1, 3));

    let callback_fired = Arc::new(AtomicBool::new(false));
    let fired = Arc::clone(&callback_fired);
    let id = scheduler.submit(
        |_params| async {
            tokio::time::sleep(Duration::from_secs(1000)).await;
            Ok(Value::Null)
        },
        JobParams::new(),
        move |_result, _params| {
            fired.store(true, Ordering::SeqCst);
        },
        JobParams::new(),
    );

    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(scheduler.state(id), Some(JobState::TimedOut));
    assert_eq!(scheduler.state(id).unwrap().to_string(), "Failure (timeout)");
    assert!(
        !callback_fired.load(Ordering::SeqCst),
        "success callback must not fire for a killed job"
    );
    assert_eq!(scheduler.running_count(), 0, "the slot must be reusable again");
}

#[tokio::test(start_paused = true)]
async fn test_failing_job_captures_the_error() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let id = scheduler.submit(
        |_params| async { Err(anyhow::anyhow!("exploded deliberately")) },
        JobParams::new(),
        noop_callback,
        JobParams::new(),
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(scheduler.state(id), Some(JobState::Failed));
    assert_eq!(scheduler.state(id).unwrap().to_string(), "Failure (unknown)");
    let error = scheduler.error(id).expect("a captured error must be attached");
    assert!(error.message.contains("exploded deliberately"));
    assert!(!error.trace.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_job_is_captured_not_propagated() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let id = scheduler.submit(
        |_params| async { panic!("kaboom") },
        JobParams::new(),
        noop_callback,
        JobParams::new(),
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(scheduler.state(id), Some(JobState::Failed));
    let error = scheduler.error(id).unwrap();
    assert_eq!(error.kind, "panic");
    assert!(error.message.contains("kaboom"));
}

#[tokio::test(start_paused = true)]
async fn test_jobs_are_assigned_in_submission_order() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let finished_order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&finished_order);
        scheduler.submit(
            move |_params| async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(Value::String(tag.to_string()))
            },
            JobParams::new(),
            move |result, _params| {
                if let Value::String(tag) = result {
                    order.lock().unwrap().push(tag);
                }
            },
            JobParams::new(),
        );
    }

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        *finished_order.lock().unwrap(),
        vec!["first", "second", "third"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_callback_receives_result_and_its_params() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let seen: Arc<Mutex<Option<(Value, Value)>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let mut callback_params = JobParams::new();
    callback_params.insert("service".to_string(), json!("mlflow"));

    scheduler.submit(
        |_params| async { Ok(json!({"installed": true})) },
        JobParams::new(),
        move |result, params| {
            *sink.lock().unwrap() = Some((result, params["service"].clone()));
        },
        callback_params,
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    let seen = seen.lock().unwrap().clone().expect("callback must have fired");
    assert_eq!(seen.0, json!({"installed": true}));
    assert_eq!(seen.1, json!("mlflow"));
}

// The correlation pattern jobs_matching exists for: a completion callback
// turning around and querying its own scheduler must not deadlock the
// watchdog.
#[tokio::test(start_paused = true)]
async fn test_callback_may_call_back_into_its_scheduler() {
    let scheduler = Arc::new(JobScheduler::new(config(1, 1000)));

    let observed: Arc<Mutex<Option<(Vec<usize>, JobState)>>> = Arc::new(Mutex::new(None));
    let mut callback_params = JobParams::new();
    callback_params.insert("service".to_string(), json!("mlflow"));

    let sched = Arc::clone(&scheduler);
    let sink = Arc::clone(&observed);
    let id = scheduler.submit(
        |_params| async { Ok(Value::Null) },
        JobParams::new(),
        move |_result, _params| {
            let matches: Vec<usize> = sched
                .jobs_matching("service", &json!("mlflow"))
                .iter()
                .map(|j| j.index())
                .collect();
            let state = sched.state(sched.jobs_matching("service", &json!("mlflow"))[0]);
            *sink.lock().unwrap() = Some((matches, state.unwrap()));
        },
        callback_params,
    );

    tokio::time::sleep(Duration::from_secs(10)).await;

    let seen = observed
        .lock()
        .unwrap()
        .clone()
        .expect("the callback must have run to completion");
    assert_eq!(seen.0, vec![id.index()]);
    assert_eq!(seen.1, JobState::Finished, "the job is terminal before its callback runs");
    assert_eq!(scheduler.state(id), Some(JobState::Finished));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callback_does_not_stop_the_watchdog() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let first = scheduler.submit(
        |_params| async { Ok(Value::Null) },
        JobParams::new(),
        |_result: Value, _params: &JobParams| panic!("callback exploded"),
        JobParams::new(),
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scheduler.state(first), Some(JobState::Finished));

    // Later work must still be assigned and reaped.
    let second = scheduler.submit(
        |_params| async { Ok(Value::Null) },
        JobParams::new(),
        noop_callback,
        JobParams::new(),
    );
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scheduler.state(second), Some(JobState::Finished));
}

#[tokio::test(start_paused = true)]
async fn test_find_idle_returns_earliest_submission() {
    let scheduler = JobScheduler::new(config(1, 1000));

    for _ in 0..3 {
        scheduler.submit(
            |_params| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            },
            JobParams::new(),
            noop_callback,
            JobParams::new(),
        );
    }

    // Nothing has been assigned yet: the watchdog has not run.
    assert_eq!(scheduler.find_idle().unwrap().index(), 0);
    assert_eq!(scheduler.job_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_matching_correlates_callback_params() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let mut mlflow_params = JobParams::new();
    mlflow_params.insert("service".to_string(), json!("mlflow"));
    let mut redis_params = JobParams::new();
    redis_params.insert("service".to_string(), json!("redis"));

    let a = scheduler.submit(
        |_params| async { Ok(Value::Null) },
        JobParams::new(),
        noop_callback,
        mlflow_params,
    );
    let _b = scheduler.submit(
        |_params| async { Ok(Value::Null) },
        JobParams::new(),
        noop_callback,
        redis_params,
    );

    let matches = scheduler.jobs_matching("service", &json!("mlflow"));
    assert_eq!(matches, vec![a]);
    assert!(scheduler.jobs_matching("service", &json!("postgres")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_terminal_state_is_never_left() {
    let scheduler = JobScheduler::new(config(1, 1000));

    let id = scheduler.submit(
        |_params| async { Ok(Value::Null) },
        JobParams::new(),
        noop_callback,
        JobParams::new(),
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scheduler.state(id), Some(JobState::Finished));

    // Many more watchdog passes later, nothing has changed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(scheduler.state(id), Some(JobState::Finished));
    assert!(scheduler.state(id).unwrap().is_terminal());
}
