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

use std::time::{Duration, Instant};

use opsrig::credentials::{Credentials, RetryPolicy};
use opsrig::error::Error;
use opsrig::ssh::RemoteSession;

// Connecting to an unbound local port is refused immediately, which makes
// the retry loop observable without a real SSH server.
#[tokio::test]
async fn test_unreachable_host_exhausts_retries_with_delays() {
    let credentials = Credentials::with_password("127.0.0.1", 1, "nobody", "pw");
    let policy = RetryPolicy::new(2, Duration::from_millis(300));

    let started = Instant::now();
    let err = RemoteSession::connect(&credentials, policy)
        .await
        .expect_err("nothing is listening on 127.0.0.1:1");
    let elapsed = started.elapsed();

    match err {
        Error::Connection { host, attempts, .. } => {
            assert_eq!(attempts, 3, "2 retries mean 3 attempts");
            assert_eq!(host, "127.0.0.1:1");
        }
        other => panic!("expected Error::Connection, got: {other}"),
    }
    assert!(
        elapsed >= Duration::from_millis(600),
        "at least two inter-attempt delays must have elapsed, got {elapsed:?}"
    );
}

#[tokio::test]
async fn test_unresolvable_host_fails_without_retrying() {
    let credentials = Credentials::with_password("no-such-host.invalid", 22, "nobody", "pw");
    // A generous delay: if this were retried even once, the timing
    // assertion below would catch it.
    let policy = RetryPolicy::new(3, Duration::from_secs(30));

    let started = Instant::now();
    let err = RemoteSession::connect(&credentials, policy)
        .await
        .expect_err(".invalid never resolves");

    assert!(
        matches!(err, Error::Configuration(_)),
        "resolution failure must be classified as configuration, got: {err}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "non-retryable failures must not sleep out the retry delay"
    );
}

#[tokio::test]
async fn test_zero_retries_still_attempts_once() {
    let credentials = Credentials::with_password("127.0.0.1", 1, "nobody", "pw");
    let policy = RetryPolicy::new(0, Duration::from_millis(100));

    let err = RemoteSession::connect(&credentials, policy)
        .await
        .expect_err("nothing is listening");
    match err {
        Error::Connection { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("expected Error::Connection, got: {other}"),
    }
}
