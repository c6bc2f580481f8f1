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

//! Remote orchestration core for provisioning machine-learning
//! infrastructure over SSH.
//!
//! Three components, layered:
//! - [`ssh::RemoteSession`] — a retrying, verified command-execution
//!   session to one host, with ephemeral key-material handling.
//! - [`executor::TaskExecutor`] — categorized remote operations (packages,
//!   users, TLS, containers, filesystem, git) with a bounded execution
//!   history.
//! - [`scheduler::JobScheduler`] — a bounded worker pool running
//!   long-lived provisioning jobs under a recurring watchdog.
//!
//! A typical provisioning job opens a session, wraps it in an executor,
//! drives the named operations, and closes the session; the scheduler runs
//! many such jobs concurrently.

pub mod credentials;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod ssh;

pub use credentials::{Credentials, KeyPair, RetryPolicy};
pub use error::{Error, Result};
pub use executor::{TaskExecutor, TaskGroup};
pub use scheduler::{JobScheduler, SchedulerConfig};
pub use ssh::RemoteSession;
