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

//! Crate-level error taxonomy.
//!
//! The session raises `Connection`/`Authentication`/`Configuration`; the
//! executor raises `CommandFailed` for unelevated command failures and
//! filesystem mutations, and `Serialization` when a structured read-back
//! cannot be decoded. The scheduler never raises across its public surface;
//! its failures are job states.

use thiserror::Error;

use crate::ssh;

#[derive(Debug, Error)]
pub enum Error {
    /// All connection attempts were exhausted.
    #[error("failed to connect to {host} after {attempts} attempt(s): {source}")]
    Connection {
        host: String,
        attempts: u32,
        #[source]
        source: ssh::Error,
    },

    /// The target rejected our credentials; retrying cannot help.
    #[error("authentication against {host} failed: {source}")]
    Authentication {
        host: String,
        #[source]
        source: ssh::Error,
    },

    /// The credentials or the target description are unusable as given.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An unelevated remote command exited non-zero.
    #[error("command `{command}` exited with status {exit_status}: {stderr}")]
    CommandFailed {
        command: String,
        exit_status: u32,
        stderr: String,
    },

    /// Structured output (JSON/YAML) could not be decoded.
    #[error("failed to decode structured output: {0}")]
    Serialization(String),

    /// Transport failure surfaced outside the session's retry loop.
    #[error(transparent)]
    Ssh(#[from] ssh::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
