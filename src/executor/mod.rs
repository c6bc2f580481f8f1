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

//! Categorized remote task execution with bounded history.
//!
//! [`TaskExecutor`] is the uniform surface for remote operations. Every
//! operation is tagged with a [`TaskGroup`] and appends a history entry
//! whether it succeeds or fails. The executor talks to the host through the
//! [`RemoteChannel`] seam, normally a verified
//! [`RemoteSession`](crate::ssh::RemoteSession); tests substitute a scripted
//! fake.
//!
//! Failure policy, in one place: **elevated commands soft-fail** (logged,
//! recorded, `Ok(None)`) because they are usually idempotent setup steps
//! inside composite flows and one hiccup should not abort the whole flow;
//! **unelevated commands hard-fail** since those failures usually mean a
//! logic error upstream. Diagnostic operations (status, logs, structured
//! parsing) never raise at all — they degrade to empty results plus a
//! warning.

mod container;
mod filesystem;
mod git;
mod history;
mod system;

pub use container::ContainerState;
pub use filesystem::{FileFormat, FileTreeEntry};
pub use history::{EntryStatus, ExecutionHistory, HistoryEntry, DEFAULT_HISTORY_LIMIT};
pub use system::AddUserOptions;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::ssh::{self, ExecOutput};

/// Logical buckets describing the kind of remote action being executed.
///
/// Classification only; groups have no behavior of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskGroup {
    SystemPackages,
    ServiceControl,
    ContainerRuntime,
    Cluster,
    Filesystem,
    UserAccess,
    SecurityAssets,
    VersionControl,
    Networking,
    AdHoc,
}

impl TaskGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskGroup::SystemPackages => "system_packages",
            TaskGroup::ServiceControl => "service_control",
            TaskGroup::ContainerRuntime => "container_runtime",
            TaskGroup::Cluster => "cluster",
            TaskGroup::Filesystem => "filesystem",
            TaskGroup::UserAccess => "user_access",
            TaskGroup::SecurityAssets => "security_assets",
            TaskGroup::VersionControl => "version_control",
            TaskGroup::Networking => "networking",
            TaskGroup::AdHoc => "ad_hoc",
        }
    }
}

impl fmt::Display for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability the executor consumes: execute commands and move bytes.
///
/// Implemented by [`RemoteSession`](crate::ssh::RemoteSession); test code
/// provides a scripted stand-in.
#[async_trait]
pub trait RemoteChannel: Send {
    /// Execute a command, optionally feeding `stdin` to it. Secrets travel
    /// through stdin, never on the command line.
    async fn exec(
        &mut self,
        command: &str,
        pty: bool,
        stdin: Option<&[u8]>,
    ) -> std::result::Result<ExecOutput, ssh::Error>;

    async fn put_bytes(
        &mut self,
        remote_path: &str,
        contents: &[u8],
    ) -> std::result::Result<(), ssh::Error>;

    async fn get_bytes(&mut self, remote_path: &str) -> std::result::Result<Vec<u8>, ssh::Error>;

    async fn put_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
    ) -> std::result::Result<(), ssh::Error>;
}

/// Per-call options for [`TaskExecutor::run`].
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Run the command under privilege elevation (soft-fail on error).
    pub elevated: bool,
    /// Allocate a PTY for the command.
    pub interactive: bool,
    /// Free-form description recorded in the history metadata.
    pub description: Option<String>,
    /// Extra metadata merged into the history entry.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elevated() -> Self {
        Self {
            elevated: true,
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Executes categorized remote operations and records every attempt.
pub struct TaskExecutor<C> {
    channel: C,
    sudo_password: Option<Zeroizing<String>>,
    history: ExecutionHistory,
}

impl<C: RemoteChannel> TaskExecutor<C> {
    pub fn new(channel: C, sudo_password: Option<Zeroizing<String>>) -> Self {
        Self::with_history_limit(channel, sudo_password, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(
        channel: C,
        sudo_password: Option<Zeroizing<String>>,
        history_limit: usize,
    ) -> Self {
        Self {
            channel,
            sudo_password,
            history: ExecutionHistory::new(history_limit),
        }
    }

    /// Read-only snapshot of the execution history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    /// Give the channel back, e.g. to close the session.
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Execute one remote command, tagged with its group.
    ///
    /// Returns the trimmed stdout on success. Elevated failures are logged
    /// and flattened to `Ok(None)`; unelevated failures propagate as
    /// [`Error::CommandFailed`] (or the transport error).
    pub async fn run(
        &mut self,
        group: TaskGroup,
        command: &str,
        opts: RunOptions,
    ) -> Result<Option<String>> {
        let action = format!("task:{group}");
        let mut metadata = opts.metadata.clone();
        metadata.insert("group".into(), group.as_str().into());
        metadata.insert("elevated".into(), opts.elevated.into());
        metadata.insert("interactive".into(), opts.interactive.into());
        if let Some(description) = &opts.description {
            metadata.insert("description".into(), description.as_str().into());
        }

        let (rendered, stdin) = if opts.elevated {
            self.elevate(command)
        } else {
            (command.to_string(), None)
        };

        match self
            .channel
            .exec(&rendered, opts.interactive, stdin.as_ref().map(|s| s.as_bytes()))
            .await
        {
            Ok(output) if output.is_success() => {
                let stdout = output.stdout.trim().to_string();
                self.history.record(
                    HistoryEntry::new(action, EntryStatus::Success)
                        .command(command)
                        .exit_code(output.exit_status)
                        .output(stdout.clone())
                        .metadata(metadata),
                );
                Ok(Some(stdout))
            }
            Ok(output) => {
                let stderr = output.stderr.trim().to_string();
                self.history.record(
                    HistoryEntry::new(action, EntryStatus::Error)
                        .command(command)
                        .exit_code(output.exit_status)
                        .error(stderr.clone())
                        .metadata(metadata),
                );
                if opts.elevated {
                    tracing::warn!(
                        "elevated command failed with status {}: {command}",
                        output.exit_status
                    );
                    Ok(None)
                } else {
                    Err(Error::CommandFailed {
                        command: command.to_string(),
                        exit_status: output.exit_status,
                        stderr,
                    })
                }
            }
            Err(err) => {
                self.history.record(
                    HistoryEntry::new(action, EntryStatus::Error)
                        .command(command)
                        .error(err.to_string())
                        .metadata(metadata),
                );
                if opts.elevated {
                    tracing::warn!("elevated command failed on the transport: {err}");
                    Ok(None)
                } else {
                    Err(Error::Ssh(err))
                }
            }
        }
    }

    /// Record a summary entry for a composite operation.
    pub(crate) fn record(&mut self, entry: HistoryEntry) {
        self.history.record(entry);
    }

    pub(crate) fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Render a command for privileged execution.
    ///
    /// With a sudo password available the password is written to the
    /// channel's stdin (`sudo -S`), keeping it off the remote command line
    /// and out of the target's process list; otherwise passwordless sudo is
    /// assumed (`sudo -n`).
    fn elevate(&self, command: &str) -> (String, Option<Zeroizing<String>>) {
        let quoted = shell_single_quote(command);
        match &self.sudo_password {
            Some(password) => (
                format!("sudo -S -p '' -- sh -c {quoted}"),
                Some(Zeroizing::new(format!("{}\n", password.as_str()))),
            ),
            None => (format!("sudo -n -- sh -c {quoted}"), None),
        }
    }
}

/// Quote a string for safe interpolation into a POSIX shell command line.
pub(crate) fn shell_single_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
