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

//! Container lifecycle operations over the docker and compose CLIs.
//!
//! Lifecycle mutations (up/down) propagate failures. State inspection and
//! log tailing are diagnostics: malformed or missing output degrades to a
//! warning plus an empty result, never an error.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Result;
use crate::executor::{
    EntryStatus, HistoryEntry, RemoteChannel, RunOptions, TaskExecutor, TaskGroup,
};

/// The `State` object of `docker inspect`, reduced to the fields the
/// orchestration layer reads.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub finished_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    #[serde(default)]
    name: String,
    state: ContainerState,
}

impl<C: RemoteChannel> TaskExecutor<C> {
    /// `docker compose up -d --build`, optionally with an env file.
    pub async fn compose_up(
        &mut self,
        compose_file: &str,
        env_file: Option<&str>,
    ) -> Result<Option<String>> {
        let command = match env_file {
            Some(env) => format!(
                "docker compose --env-file {env} -f \"{compose_file}\" up -d --build"
            ),
            None => format!("docker compose -f \"{compose_file}\" up -d --build"),
        };
        let result = self
            .run(TaskGroup::ContainerRuntime, &command, RunOptions::elevated())
            .await?;

        let mut metadata = serde_json::Map::new();
        if let Some(env) = env_file {
            metadata.insert("env_file".into(), env.into());
        }
        let mut entry = HistoryEntry::new("compose_up", EntryStatus::Success)
            .command(command)
            .metadata(metadata);
        if let Some(output) = &result {
            entry = entry.output(output.clone());
        }
        self.record(entry);
        Ok(result)
    }

    /// `docker compose down --remove-orphans`, optionally removing volumes.
    pub async fn compose_down(
        &mut self,
        compose_file: &str,
        remove_volumes: bool,
    ) -> Result<Option<String>> {
        let volumes = if remove_volumes { "--volumes " } else { "" };
        let command =
            format!("docker compose -f \"{compose_file}\" down {volumes}--remove-orphans");
        let result = self
            .run(TaskGroup::ContainerRuntime, &command, RunOptions::elevated())
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("remove_volumes".into(), remove_volumes.into());
        let mut entry = HistoryEntry::new("compose_down", EntryStatus::Success)
            .command(command)
            .metadata(metadata);
        if let Some(output) = &result {
            entry = entry.output(output.clone());
        }
        self.record(entry);
        Ok(result)
    }

    /// Status string of a single container (e.g. "running", "exited").
    pub async fn container_state(&mut self, name: &str) -> Result<String> {
        let command = format!("docker inspect --format '{{{{.State.Status}}}}' {name}");
        let status = self
            .run(TaskGroup::ContainerRuntime, &command, RunOptions::elevated())
            .await?
            .unwrap_or_default();

        let mut metadata = serde_json::Map::new();
        metadata.insert("name".into(), name.into());
        self.record(
            HistoryEntry::new("container_state", EntryStatus::Success)
                .command(command)
                .output(status.clone())
                .metadata(metadata),
        );
        Ok(status)
    }

    /// Full state of every container on the host, keyed by name.
    ///
    /// Malformed inspect output degrades to a warning and an empty map.
    pub async fn all_container_states(&mut self) -> Result<HashMap<String, ContainerState>> {
        let ids = self
            .run(TaskGroup::ContainerRuntime, "docker ps -aq", RunOptions::elevated())
            .await?
            .unwrap_or_default();
        if ids.trim().is_empty() {
            self.record(
                HistoryEntry::new("all_container_states", EntryStatus::Success).output("{}"),
            );
            return Ok(HashMap::new());
        }

        let id_list = ids.split_whitespace().collect::<Vec<_>>().join(" ");
        let inspect_output = self
            .run(
                TaskGroup::ContainerRuntime,
                &format!("docker inspect {id_list}"),
                RunOptions::elevated(),
            )
            .await?
            .unwrap_or_default();

        match serde_json::from_str::<Vec<InspectedContainer>>(&inspect_output) {
            Ok(containers) => {
                let states: HashMap<String, ContainerState> = containers
                    .into_iter()
                    .map(|c| (c.name.trim_start_matches('/').to_string(), c.state))
                    .collect();
                self.record(
                    HistoryEntry::new("all_container_states", EntryStatus::Success)
                        .output(serde_json::to_string(&states).unwrap_or_default()),
                );
                Ok(states)
            }
            Err(err) => {
                tracing::warn!("failed to parse docker state info: {err}");
                self.record(
                    HistoryEntry::new("all_container_states", EntryStatus::Error)
                        .error(err.to_string()),
                );
                Ok(HashMap::new())
            }
        }
    }

    /// Last `tail` log lines of a container. Degrades to a placeholder
    /// message when nothing can be fetched.
    pub async fn container_logs(&mut self, name: &str, tail: u32) -> Result<String> {
        let command = format!("docker logs --tail {tail} {name}");
        let logs = self
            .run(TaskGroup::ContainerRuntime, &command, RunOptions::elevated())
            .await?
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                tracing::warn!("no logs available for container {name}");
                "no container logs found".to_string()
            });

        let mut metadata = serde_json::Map::new();
        metadata.insert("name".into(), name.into());
        metadata.insert("tail".into(), tail.into());
        self.record(
            HistoryEntry::new("container_logs", EntryStatus::Success)
                .command(command)
                .output(logs.clone())
                .metadata(metadata),
        );
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_payload_decodes_state() {
        let payload = r#"[
            {
                "Name": "/mlflow",
                "State": {
                    "Status": "running",
                    "Running": true,
                    "ExitCode": 0,
                    "StartedAt": "2025-05-01T10:00:00Z",
                    "FinishedAt": "0001-01-01T00:00:00Z"
                }
            }
        ]"#;
        let containers: Vec<InspectedContainer> = serde_json::from_str(payload).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "/mlflow");
        assert!(containers[0].state.running);
        assert_eq!(containers[0].state.status, "running");
    }

    #[test]
    fn test_inspect_payload_tolerates_missing_fields() {
        let payload = r#"[{"Name": "/x", "State": {"Status": "exited"}}]"#;
        let containers: Vec<InspectedContainer> = serde_json::from_str(payload).unwrap();
        assert!(!containers[0].state.running);
        assert_eq!(containers[0].state.exit_code, 0);
    }
}
