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

//! Version-control operations over the remote git CLI.

use crate::error::Result;
use crate::executor::{
    EntryStatus, HistoryEntry, RemoteChannel, RunOptions, TaskExecutor, TaskGroup,
};

impl<C: RemoteChannel> TaskExecutor<C> {
    /// Clone a repository into `install_path`, creating the path first.
    pub async fn git_clone(&mut self, repo_url: &str, install_path: &str) -> Result<()> {
        self.create_dir(install_path).await?;
        self.run(
            TaskGroup::VersionControl,
            &format!("cd {install_path}; git clone {repo_url}"),
            RunOptions::new(),
        )
        .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("repo_url".into(), repo_url.into());
        metadata.insert("install_path".into(), install_path.into());
        self.record(HistoryEntry::new("git_clone", EntryStatus::Success).metadata(metadata));
        Ok(())
    }

    /// Fast-forward an existing checkout.
    pub async fn git_pull(&mut self, repo_path: &str) -> Result<Option<String>> {
        let result = self
            .run(
                TaskGroup::VersionControl,
                &format!("cd {repo_path}; git pull --ff-only"),
                RunOptions::new(),
            )
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("repo_path".into(), repo_path.into());
        let mut entry = HistoryEntry::new("git_pull", EntryStatus::Success).metadata(metadata);
        if let Some(output) = &result {
            entry = entry.output(output.clone());
        }
        self.record(entry);
        Ok(result)
    }
}
