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

//! Remote filesystem primitives: directories, symlinks, uploads, atomic
//! writes, structured read-back, and recursive listings.

use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::{
    shell_single_quote, EntryStatus, HistoryEntry, RemoteChannel, RunOptions, TaskExecutor,
    TaskGroup,
};

/// Decoding applied by [`TaskExecutor::read_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Raw,
    Yaml,
    Json,
}

/// One entry of a recursive directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileTreeEntry {
    pub name: String,
    pub path: String,
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    /// `YYYY-mm-dd HH:MM:SS`, remote-local time, sub-second part dropped.
    pub modified: String,
}

impl<C: RemoteChannel> TaskExecutor<C> {
    pub async fn create_dir(&mut self, path: &str) -> Result<()> {
        self.run(
            TaskGroup::Filesystem,
            &format!("mkdir -p {}", shell_single_quote(path)),
            RunOptions::new(),
        )
        .await?;
        self.record_fs("create_dir", path);
        Ok(())
    }

    /// Recursively delete a directory. Privileged; the target may be owned
    /// by a service account.
    pub async fn delete_dir(&mut self, path: &str) -> Result<()> {
        self.run(
            TaskGroup::Filesystem,
            &format!("rm -rf {}", shell_single_quote(path)),
            RunOptions::elevated(),
        )
        .await?;
        self.record_fs("delete_dir", path);
        Ok(())
    }

    /// Upload a local file to the remote host over SFTP.
    pub async fn copy_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("local_path".into(), local_path.display().to_string().into());
        metadata.insert("remote_path".into(), remote_path.into());

        match self.channel_mut().put_file(local_path, remote_path).await {
            Ok(()) => {
                self.record(
                    HistoryEntry::new("copy_file", EntryStatus::Success).metadata(metadata),
                );
                Ok(())
            }
            Err(err) => {
                self.record(
                    HistoryEntry::new("copy_file", EntryStatus::Error)
                        .error(err.to_string())
                        .metadata(metadata),
                );
                Err(Error::Ssh(err))
            }
        }
    }

    /// Copy a path within the remote host (`cp -r`).
    pub async fn copy_dir(&mut self, src: &str, dst: &str, elevated: bool) -> Result<()> {
        let opts = if elevated {
            RunOptions::elevated()
        } else {
            RunOptions::new()
        };
        self.run(
            TaskGroup::Filesystem,
            &format!(
                "cp -r {} {}",
                shell_single_quote(src),
                shell_single_quote(dst)
            ),
            opts,
        )
        .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("src".into(), src.into());
        metadata.insert("dst".into(), dst.into());
        metadata.insert("elevated".into(), elevated.into());
        self.record(HistoryEntry::new("copy_dir", EntryStatus::Success).metadata(metadata));
        Ok(())
    }

    /// Whether a directory exists. Diagnostic: any failure degrades to
    /// `false`.
    pub async fn exists_dir(&mut self, path: &str) -> bool {
        let probe = self
            .run(
                TaskGroup::Filesystem,
                &format!(
                    "test -d {} && echo exists || echo missing",
                    shell_single_quote(path)
                ),
                RunOptions::new(),
            )
            .await;
        match probe {
            Ok(Some(output)) => output.trim() == "exists",
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("existence probe for {path} failed: {err}");
                false
            }
        }
    }

    pub async fn create_symlink(
        &mut self,
        target_path: &str,
        link_path: &str,
        elevated: bool,
    ) -> Result<()> {
        let opts = if elevated {
            RunOptions::elevated()
        } else {
            RunOptions::new()
        };
        self.run(
            TaskGroup::Filesystem,
            &format!(
                "ln -s {} {}",
                shell_single_quote(target_path),
                shell_single_quote(link_path)
            ),
            opts,
        )
        .await?;
        self.record_fs("create_symlink", link_path);
        Ok(())
    }

    pub async fn remove_symlink(&mut self, link_path: &str, elevated: bool) -> Result<()> {
        let opts = if elevated {
            RunOptions::elevated()
        } else {
            RunOptions::new()
        };
        self.run(
            TaskGroup::Filesystem,
            &format!("rm {}", shell_single_quote(link_path)),
            opts,
        )
        .await?;
        self.record_fs("remove_symlink", link_path);
        Ok(())
    }

    pub async fn touch(&mut self, path: &str) -> Result<()> {
        self.run(
            TaskGroup::Filesystem,
            &format!("touch {}", shell_single_quote(path)),
            RunOptions::new(),
        )
        .await?;
        self.record_fs("touch", path);
        Ok(())
    }

    /// Append one line to a file, creating it if absent.
    pub async fn append_line(&mut self, path: &str, line: &str) -> Result<()> {
        self.touch(path).await?;
        self.run(
            TaskGroup::Filesystem,
            &format!(
                "echo {} >> {}",
                shell_single_quote(line),
                shell_single_quote(path)
            ),
            RunOptions::new(),
        )
        .await?;
        self.record_fs("append_line", path);
        Ok(())
    }

    /// In-place sed substitution. `separator` must not occur in `old` or
    /// `new`.
    pub async fn find_and_replace(
        &mut self,
        path: &str,
        old: &str,
        new: &str,
        separator: char,
        elevated: bool,
    ) -> Result<()> {
        let opts = if elevated {
            RunOptions::elevated()
        } else {
            RunOptions::new()
        };
        self.run(
            TaskGroup::Filesystem,
            &format!(
                "sed -i {} {}",
                shell_single_quote(&format!("s{separator}{old}{separator}{new}{separator}g")),
                shell_single_quote(path)
            ),
            opts,
        )
        .await?;
        self.record_fs("find_and_replace", path);
        Ok(())
    }

    /// Write bytes to a remote path.
    ///
    /// Unelevated writes go straight over SFTP. Elevated writes are atomic
    /// from the target's point of view: the content lands on a unique
    /// temporary path first and is then moved into place under privilege,
    /// so a privileged destination never holds a partial write. The
    /// temporary file is removed again if the move fails.
    pub async fn write_file(
        &mut self,
        remote_path: &str,
        contents: &[u8],
        elevated: bool,
    ) -> Result<()> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("remote_path".into(), remote_path.into());
        metadata.insert("elevated".into(), elevated.into());

        if !elevated {
            if let Err(err) = self.channel_mut().put_bytes(remote_path, contents).await {
                self.record(
                    HistoryEntry::new("write_file", EntryStatus::Error)
                        .error(err.to_string())
                        .metadata(metadata),
                );
                return Err(Error::Ssh(err));
            }
            self.record(
                HistoryEntry::new("write_file", EntryStatus::Success).metadata(metadata),
            );
            return Ok(());
        }

        let tmp_path = format!("/tmp/orchestration-{}", Uuid::new_v4());
        if let Err(err) = self.channel_mut().put_bytes(&tmp_path, contents).await {
            self.record(
                HistoryEntry::new("write_file", EntryStatus::Error)
                    .error(err.to_string())
                    .metadata(metadata),
            );
            return Err(Error::Ssh(err));
        }
        tracing::debug!("staged {} bytes at {tmp_path}", contents.len());

        let move_command = format!("mv {tmp_path} {}", shell_single_quote(remote_path));
        let moved = self
            .run(TaskGroup::Filesystem, &move_command, RunOptions::elevated())
            .await?;
        if moved.is_none() {
            // The stage file must not linger; it may hold secrets.
            self.run(
                TaskGroup::Filesystem,
                &format!("rm -f {tmp_path}"),
                RunOptions::elevated(),
            )
            .await?;
            self.record(
                HistoryEntry::new("write_file", EntryStatus::Error)
                    .error("privileged move into place failed".to_string())
                    .metadata(metadata),
            );
            return Err(Error::CommandFailed {
                command: move_command,
                exit_status: 1,
                stderr: "privileged move into place failed; staged file removed".into(),
            });
        }

        self.record(HistoryEntry::new("write_file", EntryStatus::Success).metadata(metadata));
        Ok(())
    }

    /// Fetch a remote file and decode it per `format`.
    ///
    /// `Raw` yields a JSON string value; `Yaml`/`Json` decode into a value
    /// tree. Decode failures raise [`Error::Serialization`].
    pub async fn read_file(
        &mut self,
        remote_path: &str,
        format: FileFormat,
    ) -> Result<serde_json::Value> {
        let bytes = self
            .channel_mut()
            .get_bytes(remote_path)
            .await
            .map_err(Error::Ssh)?;

        let decoded = match format {
            FileFormat::Raw => Ok(serde_json::Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            FileFormat::Yaml => serde_yaml::from_slice::<serde_json::Value>(&bytes)
                .map_err(|e| Error::Serialization(format!("{remote_path}: {e}"))),
            FileFormat::Json => serde_json::from_slice::<serde_json::Value>(&bytes)
                .map_err(|e| Error::Serialization(format!("{remote_path}: {e}"))),
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("remote_path".into(), remote_path.into());
        metadata.insert("format".into(), format!("{format:?}").to_lowercase().into());
        match &decoded {
            Ok(_) => self.record(
                HistoryEntry::new("read_file", EntryStatus::Success).metadata(metadata),
            ),
            Err(err) => self.record(
                HistoryEntry::new("read_file", EntryStatus::Error)
                    .error(err.to_string())
                    .metadata(metadata),
            ),
        }
        decoded
    }

    /// Flat listing of a directory (`ls -A1`). Diagnostic: degrades to an
    /// empty list.
    pub async fn list_files(&mut self, path: &str, elevated: bool) -> Result<Vec<String>> {
        let opts = if elevated {
            RunOptions::elevated()
        } else {
            RunOptions::new()
        };
        let output = self
            .run(
                TaskGroup::Filesystem,
                &format!("ls -A1 {}", shell_single_quote(path)),
                opts,
            )
            .await?
            .unwrap_or_default();
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Recursive listing with type, size, and modification time per entry.
    ///
    /// Lines that do not parse are warned about and skipped.
    pub async fn list_file_tree(
        &mut self,
        path: &str,
        elevated: bool,
    ) -> Result<Vec<FileTreeEntry>> {
        let command = format!(
            "find {} -printf '%p|%y|%s|%TY-%Tm-%Td %TH:%TM:%TS\\n'",
            shell_single_quote(path)
        );
        let opts = if elevated {
            RunOptions::elevated()
        } else {
            RunOptions::new()
        };
        let output = self
            .run(TaskGroup::Filesystem, &command, opts)
            .await?
            .unwrap_or_default();

        let entries = parse_file_tree(&output);
        let mut metadata = serde_json::Map::new();
        metadata.insert("path".into(), path.into());
        metadata.insert("entry_count".into(), entries.len().into());
        self.record(
            HistoryEntry::new("list_file_tree", EntryStatus::Success)
                .command(command)
                .metadata(metadata),
        );
        Ok(entries)
    }

    fn record_fs(&mut self, action: &str, path: &str) {
        let mut metadata = serde_json::Map::new();
        metadata.insert("path".into(), path.into());
        self.record(HistoryEntry::new(action, EntryStatus::Success).metadata(metadata));
    }
}

/// Parse `find -printf '%p|%y|%s|%T...'` output into tree entries.
fn parse_file_tree(output: &str) -> Vec<FileTreeEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let mut parts = line.splitn(4, '|');
        let (Some(path), Some(kind), Some(size), Some(mtime)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            tracing::warn!("unparseable file tree line: {line:?}");
            continue;
        };
        let Ok(size) = size.parse::<u64>() else {
            tracing::warn!("unparseable size in file tree line: {line:?}");
            continue;
        };
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        entries.push(FileTreeEntry {
            name,
            path: path.to_string(),
            is_file: kind == "f",
            is_dir: kind == "d",
            size,
            modified: mtime.split('.').next().unwrap_or(mtime).to_string(),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_tree_splits_fields() {
        let output = "\
/opt/svc|d|4096|2025-05-01 10:00:00.1234\n\
/opt/svc/config.yaml|f|812|2025-05-02 09:30:15.0000";
        let entries = parse_file_tree(output);
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].name, "svc");
        assert!(entries[0].is_dir);
        assert!(!entries[0].is_file);
        assert_eq!(entries[0].size, 4096);
        assert_eq!(entries[0].modified, "2025-05-01 10:00:00");

        assert_eq!(entries[1].name, "config.yaml");
        assert!(entries[1].is_file);
        assert_eq!(entries[1].path, "/opt/svc/config.yaml");
    }

    #[test]
    fn test_parse_file_tree_skips_malformed_lines() {
        let output = "garbage\n/ok|f|1|2025-01-01 00:00:00\nalso|bad";
        let entries = parse_file_tree(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/ok");
    }

    #[test]
    fn test_parse_file_tree_rejects_bad_size() {
        let entries = parse_file_tree("/x|f|notanumber|2025-01-01 00:00:00");
        assert!(entries.is_empty());
    }
}
