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

//! Bounded, chronological execution history.
//!
//! Every operation the executor performs appends exactly one entry here,
//! success or failure. The buffer is a fixed-capacity ring: once full, the
//! oldest entry is evicted to make room. Observability layers read a cloned
//! snapshot and never hold a reference into the live buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of entries retained before eviction starts.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    Error,
}

/// One recorded attempt of a remote operation.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(action: impl Into<String>, status: EntryStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            status,
            command: None,
            exit_code: None,
            output: None,
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn exit_code(mut self, exit_code: u32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Fixed-capacity chronological record of executed operations.
#[derive(Debug)]
pub struct ExecutionHistory {
    limit: usize,
    entries: VecDeque<HistoryEntry>,
}

impl ExecutionHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::with_capacity(limit.max(1)),
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A read-only snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_appends_in_order() {
        let mut history = ExecutionHistory::new(10);
        history.record(HistoryEntry::new("first", EntryStatus::Success));
        history.record(HistoryEntry::new("second", EntryStatus::Error));

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].action, "first");
        assert_eq!(snapshot[1].action, "second");
    }

    #[test]
    fn test_ring_evicts_oldest_first() {
        let mut history = ExecutionHistory::new(3);
        for i in 0..5 {
            history.record(HistoryEntry::new(format!("op-{i}"), EntryStatus::Success));
        }

        assert_eq!(history.len(), 3, "buffer must never exceed its limit");
        let actions: Vec<_> = history.snapshot().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["op-2", "op-3", "op-4"]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut history = ExecutionHistory::new(3);
        history.record(HistoryEntry::new("op", EntryStatus::Success));
        let snapshot = history.snapshot();
        history.record(HistoryEntry::new("later", EntryStatus::Success));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_entry_serializes_without_empty_fields() {
        let entry = HistoryEntry::new("apt", EntryStatus::Success).command("apt install jq");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["action"], "apt");
        assert_eq!(value["status"], "success");
        assert!(value.get("error").is_none());
        assert!(value.get("metadata").is_none());
    }
}
