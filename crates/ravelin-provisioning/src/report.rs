//! Report aggregation.
//!
//! Every processed record and every propagation task yields exactly one
//! [`ReportEntry`]. Entries accumulate in the session's [`Reporter`], a
//! mutex-guarded append-only collection safe for concurrent task workers.
//! Rendering is a pure projection over a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Final status of one record or one propagation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The operation completed.
    Success,
    /// The record was deliberately skipped (rule, policy or hook decision).
    Ignore,
    /// The operation failed after exhausting its retries.
    Failure,
    /// The task was never dispatched (prior priority failure or
    /// cancellation).
    NotAttempted,
}

impl ReportStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Success => "success",
            ReportStatus::Ignore => "ignore",
            ReportStatus::Failure => "failure",
            ReportStatus::NotAttempted => "not_attempted",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation performed (or planned) against a resource or the identity
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Create,
    Update,
    Delete,
    /// No remote operation: link/unlink bookkeeping or a converged no-op.
    None,
}

impl TaskOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOperation::Create => "create",
            TaskOperation::Update => "update",
            TaskOperation::Delete => "delete",
            TaskOperation::None => "none",
        }
    }
}

impl fmt::Display for TaskOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Outcome classification.
    pub status: ReportStatus,
    /// Operation this entry describes.
    pub operation: TaskOperation,
    /// Key of the affected object (identity id, or resource-native key
    /// when no identity is involved).
    pub object_key: String,
    /// Human-readable object name.
    pub object_name: String,
    /// Kind of identity object ("user", "group", "any").
    pub any_type: String,
    /// Resource this entry concerns; `None` for the local reconciliation
    /// step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Outcome detail, e.g. the last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Connector calls performed; 0 for skipped or local-only entries.
    pub attempts: u32,
    /// When this entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl ReportEntry {
    /// Create an entry with the given outcome.
    pub fn new(
        status: ReportStatus,
        operation: TaskOperation,
        object_key: impl Into<String>,
        object_name: impl Into<String>,
        any_type: impl Into<String>,
    ) -> Self {
        Self {
            status,
            operation,
            object_key: object_key.into(),
            object_name: object_name.into(),
            any_type: any_type.into(),
            resource: None,
            message: None,
            attempts: 0,
            recorded_at: Utc::now(),
        }
    }

    /// Set the resource name.
    #[must_use]
    pub fn on_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the detail message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the number of connector calls performed.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether this entry describes a non-success outcome.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            ReportStatus::Failure | ReportStatus::NotAttempted
        )
    }
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub success: usize,
    pub ignored: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

impl ReportCounts {
    fn add(&mut self, status: ReportStatus) {
        match status {
            ReportStatus::Success => self.success += 1,
            ReportStatus::Ignore => self.ignored += 1,
            ReportStatus::Failure => self.failed += 1,
            ReportStatus::NotAttempted => self.not_attempted += 1,
        }
    }

    /// Total number of entries counted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.success + self.ignored + self.failed + self.not_attempted
    }
}

/// Verbosity of a rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    /// Counts only.
    Summary,
    /// Entries that did not succeed (failures and skipped tasks).
    Failures,
    /// Every entry.
    All,
}

/// A rendered view over the accumulated entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedReport {
    /// Counts over all entries, regardless of level.
    pub counts: ReportCounts,
    /// Entries selected by the level; empty for `Summary`.
    pub entries: Vec<ReportEntry>,
}

/// Thread-safe, append-only result collection for one session.
///
/// Cloning shares the underlying collection; task workers append
/// concurrently and the session exposes snapshots.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    entries: Arc<Mutex<Vec<ReportEntry>>>,
}

impl Reporter {
    /// Create an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry.
    pub fn append(&self, entry: ReportEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
    }

    /// Append several entries as one batch, preserving their order.
    pub fn extend(&self, batch: impl IntoIterator<Item = ReportEntry>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.extend(batch);
    }

    /// Number of entries recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no entry has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries in append order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ReportEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Counts by status.
    #[must_use]
    pub fn counts(&self) -> ReportCounts {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = ReportCounts::default();
        for entry in entries.iter() {
            counts.add(entry.status);
        }
        counts
    }

    /// Render the report at the given level. Pure projection: the
    /// underlying entries are not consumed or altered.
    #[must_use]
    pub fn render(&self, level: ReportLevel) -> RenderedReport {
        let entries = self.snapshot();
        let mut counts = ReportCounts::default();
        for entry in &entries {
            counts.add(entry.status);
        }

        let selected = match level {
            ReportLevel::Summary => Vec::new(),
            ReportLevel::Failures => entries.into_iter().filter(ReportEntry::is_failure).collect(),
            ReportLevel::All => entries,
        };

        RenderedReport {
            counts,
            entries: selected,
        }
    }
}
