// Transfer lifecycle state, per-segment records and read-only snapshots.

use crate::assembly::{AssemblyOutput, OutputFormat};
use crate::hls::progress::ProgressReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a transfer.
///
/// `pending` and the terminal states are not re-entrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }

    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Downloading | Failed | Cancelled) => true,
            (Downloading, Paused | Completed | Failed | Cancelled) => true,
            // A pause requested during the last segment or assembly does not
            // block the terminal outcome.
            (Paused, Downloading | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SegmentOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Per-segment record. Results are appended in playlist order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentResult {
    pub index: usize,
    pub bytes: u64,
    #[serde(flatten)]
    pub outcome: SegmentOutcome,
    pub retries: u32,
}

impl SegmentResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == SegmentOutcome::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFailure {
    pub index: usize,
    pub reason: String,
}

/// Mutable state of one transfer. Written by its engine and control plane only.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub task_id: String,
    pub url: String,
    pub filename: String,
    pub format: OutputFormat,
    pub status: TransferStatus,
    pub progress: ProgressReport,
    pub segments: Vec<SegmentResult>,
    pub error: Option<String>,
    /// Artifacts that could not be removed during cancel cleanup.
    pub lingering_artifacts: Vec<PathBuf>,
    pub output: Option<AssemblyOutput>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferState {
    pub fn new(
        task_id: impl Into<String>,
        url: impl Into<String>,
        filename: impl Into<String>,
        format: OutputFormat,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            url: url.into(),
            filename: filename.into(),
            format,
            status: TransferStatus::Pending,
            progress: ProgressReport::default(),
            segments: Vec::new(),
            error: None,
            lingering_artifacts: Vec::new(),
            output: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a lifecycle transition, returning `false` if it is not allowed.
    pub fn transition(&mut self, next: TransferStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == TransferStatus::Downloading && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        true
    }

    /// Append a segment result. Indices must arrive in playlist order.
    pub fn record_segment(&mut self, result: SegmentResult) {
        debug_assert_eq!(result.index, self.segments.len());
        self.segments.push(result);
    }

    pub fn failures(&self) -> Vec<SegmentFailure> {
        self.segments
            .iter()
            .filter_map(|s| match &s.outcome {
                SegmentOutcome::Failed { reason } => Some(SegmentFailure {
                    index: s.index,
                    reason: reason.clone(),
                }),
                SegmentOutcome::Succeeded => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            task_id: self.task_id.clone(),
            url: self.url.clone(),
            filename: self.filename.clone(),
            format: self.format,
            status: self.status,
            progress: self.progress.percent,
            downloaded_bytes: self.progress.downloaded_bytes,
            total_bytes: self.progress.total_bytes_estimate,
            downloaded_segments: self.progress.downloaded_segments,
            total_segments: self.progress.total_segments,
            speed: self.progress.speed,
            eta_secs: self.progress.eta.map(|eta| eta.as_secs_f64()),
            segments: self.segments.clone(),
            failed_segments: self.failures(),
            error: self.error.clone(),
            lingering_artifacts: self.lingering_artifacts.clone(),
            output: self.output.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Immutable view handed to status readers.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub task_id: String,
    pub url: String,
    pub filename: String,
    pub format: OutputFormat,
    pub status: TransferStatus,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub downloaded_segments: usize,
    pub total_segments: usize,
    /// Bytes per second.
    pub speed: f64,
    pub eta_secs: Option<f64>,
    /// Per-segment results in playlist order.
    pub segments: Vec<SegmentResult>,
    pub failed_segments: Vec<SegmentFailure>,
    pub error: Option<String>,
    pub lingering_artifacts: Vec<PathBuf>,
    pub output: Option<AssemblyOutput>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
