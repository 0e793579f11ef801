// On-disk segment artifacts for a single transfer, kept in their own
// sub-directory of the work directory so they never share a namespace with the
// assembled output.

use crate::assembly::SegmentArtifact;
use crate::error::TransferError;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

const SEGMENTS_DIR: &str = "segments";
const SEGMENT_PREFIX: &str = "segment_";

/// `segment_<index:05>.ts`, or its `.ts.part` while being written.
fn is_artifact_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(SEGMENT_PREFIX) else {
        return false;
    };
    let Some(digits) = rest
        .strip_suffix(".ts.part")
        .or_else(|| rest.strip_suffix(".ts"))
    else {
        return false;
    };
    digits.len() >= 5 && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Outcome of removing a transfer's segment artifacts.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: usize,
    /// Paths still on disk, with the reason removal failed.
    pub lingering: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.lingering.is_empty()
    }

    pub fn lingering_paths(&self) -> Vec<PathBuf> {
        self.lingering.iter().map(|(path, _)| path.clone()).collect()
    }

    /// One-line summary suitable for a snapshot's error field.
    pub fn describe(&self) -> String {
        let details: Vec<String> = self
            .lingering
            .iter()
            .map(|(path, reason)| format!("{}: {reason}", path.display()))
            .collect();
        format!(
            "failed to remove {} segment artifact(s): {}",
            self.lingering.len(),
            details.join("; ")
        )
    }
}

#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    /// Store for the transfer whose work directory is `work_dir`.
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: work_dir.as_ref().join(SEGMENTS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{SEGMENT_PREFIX}{index:05}.ts"))
    }

    pub async fn ensure_dir(&self) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TransferError::filesystem("creating segment directory", &self.dir, e))
    }

    /// Write a segment's plaintext. A partial file is written under a
    /// temporary name and only renamed into place once complete.
    pub async fn write(&self, index: usize, data: &[u8]) -> Result<SegmentArtifact, TransferError> {
        let path = self.path_for(index);
        let partial = path.with_extension("ts.part");

        if let Err(e) = tokio::fs::write(&partial, data).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::filesystem("writing segment", &partial, e));
        }
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| TransferError::filesystem("finalizing segment", &path, e))?;

        debug!(index, path = %path.display(), bytes = data.len(), "Segment written");
        Ok(SegmentArtifact {
            index,
            path,
            bytes: data.len() as u64,
        })
    }

    /// Remove every segment artifact, complete or partial, then the segment
    /// directory itself if nothing else remains.
    pub async fn remove_all(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "Cannot list segment directory for cleanup");
                report.lingering.push((self.dir.clone(), e.to_string()));
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    report.lingering.push((self.dir.clone(), e.to_string()));
                    break;
                }
            };
            let is_segment = entry
                .file_name()
                .to_str()
                .is_some_and(is_artifact_name);
            if !is_segment {
                continue;
            }
            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to remove segment artifact");
                    report.lingering.push((path, e.to_string()));
                }
            }
        }

        // Only succeeds when empty; unrelated files keep it.
        if report.is_clean() && tokio::fs::remove_dir(&self.dir).await.is_err() {
            debug!(dir = %self.dir.display(), "Segment directory kept, not empty");
        }

        if !report.is_clean() {
            warn!(
                removed = report.removed,
                lingering = report.lingering.len(),
                "Segment cleanup incomplete"
            );
        }
        report
    }
}
