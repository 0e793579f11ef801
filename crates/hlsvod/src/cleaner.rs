//! Sweeps stale per-transfer work directories left under the work root.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub skipped_active: usize,
    pub failed: usize,
}

/// Remove direct sub-directories of `root` last modified more than `max_age`
/// ago, skipping the ids in `active_ids`. A zero `max_age` disables the sweep.
pub async fn sweep_stale_work_dirs(
    root: &Path,
    max_age: Duration,
    active_ids: &HashSet<String>,
) -> SweepReport {
    let mut report = SweepReport::default();
    if max_age.is_zero() {
        debug!("Work directory sweep disabled");
        return report;
    }

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Cannot read work root");
            report.failed += 1;
            return report;
        }
    };

    let now = SystemTime::now();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_dir() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat work directory");
                report.failed += 1;
                continue;
            }
        };

        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| active_ids.contains(name))
        {
            report.skipped_active += 1;
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), age_secs = age.as_secs(), "Removed stale work directory");
                report.removed.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove stale work directory");
                report.failed += 1;
            }
        }
    }

    info!(
        removed = report.removed.len(),
        skipped_active = report.skipped_active,
        failed = report.failed,
        "Work directory sweep finished"
    );
    report
}
