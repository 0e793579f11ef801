//! Download manager: task registry plus a bounded pool of running transfers.
//!
//! The registry is owned here and each task writes only its own state cell;
//! nothing is process-global.

use crate::assembly::OutputFormat;
use crate::cleaner::{SweepReport, sweep_stale_work_dirs};
use crate::config::EngineConfig;
use crate::error::TransferError;
use crate::hls::engine::{TransferRequest, TransferServices};
use crate::hls::state::TransferSnapshot;
use crate::task::DownloadTask;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

/// Characters that are invalid in Windows filenames
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub struct DownloadManager {
    config: Arc<EngineConfig>,
    services: TransferServices,
    tasks: DashMap<String, Arc<DownloadTask>>,
    permits: Arc<Semaphore>,
}

impl DownloadManager {
    /// Build a manager with HTTP fetchers and the default assembler from `config`.
    pub fn new(config: EngineConfig) -> Result<Self, TransferError> {
        let services = TransferServices::from_config(&config)?;
        Ok(Self::with_services(config, services))
    }

    pub fn with_services(config: EngineConfig, services: TransferServices) -> Self {
        let slots = config.manager.max_concurrent_downloads.max(1);
        Self {
            config: Arc::new(config),
            services,
            tasks: DashMap::new(),
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a transfer in `pending`. Returns its id.
    pub fn create_task(
        &self,
        url: &str,
        filename: Option<&str>,
        format: Option<OutputFormat>,
    ) -> Result<String, TransferError> {
        let url = parse_playlist_url(url)?;
        let task_id = uuid::Uuid::new_v4().to_string();
        let output_stem = filename
            .map(sanitize_filename)
            .unwrap_or_else(|| default_stem(&url, &task_id));
        let work_dir = self.config.transfer.work_root.join(&task_id);
        let output_dir = self
            .config
            .transfer
            .output_dir
            .clone()
            .unwrap_or_else(|| work_dir.clone());
        let format = format.unwrap_or(self.config.transfer.output_format);

        let request = TransferRequest {
            task_id: task_id.clone(),
            url,
            output_stem,
            format,
            work_dir,
            output_dir,
        };
        info!(task_id = %task_id, url = %request.url, %format, "Task created");
        let task = DownloadTask::new(request, self.config.clone(), self.services.clone());
        self.tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    fn get(&self, id: &str) -> Result<Arc<DownloadTask>, TransferError> {
        self.tasks
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransferError::NotFound { id: id.to_string() })
    }

    /// Queue the transfer; it leaves `pending` once a concurrency slot is free.
    pub fn start_task(&self, id: &str) -> Result<(), TransferError> {
        self.get(id)?.start(Some(self.permits.clone()))
    }

    pub fn pause_task(&self, id: &str) -> Result<(), TransferError> {
        self.get(id)?.pause()
    }

    pub fn resume_task(&self, id: &str) -> Result<(), TransferError> {
        self.get(id)?.resume()
    }

    pub fn cancel_task(&self, id: &str) -> Result<(), TransferError> {
        self.get(id)?.cancel()
    }

    pub fn task_status(&self, id: &str) -> Result<TransferSnapshot, TransferError> {
        Ok(self.get(id)?.snapshot())
    }

    /// Snapshots of every registered task, oldest first.
    pub fn list_tasks(&self) -> Vec<TransferSnapshot> {
        let mut snapshots: Vec<_> = self.tasks.iter().map(|t| t.value().snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Wait for the task to reach a terminal status.
    pub async fn wait(&self, id: &str) -> Result<TransferSnapshot, TransferError> {
        let task = self.get(id)?;
        Ok(task.wait().await)
    }

    /// Cancel the task if it is still live, forget it and delete its work directory.
    pub async fn remove_task(&self, id: &str) -> Result<TransferSnapshot, TransferError> {
        let (_, task) = self
            .tasks
            .remove(id)
            .ok_or_else(|| TransferError::NotFound { id: id.to_string() })?;

        if !task.status().is_terminal() {
            // A concurrent transition to a terminal status is fine here.
            let _ = task.cancel();
        }
        let snapshot = task.wait().await;

        match tokio::fs::remove_dir_all(task.work_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to delete work directory");
                return Err(TransferError::filesystem(
                    "removing work directory",
                    task.work_dir(),
                    e,
                ));
            }
        }
        info!(task_id = %id, status = %snapshot.status, "Task removed");
        Ok(snapshot)
    }

    /// Ids of tasks that have not reached a terminal status.
    pub fn active_ids(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|t| !t.value().status().is_terminal())
            .map(|t| t.key().clone())
            .collect()
    }

    /// Sweep stale work directories, never touching live tasks.
    pub async fn sweep_work_dirs(&self) -> SweepReport {
        sweep_stale_work_dirs(
            &self.config.transfer.work_root,
            self.config.cleanup.max_age(),
            &self.active_ids(),
        )
        .await
    }
}

fn parse_playlist_url(input: &str) -> Result<Url, TransferError> {
    let url = Url::parse(input.trim())
        .map_err(|e| TransferError::invalid_url(input, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransferError::invalid_url(
            input,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

/// Last path segment without its extension, or the task id.
fn default_stem(url: &Url, task_id: &str) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.').map(|(stem, _)| stem).or(Some(last)))
        .filter(|stem| !stem.is_empty())
        .map(sanitize_filename)
        .unwrap_or_else(|| task_id.to_string())
}

/// Replace characters that are invalid on common filesystems with `_`.
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;
    for c in input.chars() {
        if c.is_control() || INVALID_FILENAME_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }
    let trimmed = result.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_filename("a/b:c"), "a_b_c");
        assert_eq!(sanitize_filename("what??"), "what_");
        assert_eq!(sanitize_filename("..."), "unnamed");
        assert_eq!(sanitize_filename("电影 第1集"), "电影 第1集");
    }

    #[test]
    fn default_stem_comes_from_the_url() {
        let url = Url::parse("https://e.com/show/episode-3.m3u8?token=x").unwrap();
        assert_eq!(default_stem(&url, "id"), "episode-3");
        let bare = Url::parse("https://e.com/").unwrap();
        assert_eq!(default_stem(&bare, "id"), "id");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            parse_playlist_url("ftp://e.com/a.m3u8"),
            Err(TransferError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_playlist_url("not a url"),
            Err(TransferError::InvalidUrl { .. })
        ));
        assert!(parse_playlist_url(" https://e.com/a.m3u8 ").is_ok());
    }
}
