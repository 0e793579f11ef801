use crate::cli::DownloadArgs;
use crate::error::{AppError, Result};
use crate::output::{self, TransferBars};
use hlsvod_engine::{DownloadManager, EngineConfig, TransferStatus, sweep_stale_work_dirs};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// Run every URL as its own transfer and report how each one ended.
pub async fn download(config: EngineConfig, args: DownloadArgs) -> Result<()> {
    let manager = Arc::new(DownloadManager::new(config)?);
    let bars = TransferBars::new();

    let mut tasks = Vec::with_capacity(args.urls.len());
    for (n, url) in args.urls.iter().enumerate() {
        let name = output_name(args.output.as_deref(), n, args.urls.len());
        let id = manager.create_task(url, name.as_deref(), None)?;
        let label = manager.task_status(&id)?.filename;
        tasks.push((id, bars.add(&label)));
    }
    for (id, _) in &tasks {
        manager.start_task(id)?;
    }

    let interrupt = {
        let manager = manager.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling all transfers");
                for snapshot in manager.list_tasks() {
                    if !snapshot.status.is_terminal() {
                        // Already finished in the meantime is fine.
                        let _ = manager.cancel_task(&snapshot.task_id);
                    }
                }
            }
        })
    };

    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        ticker.tick().await;
        let mut finished = true;
        for (id, bar) in &tasks {
            let snapshot = manager.task_status(id)?;
            output::render(bar, &snapshot);
            finished &= snapshot.status.is_terminal();
        }
        if finished {
            break;
        }
    }
    interrupt.abort();

    let mut unfinished = 0;
    for (id, _) in &tasks {
        let snapshot = manager.wait(id).await?;
        if snapshot.status != TransferStatus::Completed {
            unfinished += 1;
        }
        println!("{}", output::summary(&snapshot));
    }

    if unfinished > 0 {
        return Err(AppError::Unfinished {
            unfinished,
            total: tasks.len(),
        });
    }
    Ok(())
}

/// `-o name` applies as is to a single URL and gets a 1-based suffix otherwise.
fn output_name(base: Option<&str>, n: usize, total: usize) -> Option<String> {
    base.map(|base| {
        if total > 1 {
            format!("{base}_{}", n + 1)
        } else {
            base.to_string()
        }
    })
}

pub async fn sweep(
    mut config: EngineConfig,
    max_age_days: Option<u64>,
    work_dir: Option<PathBuf>,
) -> Result<()> {
    if let Some(days) = max_age_days {
        config.cleanup.max_age_days = days;
    }
    if let Some(work_dir) = work_dir {
        config.transfer.work_root = work_dir;
    }

    // A standalone sweep has no live transfers of its own.
    let report = sweep_stale_work_dirs(
        &config.transfer.work_root,
        config.cleanup.max_age(),
        &HashSet::new(),
    )
    .await;
    for path in &report.removed {
        println!("removed {}", path.display());
    }
    info!(
        removed = report.removed.len(),
        failed = report.failed,
        "Sweep done"
    );
    if report.failed > 0 {
        return Err(AppError::InvalidInput(format!(
            "{} work directories could not be removed",
            report.failed
        )));
    }
    Ok(())
}
