//! Terminal rendering of transfer snapshots.

use hlsvod_engine::{TransferSnapshot, TransferStatus};
use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

const BAR_TEMPLATE: &str =
    "{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {wide_msg}";

pub struct TransferBars {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl TransferBars {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::new(),
            style,
        }
    }

    pub fn add(&self, label: &str) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(100));
        bar.set_style(self.style.clone());
        bar.set_prefix(label.to_string());
        bar.set_message("pending");
        bar
    }
}

pub fn render(bar: &ProgressBar, snapshot: &TransferSnapshot) {
    bar.set_position(snapshot.progress.round() as u64);
    bar.set_message(status_line(snapshot));
    if snapshot.status.is_terminal() && !bar.is_finished() {
        bar.finish();
    }
}

fn status_line(snapshot: &TransferSnapshot) -> String {
    match snapshot.status {
        TransferStatus::Downloading | TransferStatus::Paused => {
            let mut line = format!(
                "{}/{} segments  {}  {}/s",
                snapshot.downloaded_segments,
                snapshot.total_segments,
                HumanBytes(snapshot.downloaded_bytes),
                HumanBytes(snapshot.speed as u64),
            );
            if let Some(eta) = snapshot.eta_secs {
                line.push_str(&format!("  eta {}", HumanDuration(Duration::from_secs_f64(eta))));
            }
            if snapshot.status == TransferStatus::Paused {
                line.push_str("  (paused)");
            }
            line
        }
        status => status.to_string(),
    }
}

/// Multi-line summary printed once a transfer is over.
pub fn summary(snapshot: &TransferSnapshot) -> String {
    let mut out = format!(
        "{} [{}] {}",
        snapshot.filename, snapshot.status, snapshot.url
    );
    if let Some(output) = &snapshot.output {
        out.push_str(&format!(
            "\n  output: {} ({})",
            output.path.display(),
            HumanBytes(output.size_bytes)
        ));
    }
    out.push_str(&format!(
        "\n  segments: {}/{}  downloaded: {}",
        snapshot.downloaded_segments,
        snapshot.total_segments,
        HumanBytes(snapshot.downloaded_bytes)
    ));
    if let (Some(started), Some(finished)) = (snapshot.started_at, snapshot.finished_at) {
        if let Ok(elapsed) = (finished - started).to_std() {
            out.push_str(&format!("  in {}", HumanDuration(elapsed)));
        }
    }
    for failure in &snapshot.failed_segments {
        out.push_str(&format!(
            "\n  segment {} failed: {}",
            failure.index, failure.reason
        ));
    }
    if let Some(error) = &snapshot.error {
        out.push_str(&format!("\n  error: {error}"));
    }
    for path in &snapshot.lingering_artifacts {
        out.push_str(&format!("\n  left behind: {}", path.display()));
    }
    out
}
