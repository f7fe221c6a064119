//! Transfer progress display with progress bars.

use indicatif::{ProgressBar, ProgressStyle};
use shroud_core::TransferProgress;
use std::time::Duration;

const TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Progress bar for one transfer
pub struct ProgressDisplay {
    bar: ProgressBar,
    label: String,
}

impl ProgressDisplay {
    /// Create a bar for `total_bytes` of ciphertext
    #[must_use]
    pub fn new(total_bytes: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);

        match ProgressStyle::default_bar().template(TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => tracing::debug!("Progress template rejected: {}", e),
        }
        bar.set_message(label.to_string());

        Self {
            bar,
            label: label.to_string(),
        }
    }

    /// Apply an engine progress snapshot
    pub fn update(&self, progress: &TransferProgress) {
        if progress.bytes_total != self.bar.length().unwrap_or(0) {
            self.bar.set_length(progress.bytes_total);
        }
        self.bar.set_position(progress.bytes_done);

        let quality = progress
            .quality
            .map_or_else(String::new, |q| format!(", {q} link"));
        self.bar.set_message(format!(
            "{} [{}/{} chunks, {}{}]",
            self.label,
            progress.chunks_done,
            progress.chunks_total,
            progress.speed_string(),
            quality
        ));
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the progress bar (for errors)
    pub fn abandon_with_message(&self, msg: String) {
        self.bar.abandon_with_message(msg);
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
