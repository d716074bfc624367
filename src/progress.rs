//! Progress indicators for long VM operations

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner shown while waiting on a VM, hidden when `quiet`
pub fn spinner(msg: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Finish a spinner leaving a result line behind
pub fn finish(pb: &ProgressBar, ok: bool, msg: &str) {
    let mark = if ok { "✓" } else { "✗" };
    pb.finish_with_message(format!("{mark} {msg}"));
}
