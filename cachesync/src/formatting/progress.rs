//! Spinners for long-running transfers.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Creates a ticking spinner showing `message`.
///
/// Hidden when `quiet` is set, so callers can drive it unconditionally.
pub fn create_spinner(message: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("  {spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
