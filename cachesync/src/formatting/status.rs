//! Status symbols and colored messages.

use cachesync_core::remote_cache::ExportOutcome;
use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    Warning,
    Info,
}

impl Status {
    pub fn symbol(&self) -> &'static str {
        match self {
            Status::Success => "✓",
            Status::Error => "✗",
            Status::Warning => "⚠",
            Status::Info => "→",
        }
    }

    /// Paints `text` in the color of this status.
    pub fn paint(&self, text: &str) -> String {
        match self {
            Status::Success => text.green().bold().to_string(),
            Status::Error => text.red().bold().to_string(),
            Status::Warning => text.yellow().bold().to_string(),
            Status::Info => text.cyan().to_string(),
        }
    }

    /// Formats `message` behind the colored symbol.
    pub fn format(&self, message: &str) -> String {
        format!("{} {}", self.paint(self.symbol()), self.paint(message))
    }
}

impl From<&ExportOutcome> for Status {
    fn from(outcome: &ExportOutcome) -> Self {
        match outcome {
            ExportOutcome::Exported => Status::Success,
            ExportOutcome::Skipped(_) => Status::Info,
            ExportOutcome::Failed(_) => Status::Error,
        }
    }
}

pub fn print_success(message: &str) {
    println!("  {}", Status::Success.format(message));
}

pub fn print_warning(message: &str) {
    println!("  {}", Status::Warning.format(message));
}
