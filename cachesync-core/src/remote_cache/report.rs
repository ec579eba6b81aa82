//! Per-key results of best-effort export passes.

use std::fmt;

/// Why an export did not write to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The remote object existed when the cache was mounted.
    AlreadyCached,
    /// No remote store is configured.
    RemoteDisabled,
}

/// Result of exporting a single cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Exported,
    Skipped(SkipReason),
    Failed(String),
}

impl ExportOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ExportOutcome::Failed(_))
    }
}

impl fmt::Display for ExportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportOutcome::Exported => f.write_str("exported"),
            ExportOutcome::Skipped(SkipReason::AlreadyCached) => f.write_str("skipped (cached)"),
            ExportOutcome::Skipped(SkipReason::RemoteDisabled) => {
                f.write_str("skipped (remote disabled)")
            }
            ExportOutcome::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

/// Ordered `(remote key, outcome)` pairs of one export pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    entries: Vec<(String, ExportOutcome)>,
}

impl ExportReport {
    pub fn push(&mut self, key: impl Into<String>, outcome: ExportOutcome) {
        self.entries.push((key.into(), outcome));
    }

    pub fn entries(&self) -> &[(String, ExportOutcome)] {
        &self.entries
    }

    /// Returns the outcome recorded for `key`.
    pub fn outcome(&self, key: &str) -> Option<&ExportOutcome> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, outcome)| outcome)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of caches written to the store.
    pub fn exported(&self) -> usize {
        self.count(|o| matches!(o, ExportOutcome::Exported))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ExportOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(ExportOutcome::is_failure)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, predicate: impl Fn(&ExportOutcome) -> bool) -> usize {
        self.entries.iter().filter(|(_, o)| predicate(o)).count()
    }
}
