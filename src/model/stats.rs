use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;

/// Counts for one migration or repair run over one owner.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunStats {
    pub scanned: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, rhs: Self) {
        self.scanned += rhs.scanned;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
        self.errored += rhs.errored;
    }
}

/// The result for a single owner in a multi-owner run.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OwnerOutcome<T> {
    pub stats: T,
    /// Set when the owner's run stopped early. Counts up to that point are still reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-owner results keyed by owner id.
pub type OwnerReport<T> = BTreeMap<String, OwnerOutcome<T>>;

/// Sums the per-owner stats of a report.
pub fn total(report: &OwnerReport<RunStats>) -> RunStats {
    let mut sum = RunStats::default();
    for outcome in report.values() {
        sum += outcome.stats;
    }
    sum
}

/// Whether any owner in the report failed.
pub fn any_failed<T>(report: &OwnerReport<T>) -> bool {
    report.values().any(|o| o.error.is_some())
}
