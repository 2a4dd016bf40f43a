use crate::model::CategoryLabel;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Records how a category decision was reached.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionSource {
    /// Matched one of the owner's own keyword rules.
    UserRule,
    /// Matched a keyword rule in the shared global table.
    GlobalRule,
    /// Matched a local pattern in the heuristic scorer.
    Heuristic,
    /// Classified by the generative model.
    AiDeep,
    /// Every tier was exhausted, or resolution failed.
    #[default]
    Unresolved,
}

serde_plain::derive_display_from_serialize!(ResolutionSource);
serde_plain::derive_fromstr_from_deserialize!(ResolutionSource);

/// A bank transaction as held in the ledger. The provider-assigned `transaction_id` is the
/// document key, so re-delivering the same record overwrites rather than duplicates it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub user_id: String,
    pub account_id: String,
    /// Signed: positive is inbound, negative is outbound.
    pub amount: Decimal,
    pub description: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub category: CategoryLabel,
    #[serde(default)]
    pub source: ResolutionSource,
    #[serde(default)]
    pub explanation: String,
    /// The aggregator's own category guess, if it sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_category: Option<String>,
    /// Set when a person chose the category by hand. Such records are never re-resolved.
    #[serde(default)]
    pub manual: bool,
    /// Soft-deletion flag for records the aggregator reported as removed.
    #[serde(default)]
    pub removed: bool,
}

impl TransactionRecord {
    /// Whether the stored category came from an explicit decision that a re-sync of the same
    /// description should keep.
    pub fn has_settled_category(&self) -> bool {
        self.manual || self.source != ResolutionSource::Unresolved
    }
}
