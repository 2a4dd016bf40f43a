//! The four-level category taxonomy.
//!
//! Level 0 is the broad accounting classification and must be one of six canonical values. The
//! lower levels are free-form strings, conventionally drawn from a per-`L0` vocabulary.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The six canonical level-0 classifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum L0 {
    #[serde(rename = "INCOME")]
    Income,
    #[serde(rename = "OPERATING EXPENSE")]
    OperatingExpense,
    #[serde(rename = "EXPENSE")]
    Expense,
    #[serde(rename = "ASSET")]
    Asset,
    #[serde(rename = "LIABILITY")]
    Liability,
    #[serde(rename = "EQUITY")]
    Equity,
}

serde_plain::derive_display_from_serialize!(L0);
serde_plain::derive_fromstr_from_deserialize!(L0);

impl L0 {
    pub const ALL: [L0; 6] = [
        L0::Income,
        L0::OperatingExpense,
        L0::Expense,
        L0::Asset,
        L0::Liability,
        L0::Equity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            L0::Income => "INCOME",
            L0::OperatingExpense => "OPERATING EXPENSE",
            L0::Expense => "EXPENSE",
            L0::Asset => "ASSET",
            L0::Liability => "LIABILITY",
            L0::Equity => "EQUITY",
        }
    }

    /// Outbound money leans towards an operating expense, everything else towards income.
    pub fn from_sign(amount: Decimal) -> L0 {
        if amount.is_sign_negative() && !amount.is_zero() {
            L0::OperatingExpense
        } else {
            L0::Income
        }
    }
}

/// Synonym fragments, checked in order against the lowercased raw value.
const SYNONYMS: &[(&str, L0)] = &[
    ("expense", L0::OperatingExpense),
    ("operating", L0::OperatingExpense),
    ("income", L0::Income),
    ("asset", L0::Asset),
    ("liability", L0::Liability),
    ("liabilities", L0::Liability),
    ("equity", L0::Equity),
];

/// Maps any historical or freeform level-0 value onto the six-set. Total: every input yields a
/// canonical value.
///
/// 1. empty input is inferred from the sign of `amount`
/// 2. a case-insensitive exact match wins
/// 3. then synonym fragments (`"expenses"` becomes `OPERATING EXPENSE`, and so on)
/// 4. anything else falls back to the sign of `amount`
pub fn normalize_l0(raw: &str, amount: Decimal) -> L0 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return L0::from_sign(amount);
    }
    if let Some(exact) = L0::ALL
        .iter()
        .find(|l0| l0.as_str().eq_ignore_ascii_case(trimmed))
    {
        return *exact;
    }
    let lower = trimmed.to_lowercase();
    SYNONYMS
        .iter()
        .find(|(fragment, _)| lower.contains(fragment))
        .map(|(_, l0)| *l0)
        .unwrap_or_else(|| L0::from_sign(amount))
}

/// A position in the taxonomy as persisted. `l0` is kept as a string because stored records may
/// still carry legacy values; labels produced by this crate always carry a canonical `l0`.
#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CategoryLabel {
    #[serde(default)]
    pub l0: String,
    #[serde(default)]
    pub l1: String,
    #[serde(default)]
    pub l2: String,
    #[serde(default)]
    pub l3: String,
}

pub(crate) const NEEDS_REVIEW: &str = "Needs Review";

impl CategoryLabel {
    pub fn new(l0: L0, l1: impl Into<String>, l2: impl Into<String>, l3: impl Into<String>) -> Self {
        Self {
            l0: l0.to_string(),
            l1: l1.into(),
            l2: l2.into(),
            l3: l3.into(),
        }
    }

    /// The default bucket for transactions nobody could classify.
    pub fn needs_review() -> Self {
        Self::new(L0::OperatingExpense, "Operating Expenses", NEEDS_REVIEW, "")
    }

    pub fn is_needs_review(&self) -> bool {
        self.l2 == NEEDS_REVIEW && self.l0 == L0::OperatingExpense.as_str()
    }

    /// True when `l0` is already a member of the six-set, spelled exactly.
    pub fn is_canonical(&self) -> bool {
        L0::ALL.iter().any(|l0| l0.as_str() == self.l0)
    }

    /// Returns a copy with `l0` normalized into the six-set.
    pub fn normalized(&self, amount: Decimal) -> Self {
        Self {
            l0: normalize_l0(&self.l0, amount).to_string(),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for CategoryLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.l0)?;
        for level in [&self.l1, &self.l2, &self.l3] {
            if !level.is_empty() {
                write!(f, " > {level}")?;
            }
        }
        Ok(())
    }
}
