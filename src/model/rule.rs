use crate::error::Res;
use crate::model::CategoryLabel;
use anyhow::ensure;
use serde::{Deserialize, Serialize};

/// The owner value used for rules in the shared global table.
pub const GLOBAL_OWNER: &str = "global";

/// Who a keyword rule belongs to.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RuleScope {
    Global,
    User(String),
}

/// Maps a keyword found in a transaction description onto a category.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KeywordRule {
    /// Normalized: uppercase, trimmed, inner whitespace collapsed.
    pub keyword: String,
    /// `global` or a user id.
    pub owner: String,
    #[serde(flatten)]
    pub label: CategoryLabel,
}

impl KeywordRule {
    pub fn new(keyword: &str, scope: RuleScope, label: CategoryLabel) -> Res<Self> {
        let keyword = normalize_text(keyword);
        ensure!(!keyword.is_empty(), "A keyword rule needs a non-empty keyword");
        let owner = match scope {
            RuleScope::Global => GLOBAL_OWNER.to_string(),
            RuleScope::User(user_id) => user_id,
        };
        Ok(Self {
            keyword,
            owner,
            label,
        })
    }

    pub fn scope(&self) -> RuleScope {
        if self.owner == GLOBAL_OWNER {
            RuleScope::Global
        } else {
            RuleScope::User(self.owner.clone())
        }
    }

    /// The store key for this rule.
    pub fn key(&self) -> Res<String> {
        rule_key(&self.keyword)
    }

    /// Case-insensitive containment of the keyword within `normalized_description`, which must
    /// already have been passed through `normalize_text`.
    pub fn matches(&self, normalized_description: &str) -> bool {
        !self.keyword.is_empty() && normalized_description.contains(&self.keyword)
    }
}

/// Uppercases, trims and collapses runs of whitespace.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derives the deterministic document key for a keyword: the normalized keyword with every run
/// of characters outside `[A-Z0-9]` replaced by a single underscore. The same keyword always
/// produces the same key, so seeding and publishing overwrite instead of duplicating.
pub fn rule_key(keyword: &str) -> Res<String> {
    let mut key = String::new();
    let mut pending_sep = false;
    for c in normalize_text(keyword).chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            key.push(c);
            pending_sep = false;
        } else {
            pending_sep = true;
        }
    }
    ensure!(
        !key.is_empty(),
        "The keyword '{keyword}' has no characters usable in a rule key"
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::L0;

    #[test]
    fn test_rule_key_is_deterministic() {
        assert_eq!(rule_key("Home Depot").unwrap(), "HOME_DEPOT");
        assert_eq!(rule_key("  home   depot ").unwrap(), "HOME_DEPOT");
        assert_eq!(rule_key("LOWE'S #12").unwrap(), "LOWE_S_12");
        assert_eq!(rule_key("a/b").unwrap(), "A_B");
    }

    #[test]
    fn test_rule_key_rejects_symbol_only() {
        assert!(rule_key("###").is_err());
        assert!(rule_key("").is_err());
    }

    #[test]
    fn test_rule_serializes_flat() {
        let rule = KeywordRule::new(
            "city water",
            RuleScope::User("u1".into()),
            CategoryLabel::new(L0::OperatingExpense, "Operating Expenses", "Utilities", "Water"),
        )
        .unwrap();
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["keyword"], "CITY WATER");
        assert_eq!(json["owner"], "u1");
        assert_eq!(json["l2"], "Utilities");
        assert_eq!(rule.scope(), RuleScope::User("u1".into()));
    }

    #[test]
    fn test_matches_normalized_description() {
        let rule = KeywordRule::new(
            "home depot",
            RuleScope::Global,
            CategoryLabel::needs_review(),
        )
        .unwrap();
        assert!(rule.matches(&normalize_text("The Home  Depot #1234")));
        assert!(!rule.matches(&normalize_text("HOMEDEPOT")));
    }
}
