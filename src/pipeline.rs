//! The resolution pipeline: rules, then heuristics, then the generative model, stopping at the
//! first tier that produces an answer.

use crate::generative::DeepCategorizer;
use crate::heuristic;
use crate::model::{CategoryLabel, ResolutionSource, TransactionRecord, UserContext};
use crate::rules::{RuleSet, RuleStore};
use serde::Serialize;
use tracing::{trace, warn};

const UNRESOLVED: &str = "no tier produced a category";

/// The outcome of resolving one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub label: CategoryLabel,
    pub source: ResolutionSource,
    pub explanation: String,
}

impl Resolution {
    /// The `Needs Review` bucket, tagged `unresolved`.
    pub fn unresolved() -> Self {
        Self {
            label: CategoryLabel::needs_review(),
            source: ResolutionSource::Unresolved,
            explanation: UNRESOLVED.to_string(),
        }
    }

    /// Writes this resolution onto `record`.
    pub fn apply_to(self, record: &mut TransactionRecord) {
        record.category = self.label;
        record.source = self.source;
        record.explanation = self.explanation;
    }
}

#[derive(Clone)]
pub struct Resolver {
    rules: RuleStore,
    deep: DeepCategorizer,
}

impl Resolver {
    pub fn new(rules: RuleStore, deep: DeepCategorizer) -> Self {
        Self { rules, deep }
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Resolves one transaction, reading the owner's rules first. Never fails: if the rules cannot
    /// be read the transaction is `unresolved`.
    pub async fn resolve(&self, record: &TransactionRecord, context: &UserContext) -> Resolution {
        match self.rules.snapshot(&context.user_id).await {
            Ok(rules) => self.resolve_with(&rules, record, context).await,
            Err(e) => {
                warn!(
                    "Unable to read rules while resolving {}: {e:#}",
                    record.transaction_id
                );
                Resolution::unresolved()
            }
        }
    }

    /// Resolves one transaction against an already loaded rule snapshot.
    pub async fn resolve_with(
        &self,
        rules: &RuleSet,
        record: &TransactionRecord,
        context: &UserContext,
    ) -> Resolution {
        if let Some(found) = rules.lookup(&record.description) {
            trace!("{} matched rule '{}'", record.transaction_id, found.rule.keyword);
            let explanation = format!("matched {} keyword '{}'", found.source, found.rule.keyword);
            return Resolution {
                label: found.rule.label.normalized(record.amount),
                source: found.source,
                explanation,
            };
        }

        let scored = heuristic::score(
            &record.description,
            record.amount,
            record.raw_category.as_deref(),
            context,
        );
        if !scored.is_default() {
            return Resolution {
                label: scored.label,
                source: ResolutionSource::Heuristic,
                explanation: format!("{} (confidence {:.2})", scored.reason, scored.confidence),
            };
        }

        if let Some(answer) = self
            .deep
            .categorize(&record.description, record.amount, record.date)
            .await
        {
            return Resolution {
                label: answer.label,
                source: ResolutionSource::AiDeep,
                explanation: format!("{} (confidence {:.2})", answer.explanation, answer.confidence),
            };
        }

        Resolution::unresolved()
    }
}
