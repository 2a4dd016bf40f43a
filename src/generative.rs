//! The generative fallback tier: one model call per transaction, with the answer validated
//! against the `DeepCategorization` schema before anything downstream sees it.

use crate::api::{ModelClient, ModelInput, OutputSchema};
use crate::model::{normalize_l0, CategoryLabel};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const SCHEMA_NAME: &str = "deep_categorization";

/// The structured answer the model must return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeepCategorization {
    /// The cleaned-up merchant or counterparty name.
    pub merchant_name: String,
    /// The broad accounting class, if the model chose one. Normalized before use.
    #[serde(default)]
    pub l0: Option<String>,
    pub l1: String,
    #[serde(default)]
    pub l2: String,
    #[serde(default)]
    pub l3: String,
    /// From 0 to 1.
    pub confidence: f64,
    /// A short free-text justification.
    #[serde(default)]
    pub reasoning: String,
}

/// A validated answer from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct DeepAnswer {
    pub label: CategoryLabel,
    pub confidence: f64,
    pub explanation: String,
}

/// Wraps the model client for single-transaction categorization.
#[derive(Clone)]
pub struct DeepCategorizer {
    client: Arc<dyn ModelClient>,
    schema: OutputSchema,
}

impl DeepCategorizer {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            schema: output_schema(),
        }
    }

    /// Asks the model once. Failures and answers that do not validate both come back as `None`;
    /// retrying is left to whoever re-runs the job.
    pub async fn categorize(
        &self,
        description: &str,
        amount: Decimal,
        date: NaiveDate,
    ) -> Option<DeepAnswer> {
        let input = ModelInput {
            description: description.to_string(),
            amount,
            date,
        };
        let value = match self.client.generate(&input, &self.schema).await {
            Ok(value) => value,
            Err(e) => {
                warn!("The model failed on '{description}': {e:#}");
                return None;
            }
        };
        let answer = match serde_json::from_value::<DeepCategorization>(value) {
            Ok(answer) => answer,
            Err(e) => {
                debug!("Discarding malformed model output for '{description}': {e}");
                return None;
            }
        };
        validate(answer, amount)
    }
}

fn validate(answer: DeepCategorization, amount: Decimal) -> Option<DeepAnswer> {
    if answer.l1.trim().is_empty() {
        debug!("Discarding model output with an empty l1");
        return None;
    }
    if !(0.0..=1.0).contains(&answer.confidence) {
        debug!(
            "Discarding model output with confidence {}",
            answer.confidence
        );
        return None;
    }
    let l0 = normalize_l0(answer.l0.as_deref().unwrap_or_default(), amount);
    let explanation = if answer.reasoning.trim().is_empty() {
        format!("model identified merchant '{}'", answer.merchant_name)
    } else {
        format!("{} ({})", answer.reasoning.trim(), answer.merchant_name)
    };
    Some(DeepAnswer {
        label: CategoryLabel::new(
            l0,
            answer.l1.trim(),
            answer.l2.trim(),
            answer.l3.trim(),
        ),
        confidence: answer.confidence,
        explanation,
    })
}

fn output_schema() -> OutputSchema {
    OutputSchema {
        name: SCHEMA_NAME.to_string(),
        json_schema: schemars::schema_for!(DeepCategorization).to_value(),
    }
}
