//! Clients for the external collaborators: the bank-data aggregator feed and the generative model.
//!
//! Each collaborator is a trait with a live HTTP implementation and an in-memory implementation.
//! `Mode` decides which one the binary uses.

mod feed;
mod model;
mod test_feed;

pub use feed::HttpFeed;
pub use model::{HttpModelClient, SilentModel};
pub use test_feed::TestFeed;

use crate::error::{ErrorType, IntoResult, Res};
use crate::{Config, Result};
use anyhow::Context;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

const TEST_MODE_VAR: &str = "LEDGER_IN_TEST_MODE";

/// Whether the process talks to the real services or to in-memory stand-ins.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Live,
    Test,
}

serde_plain::derive_display_from_serialize!(Mode);
serde_plain::derive_fromstr_from_deserialize!(Mode);

impl Mode {
    /// `Mode::Test` when `LEDGER_IN_TEST_MODE` is set and non-empty, otherwise `Mode::Live`.
    pub fn from_env() -> Self {
        match std::env::var(TEST_MODE_VAR) {
            Ok(v) if !v.is_empty() => Mode::Test,
            _ => Mode::Live,
        }
    }
}

/// A transaction as delivered by the aggregator, already converted to the ledger's sign
/// convention (positive is inbound).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FeedTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub description: String,
    pub date: NaiveDate,
    pub raw_category: Option<String>,
}

/// One page of the aggregator's change feed.
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FeedPage {
    pub added: Vec<FeedTransaction>,
    pub modified: Vec<FeedTransaction>,
    /// Provider ids of transactions that no longer exist.
    pub removed: Vec<String>,
    pub next_cursor: String,
    pub has_more: bool,
}

/// The long-lived credentials for one linked item.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub access_token: String,
    pub item_id: String,
}

/// The bank-data aggregator.
#[async_trait::async_trait]
pub trait TransactionFeed: Send + Sync {
    /// Fetches the changes for `account_id` after `cursor`. `None` starts from the beginning.
    async fn sync_page(
        &self,
        access_token: &str,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Res<FeedPage>;

    /// Exchanges a short-lived public token from the link flow for a long-lived access token.
    async fn exchange_public_token(&self, public_token: &str) -> Res<AccessGrant>;

    async fn register_webhook(&self, access_token: &str, webhook: &Url) -> Res<()>;
}

/// What the generative model is told about a transaction.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelInput {
    pub description: String,
    pub amount: Decimal,
    pub date: NaiveDate,
}

/// A named JSON schema the model's output must conform to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub json_schema: Value,
}

/// The generative model: structured input in, structured JSON out. Implementations make one
/// attempt per call.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, input: &ModelInput, schema: &OutputSchema) -> Res<Value>;
}

/// Creates the aggregator feed for `mode`.
pub fn feed(config: &Config, mode: Mode) -> Result<Arc<dyn TransactionFeed>> {
    match mode {
        Mode::Test => Ok(Arc::new(TestFeed::seeded())),
        Mode::Live => {
            let secret = config
                .aggregator_secret()
                .context("The aggregator credentials were not loaded")
                .pub_result(ErrorType::Config)?;
            let feed = HttpFeed::new(config.aggregator_url().clone(), secret.clone())
                .pub_result(ErrorType::Config)?;
            Ok(Arc::new(feed))
        }
    }
}

/// Creates the generative model client for `mode`.
pub fn model(config: &Config, mode: Mode) -> Result<Arc<dyn ModelClient>> {
    match mode {
        Mode::Test => Ok(Arc::new(SilentModel)),
        Mode::Live => {
            let secret = config
                .model_secret()
                .context("The model credentials were not loaded")
                .pub_result(ErrorType::Config)?;
            let client = HttpModelClient::new(config.model_url().clone(), secret.clone())
                .pub_result(ErrorType::Config)?;
            Ok(Arc::new(client))
        }
    }
}

/// Joins `path` onto `base`, treating `base` as a directory even without a trailing slash.
pub(crate) fn endpoint(base: &Url, path: &str) -> Res<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .with_context(|| format!("Unable to build the endpoint URL for '{path}'"))
}

/// Turns an unsuccessful response into an error that carries the status and body.
pub(crate) async fn check_status(response: reqwest::Response, what: &str) -> Res<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read response body".to_string());
    anyhow::bail!("{what} failed with status {status}: {body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        let base = Url::parse("https://sandbox.example.com/v2").unwrap();
        assert_eq!(
            endpoint(&base, "/transactions/sync").unwrap().as_str(),
            "https://sandbox.example.com/v2/transactions/sync"
        );
        let base = Url::parse("https://sandbox.example.com/").unwrap();
        assert_eq!(
            endpoint(&base, "item/webhook/update").unwrap().as_str(),
            "https://sandbox.example.com/item/webhook/update"
        );
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(Mode::Test.to_string(), "test");
        assert_eq!("live".parse::<Mode>().unwrap(), Mode::Live);
    }
}
