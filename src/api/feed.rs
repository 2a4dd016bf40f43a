//! Implements the `TransactionFeed` trait over the aggregator's HTTP API.

use crate::api::{check_status, endpoint, AccessGrant, FeedPage, FeedTransaction, TransactionFeed};
use crate::config::AggregatorSecret;
use crate::error::Res;
use anyhow::Context;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;
use url::Url;

/// The largest page the aggregator will return.
const PAGE_COUNT: u32 = 500;
const TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpFeed {
    base: Url,
    secret: AggregatorSecret,
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(base: Url, secret: AggregatorSecret) -> Res<Self> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .build()
            .context("Unable to create the HTTP client")?;
        Ok(Self {
            base,
            secret,
            client,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Res<Resp>
    where
        Req: Serialize + Sync,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = endpoint(&self.base, path)?;
        trace!("POST {url}");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {path}"))?;
        check_status(response, path)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse the response from {path}"))
    }
}

#[derive(Serialize)]
struct SyncRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    count: u32,
    options: SyncOptions<'a>,
}

#[derive(Serialize)]
struct SyncOptions<'a> {
    account_id: &'a str,
}

#[derive(Deserialize)]
struct SyncResponse {
    #[serde(default)]
    added: Vec<WireTransaction>,
    #[serde(default)]
    modified: Vec<WireTransaction>,
    #[serde(default)]
    removed: Vec<WireRemoved>,
    next_cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Deserialize)]
struct WireTransaction {
    transaction_id: String,
    account_id: String,
    /// Positive for money leaving the account.
    amount: Decimal,
    date: NaiveDate,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    merchant_name: Option<String>,
    #[serde(default)]
    personal_finance_category: Option<WireCategory>,
}

#[derive(Deserialize)]
struct WireCategory {
    primary: String,
}

#[derive(Deserialize)]
struct WireRemoved {
    transaction_id: String,
}

impl From<WireTransaction> for FeedTransaction {
    fn from(w: WireTransaction) -> Self {
        Self {
            transaction_id: w.transaction_id,
            account_id: w.account_id,
            amount: -w.amount,
            description: w.name.or(w.merchant_name).unwrap_or_default(),
            date: w.date,
            raw_category: w.personal_finance_category.map(|c| c.primary),
        }
    }
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    public_token: &'a str,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
    item_id: String,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    webhook: &'a str,
}

#[derive(Deserialize)]
struct WebhookResponse {}

#[async_trait::async_trait]
impl TransactionFeed for HttpFeed {
    async fn sync_page(
        &self,
        access_token: &str,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Res<FeedPage> {
        let request = SyncRequest {
            client_id: &self.secret.client_id,
            secret: &self.secret.secret,
            access_token,
            cursor,
            count: PAGE_COUNT,
            options: SyncOptions { account_id },
        };
        let response: SyncResponse = self.post("transactions/sync", &request).await?;
        Ok(FeedPage {
            added: response.added.into_iter().map(Into::into).collect(),
            modified: response.modified.into_iter().map(Into::into).collect(),
            removed: response
                .removed
                .into_iter()
                .map(|r| r.transaction_id)
                .collect(),
            next_cursor: response.next_cursor,
            has_more: response.has_more,
        })
    }

    async fn exchange_public_token(&self, public_token: &str) -> Res<AccessGrant> {
        let request = ExchangeRequest {
            client_id: &self.secret.client_id,
            secret: &self.secret.secret,
            public_token,
        };
        let response: ExchangeResponse = self
            .post("item/public_token/exchange", &request)
            .await?;
        Ok(AccessGrant {
            access_token: response.access_token,
            item_id: response.item_id,
        })
    }

    async fn register_webhook(&self, access_token: &str, webhook: &Url) -> Res<()> {
        let request = WebhookRequest {
            client_id: &self.secret.client_id,
            secret: &self.secret.secret,
            access_token,
            webhook: webhook.as_str(),
        };
        let _: WebhookResponse = self.post("item/webhook/update", &request).await?;
        Ok(())
    }
}
