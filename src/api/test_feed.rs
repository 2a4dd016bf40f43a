//! Implements the `TransactionFeed` trait using in-memory data.
//!
//! Note: this is compiled even in the "production" version of this app so that we can run the
//! whole app, top-to-bottom, without the aggregator.

use crate::api::{AccessGrant, FeedPage, FeedTransaction, TransactionFeed};
use crate::error::Res;
use anyhow::{anyhow, bail};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use url::Url;

type PageKey = (String, Option<String>);

#[derive(Debug, Default)]
struct State {
    pages: HashMap<PageKey, FeedPage>,
    fetched: Vec<PageKey>,
    webhooks: Vec<(String, Url)>,
}

/// Serves scripted pages keyed by `(account id, cursor)`. A fetch with no scripted page returns an
/// empty page that keeps the cursor where it is.
#[derive(Debug, Default)]
pub struct TestFeed {
    state: Mutex<State>,
    sample: bool,
    fail_fetches: AtomicUsize,
}

impl TestFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feed that answers the first sync of any account with a page of sample transactions.
    pub fn seeded() -> Self {
        Self {
            sample: true,
            ..Self::default()
        }
    }

    /// Scripts the page returned for `account_id` at `cursor`.
    pub fn add_page(&self, account_id: &str, cursor: Option<&str>, page: FeedPage) -> Res<()> {
        self.lock()?
            .pages
            .insert((account_id.to_string(), cursor.map(String::from)), page);
        Ok(())
    }

    /// Makes the next `n` calls to `sync_page` fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Every `(account id, cursor)` fetched so far, in order.
    pub fn fetched(&self) -> Res<Vec<(String, Option<String>)>> {
        Ok(self.lock()?.fetched.clone())
    }

    pub fn webhooks(&self) -> Res<Vec<(String, Url)>> {
        Ok(self.lock()?.webhooks.clone())
    }

    fn lock(&self) -> Res<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("The test feed lock was poisoned"))
    }
}

#[async_trait::async_trait]
impl TransactionFeed for TestFeed {
    async fn sync_page(
        &self,
        _access_token: &str,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Res<FeedPage> {
        let fail = self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            bail!("Injected feed failure");
        }
        let key = (account_id.to_string(), cursor.map(String::from));
        let mut state = self.lock()?;
        state.fetched.push(key.clone());
        if let Some(page) = state.pages.get(&key) {
            return Ok(page.clone());
        }
        if self.sample && cursor.is_none() {
            return sample_page(account_id);
        }
        Ok(FeedPage {
            next_cursor: cursor.unwrap_or_default().to_string(),
            ..FeedPage::default()
        })
    }

    async fn exchange_public_token(&self, public_token: &str) -> Res<AccessGrant> {
        if public_token.trim().is_empty() {
            bail!("The public token is empty");
        }
        Ok(AccessGrant {
            access_token: format!("access-{public_token}"),
            item_id: format!("item-{public_token}"),
        })
    }

    async fn register_webhook(&self, access_token: &str, webhook: &Url) -> Res<()> {
        self.lock()?
            .webhooks
            .push((access_token.to_string(), webhook.clone()));
        Ok(())
    }
}

const SAMPLE: &[(&str, &str, &str, Option<&str>)] = &[
    ("2025-01-02", "HOME DEPOT #1234", "-85.30", Some("HOME_IMPROVEMENT")),
    ("2025-01-03", "CITY WATER DISTRICT", "-45.88", Some("RENT_AND_UTILITIES")),
    ("2025-01-05", "ONLINE TRANSFER TO SAVINGS", "-500.00", Some("TRANSFER_OUT")),
    ("2025-01-06", "STARBUCKS STORE 0042", "-6.75", Some("FOOD_AND_DRINK")),
    ("2025-01-07", "MOBILE DEPOSIT", "1850.00", Some("INCOME")),
    ("2025-01-09", "XQZ HOLDINGS 77120", "-120.00", None),
];

fn sample_page(account_id: &str) -> Res<FeedPage> {
    let mut added = Vec::with_capacity(SAMPLE.len());
    for (i, (date, description, amount, raw)) in SAMPLE.iter().enumerate() {
        added.push(FeedTransaction {
            transaction_id: format!("{account_id}-sample-{i:03}"),
            account_id: account_id.to_string(),
            amount: Decimal::from_str(amount)?,
            description: description.to_string(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d")?,
            raw_category: raw.map(String::from),
        });
    }
    Ok(FeedPage {
        added,
        next_cursor: format!("{account_id}-sample-cursor"),
        ..FeedPage::default()
    })
}
