//! Shared test utilities for creating test environments.
//!
//! This module is only compiled when running tests (`#[cfg(test)]`).

use crate::api::{FeedTransaction, Mode, ModelClient, ModelInput, OutputSchema, SilentModel, TestFeed};
use crate::auth::Authorizer;
use crate::config::InitOptions;
use crate::error::Res;
use crate::generative::DeepCategorizer;
use crate::model::{Account, Contact, ContactKind, TransactionRecord};
use crate::pipeline::Resolver;
use crate::rules::{seed_rules, RuleStore};
use crate::store::{decode, encode, paths, DocumentStore, MemoryStore, SetMode};
use crate::sync::{SyncEngine, SyncOptions};
use crate::Config;
use anyhow::anyhow;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use url::Url;
use uuid::Uuid;

/// A model that replays canned answers in order and fails once they run out.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    answers: Mutex<VecDeque<Res<Value>>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(answers: Vec<Res<Value>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ModelClient for ScriptedModel {
    async fn generate(&self, _input: &ModelInput, _schema: &OutputSchema) -> Res<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no scripted answer left")))
    }
}

/// A stored transaction for user `u1` on account `a1` with no category decided yet.
pub fn record(id: &str, description: &str, amount: &str, date: &str) -> TransactionRecord {
    TransactionRecord {
        transaction_id: id.to_string(),
        user_id: "u1".to_string(),
        account_id: "a1".to_string(),
        amount: Decimal::from_str(amount).unwrap(),
        description: description.to_string(),
        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        category: Default::default(),
        source: Default::default(),
        explanation: String::new(),
        raw_category: None,
        manual: false,
        removed: false,
    }
}

/// A transaction as the aggregator would deliver it.
pub fn feed_tx(id: &str, account_id: &str, description: &str, amount: &str) -> FeedTransaction {
    FeedTransaction {
        transaction_id: id.to_string(),
        account_id: account_id.to_string(),
        amount: Decimal::from_str(amount).unwrap(),
        description: description.to_string(),
        date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        raw_category: None,
    }
}

/// An in-memory store and feed, with the global rule table already seeded.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub feed: Arc<TestFeed>,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        RuleStore::new(store.clone(), 100)
            .seed_global(&Authorizer::grant("test-admin"), &seed_rules().unwrap())
            .await
            .unwrap();
        Self {
            store,
            feed: Arc::new(TestFeed::new()),
        }
    }

    /// A resolver whose model never answers.
    pub fn resolver(&self) -> Resolver {
        Resolver::new(
            RuleStore::new(self.store.clone(), 100),
            DeepCategorizer::new(Arc::new(SilentModel)),
        )
    }

    pub fn engine(&self, options: SyncOptions) -> SyncEngine {
        SyncEngine::new(self.store.clone(), self.feed.clone(), self.resolver(), options)
    }

    /// Creates the user document and a linked account with no cursor.
    pub async fn link(&self, user_id: &str, account_id: &str) {
        self.store
            .set(
                paths::USERS,
                user_id,
                encode(&serde_json::json!({ "user_id": user_id })).unwrap(),
                SetMode::Merge,
            )
            .await
            .unwrap();
        let account = Account {
            account_id: account_id.to_string(),
            user_id: user_id.to_string(),
            item_id: format!("item-{account_id}"),
            access_token: format!("access-{account_id}"),
            cursor: None,
        };
        self.store
            .set(
                &paths::accounts(user_id),
                account_id,
                encode(&account).unwrap(),
                SetMode::Replace,
            )
            .await
            .unwrap();
    }

    pub async fn cursor(&self, user_id: &str, account_id: &str) -> Option<String> {
        let doc = self
            .store
            .get(&paths::accounts(user_id), account_id)
            .await
            .unwrap()
            .unwrap();
        decode::<Account>(doc).unwrap().cursor
    }

    pub async fn add_contact(&self, user_id: &str, name: &str, kind: ContactKind) {
        let contact = Contact {
            name: name.to_string(),
            kind,
            default_category: None,
        };
        self.store
            .set(
                &paths::contacts(user_id),
                &Uuid::new_v4().to_string(),
                encode(&contact).unwrap(),
                SetMode::Replace,
            )
            .await
            .unwrap();
    }
}

/// Test environment that sets up a ledger home directory with a Config and SQLite store, loaded
/// in test mode. Holds the TempDir to keep the directory alive for the duration of the test.
pub struct TestEnv {
    _temp_dir: TempDir,
    config: Config,
}

impl TestEnv {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("ledger");
        let options = InitOptions {
            aggregator_url: Url::parse("https://aggregator.test/").unwrap(),
            model_url: Url::parse("https://model.test/v1/generate").unwrap(),
            webhook_url: Some(Url::parse("https://hooks.test/ledger").unwrap()),
            admins: vec!["ops-1".to_string()],
            aggregator_secret: None,
            model_secret: None,
        };
        Config::create(&root, options).await.unwrap();
        let config = Config::load(&root, Mode::Test).await.unwrap();
        Self {
            _temp_dir: temp_dir,
            config,
        }
    }

    /// Returns a clone of the Config.
    pub fn config(&self) -> Config {
        self.config.clone()
    }
}
