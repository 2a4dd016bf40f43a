//! Incremental ingestion from the aggregator feed.
//!
//! Each (user, account) pair moves through fetch, resolve and commit one page at a time. The
//! stored cursor only moves after every write for its page has been committed, and the cursor
//! write is always the last commit of the page. A failed commit therefore leaves the cursor where
//! it was, and the next run fetches the same page again, which is harmless because every record
//! is an upsert keyed by the provider's transaction id.

use crate::api::{FeedTransaction, TransactionFeed};
use crate::error::{Error, ErrorType, IntoResult, Res, Result};
use crate::model::{Account, Contact, OwnerOutcome, OwnerReport, TransactionRecord, UserContext};
use crate::pipeline::Resolver;
use crate::rules::RuleSet;
use crate::store::{decode, encode, paths, scan_all, DocumentStore, WriteBatch};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const SCAN_PAGE: usize = 400;

/// What to do with transactions the aggregator reports as removed.
#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RemovedPolicy {
    /// Keep the record and set `removed`.
    #[default]
    Flag,
    /// Delete the record.
    Delete,
}

serde_plain::derive_display_from_serialize!(RemovedPolicy);
serde_plain::derive_fromstr_from_deserialize!(RemovedPolicy);

/// Counts for one sync run.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncReport {
    pub pages: u64,
    pub added: u64,
    pub modified: u64,
    pub removed: u64,
    /// Records whose category came from a rule, heuristic or the model.
    pub resolved: u64,
    /// Records that fell through every tier.
    pub unresolved: u64,
    /// Records that kept a category decided earlier.
    pub kept: u64,
    /// Repeated ids within a page.
    pub duplicates: u64,
}

impl AddAssign for SyncReport {
    fn add_assign(&mut self, rhs: Self) {
        self.pages += rhs.pages;
        self.added += rhs.added;
        self.modified += rhs.modified;
        self.removed += rhs.removed;
        self.resolved += rhs.resolved;
        self.unresolved += rhs.unresolved;
        self.kept += rhs.kept;
        self.duplicates += rhs.duplicates;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SyncOptions {
    /// The most record writes committed together.
    pub batch_size: usize,
    pub removed: RemovedPolicy,
    /// How many owners `sync_all` works on at once.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 400,
            removed: RemovedPolicy::Flag,
            concurrency: 4,
        }
    }
}

type PairKey = (String, String);

/// Holds a (user, account) pair for the duration of one run. The set of held pairs lives in the
/// `SyncEngine`, so it only excludes runs sharing that engine within one process.
struct InFlight {
    key: PairKey,
    held: Arc<Mutex<HashSet<PairKey>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    feed: Arc<dyn TransactionFeed>,
    resolver: Resolver,
    options: SyncOptions,
    in_flight: Arc<Mutex<HashSet<PairKey>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        feed: Arc<dyn TransactionFeed>,
        resolver: Resolver,
        options: SyncOptions,
    ) -> Self {
        let options = SyncOptions {
            batch_size: options.batch_size.clamp(1, store.max_batch_ops()),
            concurrency: options.concurrency.max(1),
            ..options
        };
        Self {
            store,
            feed,
            resolver,
            options,
            in_flight: Arc::default(),
        }
    }

    /// Syncs one account until the feed reports no more pages.
    ///
    /// A second run for the same pair on this engine fails with `Conflict`. Nothing stops two
    /// separate processes from syncing the same pair at once; they may then race on the cursor,
    /// so schedule at most one `ledger sync` per ledger home.
    pub async fn sync_account(&self, user_id: &str, account_id: &str) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let (rules, context) = self.prepare(user_id).await?;
        self.run_account(user_id, account_id, &rules, &context, &mut report)
            .await?;
        Ok(report)
    }

    /// Syncs every account of one user, one after the other, stopping at the first failure. The
    /// outcome carries the counts reached so far.
    pub async fn sync_user(&self, user_id: &str) -> OwnerOutcome<SyncReport> {
        let mut report = SyncReport::default();
        let result = self.run_user(user_id, &mut report).await;
        if let Err(e) = &result {
            error!("Sync for {user_id} stopped: {e}");
        }
        OwnerOutcome {
            stats: report,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Syncs every user, several at a time. A failing user does not stop the others.
    pub async fn sync_all(&self) -> Result<OwnerReport<SyncReport>> {
        let users = list_users(self.store.as_ref())
            .await
            .pub_result(ErrorType::Store)?;
        info!("Syncing {} users", users.len());
        let permits = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks = JoinSet::new();
        for user_id in users {
            let engine = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => engine.sync_user(&user_id).await,
                    Err(e) => OwnerOutcome {
                        stats: SyncReport::default(),
                        error: Some(e.to_string()),
                    },
                };
                (user_id, outcome)
            });
        }
        let mut report = OwnerReport::new();
        while let Some(joined) = tasks.join_next().await {
            let (user_id, outcome) = joined
                .context("A sync task panicked")
                .pub_result(ErrorType::Internal)?;
            report.insert(user_id, outcome);
        }
        Ok(report)
    }

    async fn run_user(&self, user_id: &str, report: &mut SyncReport) -> Result<()> {
        let accounts = scan_all(self.store.as_ref(), &paths::accounts(user_id), None, SCAN_PAGE)
            .await
            .with_context(|| format!("Unable to list the accounts of {user_id}"))
            .pub_result(ErrorType::Store)?;
        let (rules, context) = self.prepare(user_id).await?;
        for account in accounts {
            self.run_account(user_id, &account.id, &rules, &context, report)
                .await?;
        }
        Ok(())
    }

    /// Loads the rule snapshot and contacts used for every record of this run.
    async fn prepare(&self, user_id: &str) -> Result<(RuleSet, UserContext)> {
        let rules = self
            .resolver
            .rules()
            .snapshot(user_id)
            .await
            .pub_result(ErrorType::Store)?;
        let context = load_context(self.store.as_ref(), user_id)
            .await
            .pub_result(ErrorType::Store)?;
        Ok((rules, context))
    }

    fn hold(&self, user_id: &str, account_id: &str) -> Result<InFlight> {
        let key = (user_id.to_string(), account_id.to_string());
        let mut held = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("The in-flight set lock was poisoned"))
            .pub_result(ErrorType::Internal)?;
        if !held.insert(key.clone()) {
            return Err(Error::new(
                ErrorType::Conflict,
                anyhow!("A sync of account {account_id} for {user_id} is already running"),
            ));
        }
        Ok(InFlight {
            key,
            held: self.in_flight.clone(),
        })
    }

    async fn run_account(
        &self,
        user_id: &str,
        account_id: &str,
        rules: &RuleSet,
        context: &UserContext,
        report: &mut SyncReport,
    ) -> Result<()> {
        let _held = self.hold(user_id, account_id)?;
        let account = load_account(self.store.as_ref(), user_id, account_id).await?;
        let mut cursor = account.cursor.clone();

        loop {
            debug!(
                "Fetching {user_id}/{account_id} after cursor {}",
                cursor.as_deref().unwrap_or("<start>")
            );
            let page = self
                .feed
                .sync_page(&account.access_token, account_id, cursor.as_deref())
                .await
                .with_context(|| format!("Unable to fetch transactions for {user_id}/{account_id}"))
                .pub_result(ErrorType::Feed)?;

            let (batch, counts) = self
                .stage_page(user_id, account_id, &page.added, &page.modified, &page.removed, rules, context)
                .await?;

            for chunk in batch.into_chunks(self.options.batch_size) {
                if let Err(e) = self.store.commit(chunk).await {
                    error!(
                        "Commit failed for {user_id}/{account_id}, cursor stays at {} (page would \
                        have advanced it to {}): {e:#}",
                        cursor.as_deref().unwrap_or("<start>"),
                        page.next_cursor
                    );
                    return Err(e)
                        .context("Unable to commit synced transactions")
                        .pub_result(ErrorType::Store);
                }
            }

            let mut advance = WriteBatch::new();
            advance.merge(
                paths::accounts(user_id),
                account_id,
                encode(&serde_json::json!({ "cursor": page.next_cursor }))
                    .pub_result(ErrorType::Internal)?,
            );
            self.store
                .commit(advance)
                .await
                .with_context(|| {
                    format!("Unable to store the cursor for {user_id}/{account_id}")
                })
                .pub_result(ErrorType::Store)?;

            *report += counts;
            info!(
                "Synced {user_id}/{account_id}: {} added, {} modified, {} removed; cursor now {}",
                counts.added, counts.modified, counts.removed, page.next_cursor
            );

            let stalled = cursor.as_deref() == Some(page.next_cursor.as_str());
            cursor = Some(page.next_cursor);
            if !page.has_more {
                break;
            }
            if stalled {
                return Err(Error::new(
                    ErrorType::Feed,
                    anyhow!("The feed reported more pages for {user_id}/{account_id} without moving the cursor"),
                ));
            }
        }
        Ok(())
    }

    /// Builds the writes for one page. Only store reads can fail here; resolution never does.
    #[allow(clippy::too_many_arguments)]
    async fn stage_page(
        &self,
        user_id: &str,
        account_id: &str,
        added: &[FeedTransaction],
        modified: &[FeedTransaction],
        removed: &[String],
        rules: &RuleSet,
        context: &UserContext,
    ) -> Result<(WriteBatch, SyncReport)> {
        let collection = paths::transactions(user_id);
        let mut counts = SyncReport {
            pages: 1,
            ..SyncReport::default()
        };
        let removed: HashSet<&str> = removed.iter().map(String::as_str).collect();

        // Last delivery of an id wins; first-seen order is kept.
        let mut order: Vec<&FeedTransaction> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (tx, is_new) in added
            .iter()
            .map(|t| (t, true))
            .chain(modified.iter().map(|t| (t, false)))
        {
            match index.get(tx.transaction_id.as_str()) {
                Some(&i) => {
                    counts.duplicates += 1;
                    order[i] = tx;
                }
                None => {
                    index.insert(&tx.transaction_id, order.len());
                    order.push(tx);
                    if is_new {
                        counts.added += 1;
                    } else {
                        counts.modified += 1;
                    }
                }
            }
        }

        let mut batch = WriteBatch::new();
        for tx in order {
            if removed.contains(tx.transaction_id.as_str()) {
                continue;
            }
            if tx.account_id != account_id {
                warn!(
                    "Transaction {} belongs to account {}, not {account_id}",
                    tx.transaction_id, tx.account_id
                );
            }
            let existing = self
                .existing(&collection, &tx.transaction_id)
                .await
                .pub_result(ErrorType::Store)?;
            let mut record = TransactionRecord {
                transaction_id: tx.transaction_id.clone(),
                user_id: user_id.to_string(),
                account_id: account_id.to_string(),
                amount: tx.amount,
                description: tx.description.clone(),
                date: tx.date,
                category: Default::default(),
                source: Default::default(),
                explanation: String::new(),
                raw_category: tx.raw_category.clone(),
                manual: false,
                removed: false,
            };
            match existing {
                Some(prior) if keeps_category(&prior, tx) => {
                    record.category = prior.category;
                    record.source = prior.source;
                    record.explanation = prior.explanation;
                    record.manual = prior.manual;
                    counts.kept += 1;
                }
                _ => {
                    let resolution = self.resolver.resolve_with(rules, &record, context).await;
                    if resolution.source == crate::model::ResolutionSource::Unresolved {
                        counts.unresolved += 1;
                    } else {
                        counts.resolved += 1;
                    }
                    resolution.apply_to(&mut record);
                }
            }
            batch.set(
                collection.as_str(),
                record.transaction_id.as_str(),
                encode(&record).pub_result(ErrorType::Internal)?,
            );
        }

        for id in removed {
            let exists = self
                .store
                .get(&collection, id)
                .await
                .pub_result(ErrorType::Store)?
                .is_some();
            if !exists {
                debug!("Removed transaction {id} was never stored");
                continue;
            }
            match self.options.removed {
                RemovedPolicy::Delete => batch.delete(collection.as_str(), id),
                RemovedPolicy::Flag => batch.merge(
                    collection.as_str(),
                    id,
                    encode(&serde_json::json!({ "removed": true }))
                        .pub_result(ErrorType::Internal)?,
                ),
            }
            counts.removed += 1;
        }
        Ok((batch, counts))
    }

    async fn existing(&self, collection: &str, id: &str) -> Res<Option<TransactionRecord>> {
        let Some(doc) = self.store.get(collection, id).await? else {
            return Ok(None);
        };
        match decode::<TransactionRecord>(doc) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Stored transaction {collection}/{id} is malformed and will be rewritten: {e:#}");
                Ok(None)
            }
        }
    }
}

/// A category decided by a person, or one decided earlier for the same description, survives a
/// re-sync.
fn keeps_category(prior: &TransactionRecord, incoming: &FeedTransaction) -> bool {
    prior.manual || (prior.has_settled_category() && prior.description == incoming.description)
}

async fn load_account(store: &dyn DocumentStore, user_id: &str, account_id: &str) -> Result<Account> {
    let doc = store
        .get(&paths::accounts(user_id), account_id)
        .await
        .pub_result(ErrorType::Store)?
        .ok_or_else(|| anyhow!("Account {account_id} is not linked for {user_id}"))
        .pub_result(ErrorType::Validation)?;
    decode(doc)
        .with_context(|| format!("Account {user_id}/{account_id} is malformed"))
        .pub_result(ErrorType::Validation)
}

/// Reads the contacts of `user_id`. Malformed contacts are skipped.
pub(crate) async fn load_context(store: &dyn DocumentStore, user_id: &str) -> Res<UserContext> {
    let rows = scan_all(store, &paths::contacts(user_id), None, SCAN_PAGE).await?;
    let mut contacts = Vec::with_capacity(rows.len());
    for row in rows {
        match decode::<Contact>(row.doc) {
            Ok(contact) => contacts.push(contact),
            Err(e) => warn!("Ignoring malformed contact {user_id}/{}: {e:#}", row.id),
        }
    }
    Ok(UserContext::new(user_id, contacts))
}

/// The ids of every user with a document in the `users` collection.
pub(crate) async fn list_users(store: &dyn DocumentStore) -> Res<Vec<String>> {
    Ok(scan_all(store, paths::USERS, None, SCAN_PAGE)
        .await
        .context("Unable to list users")?
        .into_iter()
        .map(|row| row.id)
        .collect())
}
