//! Idempotent bulk repair over stored transactions.
//!
//! A `MigrationRunner` pages through one owner's transactions in `date` order, hands each record
//! to a `RecordTransform`, and writes back only the records that actually changed. Running the
//! same transform twice over the same data updates nothing the second time. A record that fails
//! to decode or to transform is counted and skipped; it never stops the run.

use crate::error::{Error, ErrorType, IntoResult, Res, Result};
use crate::model::{CategoryLabel, OwnerOutcome, OwnerReport, RunStats, TransactionRecord, UserContext};
use crate::pipeline::Resolver;
use crate::rules::RuleSet;
use crate::store::{decode, encode, paths, DocumentStore, Query, WriteBatch};
use crate::sync::{list_users, load_context};
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ORDER_FIELD: &str = "date";

/// One step of a repair job, applied to each record in turn.
#[async_trait::async_trait]
pub trait RecordTransform: Send + Sync {
    /// Used in logs.
    fn name(&self) -> &str;

    /// Records outside the filter are counted as skipped without calling `transform`.
    fn applies_to(&self, _record: &TransactionRecord) -> bool {
        true
    }

    /// Returns the record as it should be stored. Returning it unchanged means there is nothing
    /// to write.
    async fn transform(&self, record: &TransactionRecord) -> Res<TransactionRecord>;
}

/// Rewrites legacy `l0` values into the six canonical classes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizeL0;

#[async_trait::async_trait]
impl RecordTransform for NormalizeL0 {
    fn name(&self) -> &str {
        "normalize-l0"
    }

    fn applies_to(&self, record: &TransactionRecord) -> bool {
        !record.category.is_canonical()
    }

    async fn transform(&self, record: &TransactionRecord) -> Res<TransactionRecord> {
        Ok(TransactionRecord {
            category: record.category.normalized(record.amount),
            ..record.clone()
        })
    }
}

/// Sends records that never got a real category back through the resolution pipeline.
pub struct ReResolve {
    resolver: Resolver,
    rules: RuleSet,
    context: UserContext,
}

impl ReResolve {
    /// Loads the rule snapshot and contacts of `user_id` once for the whole run.
    pub async fn for_user(
        resolver: Resolver,
        store: &dyn DocumentStore,
        user_id: &str,
    ) -> Result<Self> {
        let rules = resolver
            .rules()
            .snapshot(user_id)
            .await
            .pub_result(ErrorType::Store)?;
        let context = load_context(store, user_id)
            .await
            .pub_result(ErrorType::Store)?;
        Ok(Self {
            resolver,
            rules,
            context,
        })
    }
}

#[async_trait::async_trait]
impl RecordTransform for ReResolve {
    fn name(&self) -> &str {
        "repair"
    }

    fn applies_to(&self, record: &TransactionRecord) -> bool {
        !record.manual && !record.removed && (!record.has_settled_category() || record.category.is_needs_review())
    }

    async fn transform(&self, record: &TransactionRecord) -> Res<TransactionRecord> {
        let mut updated = record.clone();
        self.resolver
            .resolve_with(&self.rules, record, &self.context)
            .await
            .apply_to(&mut updated);
        Ok(updated)
    }
}

/// One entry of a relabel mapping file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Relabel {
    pub from: CategoryLabel,
    pub to: CategoryLabel,
}

/// Moves records from old labels onto new ones. Manual records are relabelled too, since the
/// mapping describes a change to the taxonomy itself.
#[derive(Debug, Clone)]
pub struct RelabelMap {
    map: HashMap<CategoryLabel, CategoryLabel>,
}

impl RelabelMap {
    /// Targets must be canonical labels with a non-empty `l1`, and no target may also be a
    /// source. The second rule keeps a single pass final: running it again changes nothing.
    pub fn new(entries: Vec<Relabel>) -> Result<Self> {
        Self::build(entries).pub_result(ErrorType::Validation)
    }

    /// Reads a JSON array of `{"from": {..}, "to": {..}}` entries.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let entries: Vec<Relabel> = crate::utils::deserialize(path)
            .await
            .pub_result(ErrorType::Validation)?;
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn build(entries: Vec<Relabel>) -> Res<Self> {
        let mut map = HashMap::with_capacity(entries.len());
        for Relabel { from, to } in entries {
            anyhow::ensure!(
                to.is_canonical(),
                "Relabel target '{to}' does not have a canonical l0"
            );
            anyhow::ensure!(!to.l1.trim().is_empty(), "Relabel target '{to}' has an empty l1");
            if from == to {
                continue;
            }
            if let Some(previous) = map.insert(from.clone(), to.clone()) {
                anyhow::ensure!(
                    previous == to,
                    "'{from}' is mapped to both '{previous}' and '{to}'"
                );
            }
        }
        if let Some(to) = map.values().find(|to| map.contains_key(*to)) {
            return Err(anyhow!(
                "'{to}' is both a relabel target and a source; chained mappings are not allowed"
            ));
        }
        Ok(Self { map })
    }
}

#[async_trait::async_trait]
impl RecordTransform for RelabelMap {
    fn name(&self) -> &str {
        "relabel"
    }

    fn applies_to(&self, record: &TransactionRecord) -> bool {
        self.map.contains_key(&record.category)
    }

    async fn transform(&self, record: &TransactionRecord) -> Res<TransactionRecord> {
        let Some(to) = self.map.get(&record.category) else {
            return Ok(record.clone());
        };
        Ok(TransactionRecord {
            category: to.clone(),
            explanation: format!("relabelled from '{}'", record.category),
            ..record.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RunnerOptions {
    pub page_size: usize,
    pub batch_size: usize,
    /// Count what would change without writing anything.
    pub dry_run: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            page_size: 400,
            batch_size: 450,
            dry_run: false,
        }
    }
}

pub struct MigrationRunner {
    store: Arc<dyn DocumentStore>,
    options: RunnerOptions,
}

impl MigrationRunner {
    /// Fails with a `Validation` error if either size is zero or the batch size reaches the
    /// store's atomic limit.
    pub fn new(store: Arc<dyn DocumentStore>, options: RunnerOptions) -> Result<Self> {
        crate::config::check_batch("batch size", options.batch_size)
            .and_then(|_| {
                anyhow::ensure!(options.page_size > 0, "page size must be at least 1");
                Ok(())
            })
            .pub_result(ErrorType::Validation)?;
        Ok(Self { store, options })
    }

    /// Runs `transform` over every transaction of `user_id`. On a store failure the error is
    /// returned and the counts reached so far are lost with it; use `run_owner` to keep them.
    pub async fn run(&self, user_id: &str, transform: &dyn RecordTransform) -> Result<RunStats> {
        let mut stats = RunStats::default();
        self.run_into(user_id, transform, &mut stats).await?;
        Ok(stats)
    }

    /// Like `run`, but always returns the counts, together with the error if the run stopped.
    pub async fn run_owner(
        &self,
        user_id: &str,
        transform: &dyn RecordTransform,
    ) -> OwnerOutcome<RunStats> {
        let mut stats = RunStats::default();
        let result = self.run_into(user_id, transform, &mut stats).await;
        if let Err(e) = &result {
            error!("{} for {user_id} stopped: {e}", transform.name());
        }
        OwnerOutcome {
            stats,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Runs `transform` over every owner, one after the other.
    pub async fn run_all(&self, transform: &dyn RecordTransform) -> Result<OwnerReport<RunStats>> {
        let users = list_users(self.store.as_ref())
            .await
            .pub_result(ErrorType::Store)?;
        let mut report = OwnerReport::new();
        for user_id in users {
            let outcome = self.run_owner(&user_id, transform).await;
            report.insert(user_id, outcome);
        }
        Ok(report)
    }

    async fn run_into(
        &self,
        user_id: &str,
        transform: &dyn RecordTransform,
        stats: &mut RunStats,
    ) -> Result<()> {
        let collection = paths::transactions(user_id);
        let mut query = Query::new(collection.as_str())
            .order_by(ORDER_FIELD)
            .limit(self.options.page_size);
        let mut pending = WriteBatch::new();
        info!(
            "Running {} over {user_id}{}",
            transform.name(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        loop {
            let page = self
                .store
                .query(&query)
                .await
                .with_context(|| format!("Unable to read {collection}"))
                .pub_result(ErrorType::Store)?;
            let Some(last) = page.last() else {
                break;
            };
            query = query.start_after(last);
            let full = page.len() == self.options.page_size;

            for row in page {
                stats.scanned += 1;
                let record: TransactionRecord = match decode(row.doc) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Skipping malformed transaction {collection}/{}: {e:#}", row.id);
                        stats.errored += 1;
                        continue;
                    }
                };
                if !transform.applies_to(&record) {
                    stats.skipped += 1;
                    continue;
                }
                let updated = match transform.transform(&record).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!("{} failed on {collection}/{}: {e:#}", transform.name(), row.id);
                        stats.errored += 1;
                        continue;
                    }
                };
                if updated == record {
                    stats.skipped += 1;
                    continue;
                }
                if self.options.dry_run {
                    debug!("Would update {collection}/{}", row.id);
                    stats.updated += 1;
                    continue;
                }
                pending.set(
                    collection.as_str(),
                    row.id,
                    encode(&updated).pub_result(ErrorType::Internal)?,
                );
                if pending.len() >= self.options.batch_size {
                    self.flush(&mut pending, stats).await?;
                }
            }
            self.flush(&mut pending, stats).await?;
            if !full {
                break;
            }
        }
        info!(
            "{} over {user_id}: scanned {}, updated {}, skipped {}, errored {}",
            transform.name(),
            stats.scanned,
            stats.updated,
            stats.skipped,
            stats.errored
        );
        Ok(())
    }

    /// Commits whatever is staged. Records only count as updated once their commit succeeds.
    async fn flush(&self, pending: &mut WriteBatch, stats: &mut RunStats) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = pending.take();
        let n = batch.len() as u64;
        self.store.commit(batch).await.map_err(|e| {
            Error::new(
                ErrorType::Store,
                e.context(format!("Unable to commit {n} updated transactions")),
            )
        })?;
        stats.updated += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResolutionSource, L0};
    use crate::store::{MemoryStore, SetMode, SqliteStore};
    use crate::test::{record, Fixture};

    async fn put(store: &MemoryStore, r: &TransactionRecord) {
        store
            .set(
                &paths::transactions(&r.user_id),
                &r.transaction_id,
                encode(r).unwrap(),
                SetMode::Replace,
            )
            .await
            .unwrap();
    }

    fn legacy(id: &str, l0: &str, amount: &str) -> TransactionRecord {
        let mut r = record(id, "SOMETHING", amount, "2024-02-01");
        r.category = CategoryLabel {
            l0: l0.to_string(),
            l1: "Operating Expenses".to_string(),
            l2: "Utilities".to_string(),
            l3: String::new(),
        };
        r.source = ResolutionSource::GlobalRule;
        r
    }

    fn runner(store: Arc<MemoryStore>, dry_run: bool) -> MigrationRunner {
        MigrationRunner::new(
            store,
            RunnerOptions {
                page_size: 2,
                batch_size: 2,
                dry_run,
            },
        )
        .unwrap()
    }

    async fn seed_legacy(store: &MemoryStore) {
        put(store, &legacy("t1", "expenses", "-10")).await;
        put(store, &legacy("t2", "OPERATING EXPENSE", "-10")).await;
        put(store, &legacy("t3", "Income", "50")).await;
        put(store, &legacy("t4", "", "-3")).await;
        put(store, &legacy("t5", "liabilities", "-900")).await;
    }

    #[tokio::test]
    async fn test_normalize_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        seed_legacy(&store).await;

        let first = runner(store.clone(), false).run("u1", &NormalizeL0).await.unwrap();
        assert_eq!(first.scanned, 5);
        assert_eq!(first.updated, 4);
        assert_eq!(first.skipped, 1);

        let second = runner(store.clone(), false).run("u1", &NormalizeL0).await.unwrap();
        assert_eq!(second.scanned, 5);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 5);

        let t1: TransactionRecord =
            decode(store.get(&paths::transactions("u1"), "t1").await.unwrap().unwrap()).unwrap();
        assert_eq!(t1.category.l0, L0::OperatingExpense.as_str());
        let t5: TransactionRecord =
            decode(store.get(&paths::transactions("u1"), "t5").await.unwrap().unwrap()).unwrap();
        assert_eq!(t5.category.l0, "LIABILITY");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        seed_legacy(&store).await;
        let ops = store.ops_written();
        let stats = runner(store.clone(), true).run("u1", &NormalizeL0).await.unwrap();
        assert_eq!(stats.updated, 4);
        assert_eq!(store.ops_written(), ops);
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn test_updates_are_flushed_in_bounded_batches() {
        let store = Arc::new(MemoryStore::new());
        seed_legacy(&store).await;
        runner(store.clone(), false).run("u1", &NormalizeL0).await.unwrap();
        // Pages of two: {t1, t2} -> 1 write, {t3, t4} -> 2 writes, {t5} -> 1 write.
        assert_eq!(store.commits(), 3);
    }

    struct FailOn(&'static str);

    #[async_trait::async_trait]
    impl RecordTransform for FailOn {
        fn name(&self) -> &str {
            "fail-on"
        }

        async fn transform(&self, record: &TransactionRecord) -> Res<TransactionRecord> {
            anyhow::ensure!(record.transaction_id != self.0, "boom");
            Ok(TransactionRecord {
                explanation: "touched".to_string(),
                ..record.clone()
            })
        }
    }

    #[tokio::test]
    async fn test_item_failures_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        seed_legacy(&store).await;
        store
            .set(
                &paths::transactions("u1"),
                "t9",
                encode(&serde_json::json!({"date": "2024-03-01", "amount": "not money"})).unwrap(),
                SetMode::Replace,
            )
            .await
            .unwrap();
        let stats = runner(store.clone(), false).run("u1", &FailOn("t3")).await.unwrap();
        assert_eq!(stats.scanned, 6);
        assert_eq!(stats.errored, 2);
        assert_eq!(stats.updated, 4);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_counts_in_owner_outcome() {
        let store = Arc::new(MemoryStore::new());
        seed_legacy(&store).await;
        store.fail_commits_after(1, 1);
        let outcome = runner(store.clone(), false)
            .run_owner("u1", &NormalizeL0)
            .await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.stats.updated, 1);

        // The rerun picks up where the failed one stopped.
        let stats = runner(store.clone(), false).run("u1", &NormalizeL0).await.unwrap();
        assert_eq!(stats.updated, 3);
    }

    #[tokio::test]
    async fn test_undated_rows_do_not_stop_sqlite_pagination() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::init(dir.path().join("ledger.sqlite"))
                .await
                .unwrap(),
        );
        let collection = paths::transactions("u1");
        store
            .set(
                &collection,
                "broken",
                encode(&serde_json::json!({"description": "no date"})).unwrap(),
                SetMode::Replace,
            )
            .await
            .unwrap();
        let r = legacy("t1", "expenses", "-10");
        store
            .set(&collection, &r.transaction_id, encode(&r).unwrap(), SetMode::Replace)
            .await
            .unwrap();

        let options = RunnerOptions {
            page_size: 1,
            batch_size: 2,
            dry_run: false,
        };
        let stats = MigrationRunner::new(store.clone(), options)
            .unwrap()
            .run("u1", &NormalizeL0)
            .await
            .unwrap();
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.updated, 1);
        let t1: TransactionRecord =
            decode(store.get(&collection, "t1").await.unwrap().unwrap()).unwrap();
        assert_eq!(t1.category.l0, L0::OperatingExpense.as_str());
    }

    #[tokio::test]
    async fn test_run_all_covers_every_owner() {
        let fx = Fixture::new().await;
        fx.link("u1", "a1").await;
        fx.link("u2", "a2").await;
        put(&fx.store, &legacy("t1", "expense", "-1")).await;
        let mut other = legacy("t2", "asset", "-1");
        other.user_id = "u2".to_string();
        put(&fx.store, &other).await;

        let report = runner(fx.store.clone(), false).run_all(&NormalizeL0).await.unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(crate::model::total(&report).updated, 2);
        assert!(!crate::model::any_failed(&report));
    }

    #[tokio::test]
    async fn test_repair_reresolves_only_unsettled_records() {
        let fx = Fixture::new().await;
        let mut unresolved = record("t1", "CITY WATER DEPT", "-40", "2024-01-01");
        unresolved.category = CategoryLabel::needs_review();
        let mut manual = record("t2", "CITY WATER DEPT", "-40", "2024-01-02");
        manual.category = CategoryLabel::needs_review();
        manual.manual = true;
        let mut removed = record("t3", "CITY WATER DEPT", "-40", "2024-01-03");
        removed.removed = true;
        for r in [&unresolved, &manual, &removed] {
            put(&fx.store, r).await;
        }

        let repair = ReResolve::for_user(fx.resolver(), fx.store.as_ref(), "u1")
            .await
            .unwrap();
        let stats = runner(fx.store.clone(), false).run("u1", &repair).await.unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.skipped, 2);

        let t1: TransactionRecord =
            decode(fx.store.get(&paths::transactions("u1"), "t1").await.unwrap().unwrap()).unwrap();
        assert_eq!(t1.source, ResolutionSource::GlobalRule);
        assert_eq!(t1.category.l3, "Water");

        let again = runner(fx.store.clone(), false).run("u1", &repair).await.unwrap();
        assert_eq!(again.updated, 0);
    }

    fn label(l0: L0, l1: &str, l2: &str) -> CategoryLabel {
        CategoryLabel::new(l0, l1, l2, "")
    }

    #[tokio::test]
    async fn test_relabel_moves_records_once() {
        let store = Arc::new(MemoryStore::new());
        let old = label(L0::OperatingExpense, "Operating Expenses", "Utilities");
        let new = label(L0::OperatingExpense, "Utilities", "General");
        let mut r = record("t1", "WATER", "-1", "2024-01-01");
        r.category = old.clone();
        put(&store, &r).await;

        let map = RelabelMap::new(vec![Relabel {
            from: old,
            to: new.clone(),
        }])
        .unwrap();
        let first = runner(store.clone(), false).run("u1", &map).await.unwrap();
        assert_eq!(first.updated, 1);
        let second = runner(store.clone(), false).run("u1", &map).await.unwrap();
        assert_eq!(second.updated, 0);
        let t1: TransactionRecord =
            decode(store.get(&paths::transactions("u1"), "t1").await.unwrap().unwrap()).unwrap();
        assert_eq!(t1.category, new);
    }

    #[test]
    fn test_relabel_rejects_chains_and_bad_targets() {
        let a = label(L0::Expense, "A", "");
        let b = label(L0::Expense, "B", "");
        let c = label(L0::Expense, "C", "");
        let chain = RelabelMap::new(vec![
            Relabel { from: a.clone(), to: b.clone() },
            Relabel { from: b.clone(), to: c.clone() },
        ]);
        assert_eq!(chain.unwrap_err().error_type(), ErrorType::Validation);

        let bad = CategoryLabel {
            l0: "expenses".to_string(),
            l1: "X".to_string(),
            ..CategoryLabel::default()
        };
        assert!(RelabelMap::new(vec![Relabel { from: a.clone(), to: bad }]).is_err());
        assert!(RelabelMap::new(vec![Relabel { from: a.clone(), to: b.clone() }, Relabel { from: a, to: c }]).is_err());
    }

    #[test]
    fn test_runner_rejects_oversized_batches() {
        let store = Arc::new(MemoryStore::new());
        let err = MigrationRunner::new(
            store,
            RunnerOptions {
                batch_size: 500,
                ..RunnerOptions::default()
            },
        )
        .err()
        .unwrap();
        assert_eq!(err.error_type(), ErrorType::Validation);
    }
}
