//! Implements the `DocumentStore` trait in memory.
//!
//! Note: this is compiled even in the "production" version of this app so that we can run the
//! whole app, top-to-bottom, without a database file.

use crate::error::Res;
use crate::store::{
    compare_sort_values, merge_into, validate_field, DocRow, Document, DocumentStore, Query,
    SetMode, WriteBatch, WriteOp, MAX_BATCH_OPS,
};
use anyhow::{anyhow, bail};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

/// An in-memory `DocumentStore`. Commits can be made to fail on demand, which is how the tests
/// exercise partial-failure recovery.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
    fail_commits: AtomicUsize,
    pass_commits: AtomicUsize,
    commits: AtomicU64,
    ops_written: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `commit` fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits_after(0, n);
    }

    /// Lets the next `pass` commits through, then fails `n`.
    pub fn fail_commits_after(&self, pass: usize, n: usize) {
        self.pass_commits.store(pass, AtomicOrdering::SeqCst);
        self.fail_commits.store(n, AtomicOrdering::SeqCst);
    }

    /// The number of successful commits so far.
    pub fn commits(&self) -> u64 {
        self.commits.load(AtomicOrdering::SeqCst)
    }

    /// The number of operations applied so far, through `set` or `commit`.
    pub fn ops_written(&self) -> u64 {
        self.ops_written.load(AtomicOrdering::SeqCst)
    }

    /// The number of documents in `collection`.
    pub fn count(&self, collection: &str) -> Res<usize> {
        Ok(self.lock()?.get(collection).map(|c| c.len()).unwrap_or(0))
    }

    fn lock(&self) -> Res<MutexGuard<'_, Collections>> {
        self.collections
            .lock()
            .map_err(|_| anyhow!("The memory store lock was poisoned"))
    }
}

fn apply(collections: &mut Collections, op: WriteOp) {
    match op {
        WriteOp::Set {
            collection,
            id,
            doc,
            mode,
        } => {
            let docs = collections.entry(collection).or_default();
            match (mode, docs.get_mut(&id)) {
                (SetMode::Merge, Some(existing)) => merge_into(existing, doc),
                _ => {
                    docs.insert(id, doc);
                }
            }
        }
        WriteOp::Delete { collection, id } => {
            if let Some(docs) = collections.get_mut(&collection) {
                docs.remove(&id);
            }
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Res<Option<Document>> {
        Ok(self
            .lock()?
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, doc: Document, mode: SetMode) -> Res<()> {
        let mut collections = self.lock()?;
        apply(
            &mut collections,
            WriteOp::Set {
                collection: collection.to_string(),
                id: id.to_string(),
                doc,
                mode,
            },
        );
        self.ops_written.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Res<Vec<DocRow>> {
        if let Some(field) = &query.order_by {
            validate_field(field)?;
        }
        let collections = self.lock()?;
        let Some(docs) = collections.get(&query.collection) else {
            return Ok(Vec::new());
        };

        let key = |row: &DocRow| {
            query
                .order_by
                .as_ref()
                .and_then(|field| row.doc.get(field).cloned())
        };
        let mut rows: Vec<DocRow> = docs
            .iter()
            .map(|(id, doc)| DocRow {
                id: id.clone(),
                doc: doc.clone(),
            })
            .collect();
        rows.sort_by(|a, b| {
            compare_sort_values(key(a).as_ref(), key(b).as_ref()).then_with(|| a.id.cmp(&b.id))
        });

        let rows = rows.into_iter().filter(|row| match &query.start_after {
            None => true,
            Some(after) => {
                let by_value = match &query.order_by {
                    Some(_) => compare_sort_values(key(row).as_ref(), after.sort_value.as_ref()),
                    None => Ordering::Equal,
                };
                by_value.then_with(|| row.id.cmp(&after.id)) == Ordering::Greater
            }
        });
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn commit(&self, batch: WriteBatch) -> Res<()> {
        if batch.len() > MAX_BATCH_OPS {
            bail!(
                "A batch of {} operations exceeds the limit of {MAX_BATCH_OPS}",
                batch.len()
            );
        }
        let countdown = |counter: &AtomicUsize| {
            counter
                .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok()
        };
        let fail = !countdown(&self.pass_commits) && countdown(&self.fail_commits);
        if fail {
            bail!("Injected commit failure");
        }
        let mut collections = self.lock()?;
        let n = batch.len() as u64;
        for op in batch.ops().iter().cloned() {
            apply(&mut collections, op);
        }
        self.commits.fetch_add(1, AtomicOrdering::SeqCst);
        self.ops_written.fetch_add(n, AtomicOrdering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{encode, scan_all};
    use serde_json::json;

    fn doc(date: &str) -> Document {
        encode(&json!({ "date": date })).unwrap()
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set("t", "c", doc("2024-01-02"));
        batch.set("t", "a", doc("2024-01-02"));
        batch.set("t", "b", doc("2024-01-01"));
        batch.set("t", "d", doc("2024-01-03"));
        store.commit(batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_query_orders_by_field_then_id() {
        let store = seeded().await;
        let rows = store.query(&Query::new("t").order_by("date")).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_start_after_pagination_visits_each_row_once() {
        let store = seeded().await;
        let first = store
            .query(&Query::new("t").order_by("date").limit(2))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let next = Query::new("t")
            .order_by("date")
            .limit(2)
            .start_after(first.last().unwrap());
        let second = store.query(&next).await.unwrap();
        let ids: Vec<_> = first.iter().chain(second.iter()).map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c", "d"]);

        let all = scan_all(&store, "t", Some("date"), 3).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_merge_keeps_unspecified_fields() {
        let store = MemoryStore::new();
        store
            .set("c", "x", encode(&json!({"a": 1, "b": 2})).unwrap(), SetMode::Replace)
            .await
            .unwrap();
        store
            .set("c", "x", encode(&json!({"b": 3})).unwrap(), SetMode::Merge)
            .await
            .unwrap();
        let got = store.get("c", "x").await.unwrap().unwrap();
        assert_eq!(serde_json::Value::Object(got), json!({"a": 1, "b": 3}));
    }

    #[tokio::test]
    async fn test_oversized_batch_is_rejected_whole() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for i in 0..=MAX_BATCH_OPS {
            batch.set("c", i.to_string(), doc("2024-01-01"));
        }
        assert!(store.commit(batch).await.is_err());
        assert_eq!(store.count("c").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_apply_nothing() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let mut batch = WriteBatch::new();
        batch.set("c", "1", doc("2024-01-01"));
        assert!(store.commit(batch.clone()).await.is_err());
        assert_eq!(store.count("c").unwrap(), 0);
        store.commit(batch).await.unwrap();
        assert_eq!(store.count("c").unwrap(), 1);
        assert_eq!(store.commits(), 1);

        store.fail_commits_after(1, 1);
        assert!(store.commit(WriteBatch::new()).await.is_ok());
        assert!(store.commit(WriteBatch::new()).await.is_err());
        assert!(store.commit(WriteBatch::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = seeded().await;
        let mut batch = WriteBatch::new();
        batch.delete("t", "a");
        batch.delete("t", "missing");
        store.commit(batch).await.unwrap();
        assert_eq!(store.count("t").unwrap(), 3);
        assert!(store.get("t", "a").await.unwrap().is_none());
    }
}
