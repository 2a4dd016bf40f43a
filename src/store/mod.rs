//! The document store the ledger persists into.
//!
//! The store is addressed like a hierarchical document database: collections of JSON documents
//! keyed by id, with sub-collections addressed by owner (`users/{uid}/transactions`). It supports
//! single-document reads and writes, ordered range queries with start-after pagination, and
//! atomic write batches bounded by `MAX_BATCH_OPS`.
//!
//! Typed adapters (`encode`, `decode`) sit on top so that loosely-shaped documents never travel
//! further than the store boundary.

mod memory;
mod migrations;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Res;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// The hard ceiling on operations in one atomic batch. Writers should stay well below it.
pub const MAX_BATCH_OPS: usize = 500;

/// Collection paths.
pub mod paths {
    pub const USERS: &str = "users";
    pub const GLOBAL_RULES: &str = "global_rules";

    pub fn accounts(user_id: &str) -> String {
        format!("{USERS}/{user_id}/accounts")
    }

    pub fn transactions(user_id: &str) -> String {
        format!("{USERS}/{user_id}/transactions")
    }

    pub fn rules(user_id: &str) -> String {
        format!("{USERS}/{user_id}/rules")
    }

    pub fn contacts(user_id: &str) -> String {
        format!("{USERS}/{user_id}/contacts")
    }
}

/// How `set` treats an existing document.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SetMode {
    /// Overwrite the whole document.
    Replace,
    /// Overwrite only the top-level fields present in the new document.
    Merge,
}

/// The position of the last row of the previous page.
#[derive(Debug, Clone, PartialEq)]
pub struct StartAfter {
    /// The value of the `order_by` field on the last row, if ordering by a field.
    pub sort_value: Option<Value>,
    pub id: String,
}

/// An ordered range query over one collection. Rows are ordered by `order_by` (when given) and
/// then by document id, which makes the ordering total and start-after pagination stable.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub order_by: Option<String>,
    pub start_after: Option<StartAfter>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: None,
            start_after: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continues after `row`, using the query's `order_by` field for the sort value.
    pub fn start_after(mut self, row: &DocRow) -> Self {
        let sort_value = self
            .order_by
            .as_ref()
            .map(|f| row.doc.get(f).cloned().unwrap_or(Value::Null));
        self.start_after = Some(StartAfter {
            sort_value,
            id: row.id.clone(),
        });
        self
    }
}

/// A document together with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct DocRow {
    pub id: String,
    pub doc: Document,
}

/// One operation in a `WriteBatch`.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        collection: String,
        id: String,
        doc: Document,
        mode: SetMode,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Writes that are applied all together or not at all. Operations are applied in the order they
/// were added.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, collection: impl Into<String>, id: impl Into<String>, doc: Document) {
        self.ops.push(WriteOp::Set {
            collection: collection.into(),
            id: id.into(),
            doc,
            mode: SetMode::Replace,
        });
    }

    pub fn merge(&mut self, collection: impl Into<String>, id: impl Into<String>, doc: Document) {
        self.ops.push(WriteOp::Set {
            collection: collection.into(),
            id: id.into(),
            doc,
            mode: SetMode::Merge,
        });
    }

    pub fn delete(&mut self, collection: impl Into<String>, id: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Empties the batch, returning what it held.
    pub fn take(&mut self) -> WriteBatch {
        std::mem::take(self)
    }

    /// Splits into batches of at most `size` operations, keeping the order of operations.
    pub fn into_chunks(self, size: usize) -> Vec<WriteBatch> {
        self.ops
            .chunks(size.max(1))
            .map(|ops| WriteBatch { ops: ops.to_vec() })
            .collect()
    }
}

/// The store collaborator.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Res<Option<Document>>;

    async fn set(&self, collection: &str, id: &str, doc: Document, mode: SetMode) -> Res<()>;

    async fn query(&self, query: &Query) -> Res<Vec<DocRow>>;

    /// Applies every operation in `batch` atomically. Batches longer than `max_batch_ops` are
    /// rejected without applying anything.
    async fn commit(&self, batch: WriteBatch) -> Res<()>;

    fn max_batch_ops(&self) -> usize {
        MAX_BATCH_OPS
    }
}

/// Serializes `value` into a document. Fails if `value` is not a JSON object.
pub fn encode<T: Serialize>(value: &T) -> Res<Document> {
    match serde_json::to_value(value).context("Unable to serialize document")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Expected a JSON object for a document, got {other}"),
    }
}

/// Deserializes a document into `T`, rejecting documents that do not have the expected shape.
pub fn decode<T: DeserializeOwned>(doc: Document) -> Res<T> {
    serde_json::from_value(Value::Object(doc)).context("Document does not have the expected shape")
}

/// Reads every document of a collection, `page_size` rows at a time.
pub async fn scan_all(
    store: &dyn DocumentStore,
    collection: &str,
    order_by: Option<&str>,
    page_size: usize,
) -> Res<Vec<DocRow>> {
    let mut query = Query::new(collection).limit(page_size.max(1));
    if let Some(field) = order_by {
        query = query.order_by(field);
    }
    let mut all = Vec::new();
    loop {
        let page = store.query(&query).await?;
        let Some(last) = page.last() else {
            break;
        };
        query = query.start_after(last);
        let full = page.len() == page_size.max(1);
        all.extend(page);
        if !full {
            break;
        }
    }
    Ok(all)
}

/// Shallow merge: top-level fields of `new` overwrite those of `existing`.
pub(crate) fn merge_into(existing: &mut Document, new: Document) {
    for (k, v) in new {
        existing.insert(k, v);
    }
}

/// The ordering used by `Query`: missing and null first, then booleans, numbers and strings.
pub(crate) fn compare_sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Rejects field names that could not be used safely as a JSON path.
pub(crate) fn validate_field(field: &str) -> Res<()> {
    anyhow::ensure!(
        !field.is_empty()
            && field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_'),
        "Invalid order_by field '{field}'"
    );
    Ok(())
}
