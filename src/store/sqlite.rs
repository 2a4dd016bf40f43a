//! Implements the `DocumentStore` trait on a local SQLite file.
//!
//! Every document lives in one `documents` table keyed by `(collection, id)`, with the body held
//! as JSON text. Ordered queries use `json_extract` on the body.

use crate::error::Res;
use crate::store::migrations;
use crate::store::{
    merge_into, validate_field, DocRow, Document, DocumentStore, Query, SetMode, WriteBatch,
    WriteOp, MAX_BATCH_OPS,
};
use anyhow::{bail, Context};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// - Validates that no file currently exists at `path`
    /// - Creates a new SQLite file at `path` and brings its schema up to date
    pub async fn init(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        if path.exists() {
            bail!("A database already exists at '{}'", path.display());
        }
        Self::open(path, true).await
    }

    /// - Validates that there is a SQLite file at `path`
    /// - Migrates its schema if it is out of date
    pub async fn load(path: impl AsRef<Path>) -> Res<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("The database file is missing '{}'", path.display());
        }
        Self::open(path, false).await
    }

    async fn open(path: &Path, create: bool) -> Res<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .context("Failed to parse SQLite connection string")?
            .create_if_missing(create);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Unable to open SQLite database at {}", path.display()))?;
        migrations::bootstrap(&pool).await?;
        let version = migrations::current_version(&pool).await?;
        if version > migrations::CURRENT_VERSION {
            bail!(
                "The database schema is at version {version}, newer than this program supports ({})",
                migrations::CURRENT_VERSION
            );
        }
        migrations::run(&pool, version, migrations::CURRENT_VERSION).await?;
        debug!("Opened document store at {}", path.display());
        Ok(Self { pool })
    }
}

fn parse_body(body: &str) -> Res<Document> {
    match serde_json::from_str(body).context("Stored document is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("Stored document is not a JSON object"),
    }
}

async fn read(conn: &mut SqliteConnection, collection: &str, id: &str) -> Res<Option<Document>> {
    let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to read document {collection}/{id}"))?;
    match row {
        Some(row) => Ok(Some(parse_body(row.try_get::<&str, _>("body")?)?)),
        None => Ok(None),
    }
}

async fn write(conn: &mut SqliteConnection, collection: &str, id: &str, doc: &Document) -> Res<()> {
    let body = serde_json::to_string(doc).context("Unable to serialize document")?;
    sqlx::query(
        "INSERT INTO documents (collection, id, body) VALUES (?, ?, ?) \
         ON CONFLICT (collection, id) DO UPDATE SET body = excluded.body",
    )
    .bind(collection)
    .bind(id)
    .bind(body)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("Failed to write document {collection}/{id}"))?;
    Ok(())
}

async fn apply(conn: &mut SqliteConnection, op: WriteOp) -> Res<()> {
    match op {
        WriteOp::Set {
            collection,
            id,
            doc,
            mode,
        } => {
            let doc = match mode {
                SetMode::Replace => doc,
                SetMode::Merge => match read(conn, &collection, &id).await? {
                    Some(mut existing) => {
                        merge_into(&mut existing, doc);
                        existing
                    }
                    None => doc,
                },
            };
            write(conn, &collection, &id, &doc).await
        }
        WriteOp::Delete { collection, id } => {
            sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                .bind(&collection)
                .bind(&id)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to delete document {collection}/{id}"))?;
            Ok(())
        }
    }
}

fn bind_sort_value<'q>(
    q: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &Value,
) -> Res<sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>> {
    Ok(match value {
        Value::String(s) => q.bind(s.clone()),
        Value::Number(n) => q.bind(n.as_f64().unwrap_or_default()),
        Value::Bool(b) => q.bind(*b),
        other => bail!("Cannot paginate after a sort value of {other}"),
    })
}

#[async_trait::async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Res<Option<Document>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        read(&mut conn, collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, doc: Document, mode: SetMode) -> Res<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        apply(
            &mut tx,
            WriteOp::Set {
                collection: collection.to_string(),
                id: id.to_string(),
                doc,
                mode,
            },
        )
        .await?;
        tx.commit().await.context("Failed to commit write")?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Res<Vec<DocRow>> {
        let path = match &query.order_by {
            Some(field) => {
                validate_field(field)?;
                Some(format!("$.{field}"))
            }
            None => None,
        };

        let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
        // SQLite sorts NULL first, and a missing field extracts as NULL.
        let after_null = query
            .start_after
            .as_ref()
            .is_some_and(|after| matches!(after.sort_value, None | Some(Value::Null)));
        match (&path, &query.start_after) {
            (Some(_), Some(_)) if after_null => sql.push_str(
                " AND (json_extract(body, ?) IS NOT NULL OR (json_extract(body, ?) IS NULL AND id > ?))",
            ),
            (Some(_), Some(_)) => sql.push_str(
                " AND (json_extract(body, ?) > ? OR (json_extract(body, ?) = ? AND id > ?))",
            ),
            (None, Some(_)) => sql.push_str(" AND id > ?"),
            _ => {}
        }
        match &path {
            Some(_) => sql.push_str(" ORDER BY json_extract(body, ?), id"),
            None => sql.push_str(" ORDER BY id"),
        }
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(query.collection.clone());
        match (&path, &query.start_after) {
            (Some(path), Some(after)) if after_null => {
                q = q.bind(path.clone());
                q = q.bind(path.clone());
                q = q.bind(after.id.clone());
            }
            (Some(path), Some(after)) => {
                let value = after.sort_value.clone().unwrap_or(Value::Null);
                q = q.bind(path.clone());
                q = bind_sort_value(q, &value)?;
                q = q.bind(path.clone());
                q = bind_sort_value(q, &value)?;
                q = q.bind(after.id.clone());
            }
            (None, Some(after)) => q = q.bind(after.id.clone()),
            _ => {}
        }
        if let Some(path) = &path {
            q = q.bind(path.clone());
        }
        if let Some(limit) = query.limit {
            q = q.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to query collection {}", query.collection))?;
        rows.iter()
            .map(|row| {
                Ok(DocRow {
                    id: row.try_get("id")?,
                    doc: parse_body(row.try_get::<&str, _>("body")?)?,
                })
            })
            .collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Res<()> {
        if batch.len() > MAX_BATCH_OPS {
            bail!(
                "A batch of {} operations exceeds the limit of {MAX_BATCH_OPS}",
                batch.len()
            );
        }
        let mut tx = self.pool.begin().await.context("Failed to begin batch")?;
        for op in batch.ops().iter().cloned() {
            apply(&mut tx, op).await?;
        }
        tx.commit().await.context("Failed to commit batch")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{encode, scan_all};
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::init(dir.path().join("ledger.sqlite")).await.unwrap();
        (dir, store)
    }

    fn doc(v: serde_json::Value) -> Document {
        encode(&v).unwrap()
    }

    #[tokio::test]
    async fn test_init_refuses_existing_file_and_load_reopens() {
        let (dir, store) = store().await;
        store
            .set("c", "1", doc(json!({"a": 1})), SetMode::Replace)
            .await
            .unwrap();
        let path = dir.path().join("ledger.sqlite");
        assert!(SqliteStore::init(&path).await.is_err());
        let reopened = SqliteStore::load(&path).await.unwrap();
        assert!(reopened.get("c", "1").await.unwrap().is_some());
        assert!(SqliteStore::load(dir.path().join("missing.sqlite")).await.is_err());
    }

    #[tokio::test]
    async fn test_merge_and_replace() {
        let (_dir, store) = store().await;
        store
            .set("c", "x", doc(json!({"a": 1, "b": 2})), SetMode::Merge)
            .await
            .unwrap();
        store
            .set("c", "x", doc(json!({"b": 3})), SetMode::Merge)
            .await
            .unwrap();
        let merged = store.get("c", "x").await.unwrap().unwrap();
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 3}));

        store
            .set("c", "x", doc(json!({"z": 0})), SetMode::Replace)
            .await
            .unwrap();
        let replaced = store.get("c", "x").await.unwrap().unwrap();
        assert_eq!(Value::Object(replaced), json!({"z": 0}));
    }

    #[tokio::test]
    async fn test_ordered_pagination() {
        let (_dir, store) = store().await;
        let mut batch = WriteBatch::new();
        for (id, date) in [("c", "2024-01-02"), ("a", "2024-01-02"), ("b", "2024-01-01")] {
            batch.set("t", id, doc(json!({ "date": date })));
        }
        batch.set("other", "zz", doc(json!({"date": "2000-01-01"})));
        store.commit(batch).await.unwrap();

        let first = store
            .query(&Query::new("t").order_by("date").limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let rest = store
            .query(
                &Query::new("t")
                    .order_by("date")
                    .limit(2)
                    .start_after(first.last().unwrap()),
            )
            .await
            .unwrap();
        let ids: Vec<_> = rest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c"]);

        let by_id = scan_all(&store, "t", None, 1).await.unwrap();
        let ids: Vec<_> = by_id.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_ordered_pagination_past_missing_values() {
        let (_dir, store) = store().await;
        let mut batch = WriteBatch::new();
        batch.set("t", "a", doc(json!({"date": "2024-01-01"})));
        batch.set("t", "b", doc(json!({"note": "no date"})));
        batch.set("t", "c", doc(json!({"date": null})));
        batch.set("t", "d", doc(json!({"date": "2023-12-31"})));
        store.commit(batch).await.unwrap();

        let mut query = Query::new("t").order_by("date").limit(1);
        let mut ids = Vec::new();
        loop {
            let page = store.query(&query).await.unwrap();
            let Some(last) = page.last() else {
                break;
            };
            query = query.start_after(last);
            ids.extend(page.iter().map(|r| r.id.clone()));
        }
        assert_eq!(ids, vec!["b", "c", "d", "a"]);
    }

    #[tokio::test]
    async fn test_batch_is_atomic_and_bounded() {
        let (_dir, store) = store().await;
        let mut batch = WriteBatch::new();
        for i in 0..=MAX_BATCH_OPS {
            batch.set("c", i.to_string(), doc(json!({})));
        }
        assert!(store.commit(batch).await.is_err());
        assert!(scan_all(&store, "c", None, 100).await.unwrap().is_empty());

        let mut batch = WriteBatch::new();
        batch.set("c", "keep", doc(json!({"v": 1})));
        batch.delete("c", "keep");
        batch.set("c", "last", doc(json!({"v": 2})));
        store.commit(batch).await.unwrap();
        let rows = scan_all(&store, "c", None, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "last");
    }
}
