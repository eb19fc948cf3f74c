//! SQLite-backed remote store.
//!
//! Stands in for a hosted SQL backend: one table per collection, JSON columns
//! stored as text. Because the tables are real, a payload naming a column the
//! table lacks fails with SQLite's own "has no column named" error, which
//! exercises schema-drift handling end to end.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Result as SqliteResult, params_from_iter};
use serde_json::{Number, Value};
use tracing::debug;

use crate::{Filter, Order, Record, RemoteStore, StoreError, StoreResult, collections};

/// Columns holding JSON documents (stored as text).
const JSON_COLUMNS: &[&str] = &["settings", "canvasElements", "config"];

/// Columns holding booleans (stored as 0/1).
const BOOL_COLUMNS: &[&str] = &["showProgressBar"];

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS funnels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    description TEXT,
    status TEXT NOT NULL DEFAULT 'draft',
    settings TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER
);

CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    funnel_id TEXT NOT NULL,
    order_index INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL DEFAULT '',
    buttonText TEXT,
    backButtonText TEXT,
    showProgressBar INTEGER,
    canvasElements TEXT NOT NULL DEFAULT '[]',
    updated_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_steps_funnel ON steps(funnel_id, order_index);

CREATE TABLE IF NOT EXISTS canvas_elements (
    id TEXT PRIMARY KEY,
    step_id TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL DEFAULT 0,
    config TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_elements_step ON canvas_elements(step_id, position);
"#;

/// SQLite [`RemoteStore`].
///
/// The connection sits behind a mutex; calls are short and synchronous, so
/// they run inline rather than on a blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path with the current schema.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        Self::open_with_schema(path, SCHEMA)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        Self::with_schema(Connection::open_in_memory()?, SCHEMA)
    }

    /// Open a database and apply a caller-provided schema, e.g. an older one
    /// lacking recently added columns.
    pub fn open_with_schema<P: AsRef<Path>>(path: P, schema: &str) -> SqliteResult<Self> {
        Self::with_schema(Connection::open(path)?, schema)
    }

    pub fn with_schema(conn: Connection, schema: &str) -> SqliteResult<Self> {
        conn.execute_batch(schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run raw SQL (migrations, test setup).
    pub fn execute_batch(&self, sql: &str) -> SqliteResult<()> {
        self.conn.lock().execute_batch(sql)
    }

    fn upsert_sync(&self, collection: &str, id: &str, fields: &Record) -> StoreResult<Record> {
        let table = table_name(collection)?;
        let columns = field_columns(fields)?;
        let conn = self.conn.lock();

        let mut names = vec![quote("id")];
        names.extend(columns.iter().map(|c| quote(c)));
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let conflict = if columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let sets: Vec<String> = columns
                .iter()
                .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
                .collect();
            format!("DO UPDATE SET {}", sets.join(", "))
        };
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(\"id\") {conflict}",
            names.join(", "),
            placeholders.join(", "),
        );

        let mut values = vec![SqlValue::Text(id.to_string())];
        values.extend(columns.iter().map(|c| to_sql(&fields[*c])));
        conn.execute(&sql, params_from_iter(values.iter()))?;

        fetch_one(&conn, &table, id)?.ok_or_else(|| StoreError::not_found(collection, id))
    }

    fn update_sync(&self, collection: &str, id: &str, patch: &Record) -> StoreResult<Record> {
        let table = table_name(collection)?;
        let columns = field_columns(patch)?;
        let conn = self.conn.lock();

        if !columns.is_empty() {
            let sets: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
                .collect();
            let sql = format!(
                "UPDATE {table} SET {} WHERE \"id\" = ?{}",
                sets.join(", "),
                columns.len() + 1
            );
            let mut values: Vec<SqlValue> = columns.iter().map(|c| to_sql(&patch[*c])).collect();
            values.push(SqlValue::Text(id.to_string()));
            let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
            if changed == 0 {
                return Err(StoreError::not_found(collection, id));
            }
        }

        fetch_one(&conn, &table, id)?.ok_or_else(|| StoreError::not_found(collection, id))
    }

    fn delete_sync(&self, collection: &str, id: &str) -> StoreResult<()> {
        let table = table_name(collection)?;
        let conn = self.conn.lock();
        let removed = conn.execute(&format!("DELETE FROM {table} WHERE \"id\" = ?1"), [id])?;
        debug!("sqlite delete {collection}/{id}: {removed} row(s)");
        Ok(())
    }

    fn select_sync(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Record>> {
        let table = table_name(collection)?;
        let conn = self.conn.lock();

        let mut sql = format!("SELECT * FROM {table}");
        let mut values = Vec::with_capacity(filter.conditions.len());
        for (i, (column, value)) in filter.conditions.iter().enumerate() {
            check_identifier(column)?;
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("{} = ?{}", quote(column), i + 1));
            values.push(to_sql(value));
        }
        if let Some(order) = order {
            check_identifier(&order.column)?;
            let dir = if order.ascending { "ASC" } else { "DESC" };
            sql.push_str(&format!(" ORDER BY {} {dir}", quote(&order.column)));
        }

        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| read_row(row, &names))?;
        Ok(rows.collect::<SqliteResult<Vec<_>>>()?)
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn upsert_record(
        &self,
        collection: &str,
        id: &str,
        fields: Record,
    ) -> StoreResult<Record> {
        self.upsert_sync(collection, id, &fields)
    }

    async fn update_record(
        &self,
        collection: &str,
        id: &str,
        patch: Record,
    ) -> StoreResult<Record> {
        self.update_sync(collection, id, &patch)
    }

    async fn delete_record(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.delete_sync(collection, id)
    }

    async fn select_records(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> StoreResult<Vec<Record>> {
        self.select_sync(collection, filter, order)
    }
}

// ============================================================================
// SQL helpers
// ============================================================================

fn table_name(collection: &str) -> StoreResult<String> {
    if collections::ALL.contains(&collection) {
        Ok(quote(collection))
    } else {
        Err(StoreError::invalid(format!("unknown collection: {collection}")))
    }
}

/// Payload columns other than `id`, validated as identifiers.
fn field_columns(fields: &Record) -> StoreResult<Vec<&str>> {
    let mut columns = Vec::with_capacity(fields.len());
    for key in fields.keys().filter(|k| k.as_str() != "id") {
        check_identifier(key)?;
        columns.push(key.as_str());
    }
    Ok(columns)
}

fn check_identifier(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::invalid(format!("invalid column name: {name:?}")))
    }
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql(column: &str, value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) if BOOL_COLUMNS.contains(&column) => Value::Bool(i != 0),
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) if JSON_COLUMNS.contains(&column) => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(_) => Value::Null,
    }
}

fn read_row(row: &rusqlite::Row<'_>, names: &[String]) -> SqliteResult<Record> {
    let mut record = Record::new();
    for (i, name) in names.iter().enumerate() {
        let value: SqlValue = row.get(i)?;
        record.insert(name.clone(), from_sql(name, value));
    }
    Ok(record)
}

fn fetch_one(conn: &Connection, table: &str, id: &str) -> StoreResult<Option<Record>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {table} WHERE \"id\" = ?1"))?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_row(row, &names)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreErrorKind;
    use serde_json::json;

    fn fields(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    /// The steps table as it looked before back buttons existed.
    const LEGACY_STEPS: &str = r#"
        CREATE TABLE funnels (id TEXT PRIMARY KEY, name TEXT, description TEXT,
                              status TEXT, settings TEXT, updated_at INTEGER);
        CREATE TABLE steps (id TEXT PRIMARY KEY, funnel_id TEXT, order_index INTEGER,
                            title TEXT, buttonText TEXT, showProgressBar INTEGER,
                            canvasElements TEXT, updated_at INTEGER);
        CREATE TABLE canvas_elements (id TEXT PRIMARY KEY, step_id TEXT, type TEXT,
                                      position INTEGER, config TEXT);
    "#;

    #[tokio::test]
    async fn test_upsert_roundtrips_json_and_bool_columns() {
        let store = SqliteStore::in_memory().unwrap();
        let row = store
            .upsert_record(
                collections::STEPS,
                "s1",
                fields(json!({
                    "funnel_id": "f1",
                    "order_index": 0,
                    "title": "Welcome",
                    "showProgressBar": true,
                    "canvasElements": [{"id": "e1", "type": "headline", "position": 0, "config": {}}],
                })),
            )
            .await
            .unwrap();

        assert_eq!(row["id"], "s1");
        assert_eq!(row["showProgressBar"], true);
        assert_eq!(row["canvasElements"][0]["type"], "headline");
        assert_eq!(row["backButtonText"], Value::Null);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_only_given_fields() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_record(
                collections::FUNNELS,
                "f1",
                fields(json!({"name": "Old", "settings": {"theme": "dark"}})),
            )
            .await
            .unwrap();
        let row = store
            .upsert_record(collections::FUNNELS, "f1", fields(json!({"name": "New"})))
            .await
            .unwrap();

        assert_eq!(row["name"], "New");
        assert_eq!(row["settings"]["theme"], "dark");
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update_record(collections::STEPS, "ghost", fields(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_stale_schema_reports_unknown_column() {
        let conn = Connection::open_in_memory().unwrap();
        let store = SqliteStore::with_schema(conn, LEGACY_STEPS).unwrap();

        let err = store
            .upsert_record(
                collections::STEPS,
                "s1",
                fields(json!({"funnel_id": "f1", "title": "A", "backButtonText": "Back"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UnknownColumn);
        assert!(err.message.contains("backButtonText"), "{}", err.message);

        store
            .upsert_record(collections::STEPS, "s1", fields(json!({"funnel_id": "f1", "title": "A"})))
            .await
            .unwrap();
        let err = store
            .update_record(collections::STEPS, "s1", fields(json!({"backButtonText": "Back"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UnknownColumn);
    }

    #[tokio::test]
    async fn test_select_by_funnel_ordered() {
        let store = SqliteStore::in_memory().unwrap();
        for (id, idx) in [("s-b", 1), ("s-a", 0), ("s-c", 2)] {
            store
                .upsert_record(
                    collections::STEPS,
                    id,
                    fields(json!({"funnel_id": "f1", "order_index": idx})),
                )
                .await
                .unwrap();
        }
        store
            .upsert_record(collections::STEPS, "other", fields(json!({"funnel_id": "f2"})))
            .await
            .unwrap();

        let rows = store
            .select_records(
                collections::STEPS,
                &Filter::eq("funnel_id", "f1"),
                Some(&Order::asc("order_index")),
            )
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["s-a", "s-b", "s-c"]);

        store.delete_record(collections::STEPS, "s-b").await.unwrap();
        let rows = store
            .select_records(collections::STEPS, &Filter::eq("funnel_id", "f1"), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_unknown_collection_and_bad_identifiers() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .upsert_record("users", "u1", Record::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Invalid);

        let err = store
            .upsert_record(collections::STEPS, "s1", fields(json!({"title\"; DROP": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_open_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .upsert_record(collections::FUNNELS, "f1", fields(json!({"name": "Kept"})))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let rows = store
            .select_records(collections::FUNNELS, &Filter::all(), None)
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], "Kept");
    }
}
