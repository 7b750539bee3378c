//! Row-level SQL against local tables.
//!
//! Everything here runs on a caller-supplied connection, normally inside
//! the batch transaction, so several tables can be changed atomically.
//! Rows are JSON maps; only columns the destination table actually has
//! are written.

use crate::error::{ReplicationError, Result};
use crate::event::Row;
use crate::handler::ApplyOp;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _, SqliteConnection, TypeInfo, ValueRef};

/// Stay well below SQLite's bound-parameter limit.
const MAX_BIND_PARAMS: usize = 32_000;

/// Column layout of a local table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<String>,
    /// Primary key columns in key order.
    pub pkey: Vec<String>,
}

impl TableInfo {
    pub fn is_key(&self, column: &str) -> bool {
        self.pkey.iter().any(|k| k == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Columns of `row` that exist in this table, in table order.
    fn present_columns(&self, row: &Row) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| row.contains_key(c.as_str()))
            .map(String::as_str)
            .collect()
    }

    fn require_key(&self, row: &Row) -> Result<()> {
        for key in &self.pkey {
            if !row.contains_key(key) {
                return Err(ReplicationError::handler(
                    &self.name,
                    format!("row lacks key column {}", key),
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Bind a JSON value with the closest SQLite storage class.
pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Decode a result row into a JSON map keyed by column name.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => Value::from(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                _ => match row.try_get::<String, _>(i) {
                    Ok(s) => Value::String(s),
                    Err(_) => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(i)?)),
                },
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Look up a table's columns and primary key. `None` if it does not exist.
pub(crate) async fn load_table_info(conn: &mut SqliteConnection, table: &str) -> Result<Option<TableInfo>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT name, pk FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let columns = rows.iter().map(|(name, _)| name.clone()).collect();
    let mut keyed: Vec<(i64, String)> = rows
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, pk)| (pk, name))
        .collect();
    keyed.sort();

    Ok(Some(TableInfo {
        name: table.to_string(),
        columns,
        pkey: keyed.into_iter().map(|(_, name)| name).collect(),
    }))
}

/// Like [`load_table_info`] but requires the table to exist and have a key.
pub(crate) async fn require_table_info(conn: &mut SqliteConnection, table: &str) -> Result<TableInfo> {
    let info = load_table_info(conn, table)
        .await?
        .ok_or_else(|| ReplicationError::handler(table, "table does not exist"))?;
    if info.pkey.is_empty() {
        return Err(ReplicationError::handler(table, "table has no primary key"));
    }
    Ok(info)
}

/// All rows of a table, ordered by primary key.
pub(crate) async fn select_rows(conn: &mut SqliteConnection, info: &TableInfo) -> Result<Vec<Row>> {
    let columns: Vec<String> = info.columns.iter().map(|c| quote_ident(c)).collect();
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&info.name));
    if !info.pkey.is_empty() {
        let keys: Vec<String> = info.pkey.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(decode_row).collect()
}

fn upsert_sql(info: &TableInfo, columns: &[&str], rows: usize, version_column: Option<&str>) -> String {
    let table = quote_ident(&info.name);
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![placeholders; rows].join(", ");
    let keys: Vec<String> = info.pkey.iter().map(|c| quote_ident(c)).collect();

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !info.is_key(c))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let mut clause = format!("DO UPDATE SET {}", updates.join(", "));
        if let Some(version) = version_column.filter(|v| columns.contains(v)) {
            let v = quote_ident(version);
            clause.push_str(&format!(
                " WHERE {table}.{v} IS NULL OR excluded.{v} >= {table}.{v}",
                table = table,
                v = v
            ));
        }
        clause
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        table,
        column_list.join(", "),
        values,
        keys.join(", "),
        conflict
    )
}

/// Insert or overwrite rows by primary key, in chunks of at most `chunk_rows`.
pub(crate) async fn upsert_rows(
    conn: &mut SqliteConnection,
    info: &TableInfo,
    rows: &[Row],
    version_column: Option<&str>,
    chunk_rows: usize,
) -> Result<u64> {
    let Some(first) = rows.first() else {
        return Ok(0);
    };
    for row in rows {
        info.require_key(row)?;
    }

    let columns = info.present_columns(first);
    let per_chunk = chunk_rows
        .max(1)
        .min((MAX_BIND_PARAMS / columns.len().max(1)).max(1));

    let mut affected = 0;
    for chunk in rows.chunks(per_chunk) {
        let sql = upsert_sql(info, &columns, chunk.len(), version_column);
        let mut query = sqlx::query(&sql);
        for row in chunk {
            for column in &columns {
                query = bind_value(query, row.get(*column).unwrap_or(&Value::Null));
            }
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

pub(crate) async fn delete_row(conn: &mut SqliteConnection, info: &TableInfo, key: &Row) -> Result<u64> {
    info.require_key(key)?;
    let predicate: Vec<String> = info
        .pkey
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect();
    let sql = format!("DELETE FROM {} WHERE {}", quote_ident(&info.name), predicate.join(" AND "));
    let mut query = sqlx::query(&sql);
    for column in &info.pkey {
        query = bind_value(query, key.get(column).unwrap_or(&Value::Null));
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

pub(crate) async fn truncate(conn: &mut SqliteConnection, info: &TableInfo) -> Result<u64> {
    let sql = format!("DELETE FROM {}", quote_ident(&info.name));
    Ok(sqlx::query(&sql).execute(&mut *conn).await?.rows_affected())
}

/// Apply one staged operation.
pub(crate) async fn apply_op(conn: &mut SqliteConnection, info: &TableInfo, op: &ApplyOp) -> Result<u64> {
    match op {
        ApplyOp::Upsert { row, version_column } => {
            upsert_rows(conn, info, std::slice::from_ref(row), version_column.as_deref(), 1).await
        }
        ApplyOp::Delete { key } => delete_row(conn, info, key).await,
        ApplyOp::Truncate => truncate(conn, info).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::row_of;
    use serde_json::json;
    use sqlx::Connection;

    async fn conn() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, tag BLOB);
             CREATE TABLE pairs (a TEXT, b INTEGER, v INTEGER, PRIMARY KEY (b, a));
             CREATE TABLE heap (x INTEGER);",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_table_info_key_order() {
        let mut conn = conn().await;
        let info = load_table_info(&mut conn, "pairs").await.unwrap().unwrap();
        assert_eq!(info.columns, vec!["a", "b", "v"]);
        assert_eq!(info.pkey, vec!["b", "a"]);
        assert!(info.is_key("a"));
        assert!(!info.is_key("v"));

        assert!(load_table_info(&mut conn, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_require_table_info_rejects_keyless() {
        let mut conn = conn().await;
        let err = require_table_info(&mut conn, "heap").await.unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[tokio::test]
    async fn test_upsert_then_overwrite() {
        let mut conn = conn().await;
        let info = require_table_info(&mut conn, "users").await.unwrap();

        let rows = vec![
            row_of([("id", json!(1)), ("name", json!("a")), ("score", json!(1.5))]),
            row_of([("id", json!(2)), ("name", json!("b")), ("score", json!(null))]),
        ];
        upsert_rows(&mut conn, &info, &rows, None, 1).await.unwrap();

        let update = ApplyOp::Upsert {
            row: row_of([("id", json!(1)), ("name", json!("z")), ("unknown", json!(3))]),
            version_column: None,
        };
        apply_op(&mut conn, &info, &update).await.unwrap();

        let all = select_rows(&mut conn, &info).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["name"], json!("z"));
        assert_eq!(all[0]["score"], json!(1.5));
        assert_eq!(all[1]["score"], Value::Null);
    }

    #[tokio::test]
    async fn test_upsert_requires_key() {
        let mut conn = conn().await;
        let info = require_table_info(&mut conn, "users").await.unwrap();
        let row = row_of([("name", json!("nokey"))]);
        let err = upsert_rows(&mut conn, &info, &[row], None, 10).await.unwrap_err();
        assert!(err.to_string().contains("lacks key column id"));
    }

    #[tokio::test]
    async fn test_version_guard_keeps_newer() {
        let mut conn = conn().await;
        let info = require_table_info(&mut conn, "pairs").await.unwrap();

        let newer = row_of([("a", json!("x")), ("b", json!(1)), ("v", json!(10))]);
        let older = row_of([("a", json!("x")), ("b", json!(1)), ("v", json!(5))]);
        upsert_rows(&mut conn, &info, &[newer], Some("v"), 10).await.unwrap();
        upsert_rows(&mut conn, &info, &[older], Some("v"), 10).await.unwrap();

        let all = select_rows(&mut conn, &info).await.unwrap();
        assert_eq!(all[0]["v"], json!(10));
    }

    #[tokio::test]
    async fn test_delete_and_truncate() {
        let mut conn = conn().await;
        let info = require_table_info(&mut conn, "users").await.unwrap();
        let rows: Vec<Row> = (1..=5).map(|i| row_of([("id", json!(i))])).collect();
        upsert_rows(&mut conn, &info, &rows, None, 2).await.unwrap();

        let deleted = delete_row(&mut conn, &info, &row_of([("id", json!(3))])).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(select_rows(&mut conn, &info).await.unwrap().len(), 4);

        truncate(&mut conn, &info).await.unwrap();
        assert!(select_rows(&mut conn, &info).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blob_decodes_as_hex() {
        let mut conn = conn().await;
        sqlx::query("INSERT INTO users (id, tag) VALUES (1, x'0aff')")
            .execute(&mut conn)
            .await
            .unwrap();
        let info = require_table_info(&mut conn, "users").await.unwrap();
        let all = select_rows(&mut conn, &info).await.unwrap();
        assert_eq!(all[0]["tag"], json!("0aff"));
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("public.users"), "\"public.users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
