//! Relational back end over SQLite.
//!
//! Declared entities become tables with quoted identifiers; decimals and
//! datetimes persist as TEXT for exact fidelity, bools as INTEGER 0/1.
//! Junction tables carry cascade-delete foreign keys and one index per id
//! column. Orphan removal lives here as AFTER DELETE triggers, so junction
//! mutations reaching the store by any path run the same reclamation rule.

use std::collections::HashMap;
use std::str::FromStr;

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::{debug, info};

use super::{OrphanCheck, RawRecord, StorageAdapter};
use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use crate::schema::types::{junction_table_name, EntityDef, FieldKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Integer,
}

#[derive(Debug, Clone)]
struct TableSpec {
    columns: Vec<(String, ColumnKind)>,
}

pub struct SqliteStore {
    config: StoreConfig,
    conn: Option<SqliteConnection>,
    tables: HashMap<String, TableSpec>,
    in_txn: bool,
}

impl SqliteStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            conn: None,
            tables: HashMap::new(),
            in_txn: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreConfig::in_memory())
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::Storage("store is not open".into()))
    }

    fn spec(&self, table: &str) -> Result<&TableSpec> {
        self.tables
            .get(table)
            .ok_or_else(|| EngineError::Storage(format!("no such table '{table}'")))
    }

    /// Escape hatch for operators and tests: run one raw SQL statement.
    /// Junction rows deleted this way still fire the orphan triggers.
    pub async fn execute_raw(&mut self, sql: &str) -> Result<u64> {
        let conn = self.conn()?;
        let done = sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(classify)?;
        Ok(done.rows_affected())
    }

    /// Names of schema objects of one type (`table`, `trigger`, `index`)
    /// with their DDL, from `sqlite_master`. Used by idempotence checks.
    pub async fn master_entries(&mut self, kind: &str) -> Result<Vec<(String, Option<String>)>> {
        let conn = self.conn()?;
        let rows = sqlx::query("SELECT name, sql FROM sqlite_master WHERE type = ? ORDER BY name")
            .bind(kind.to_string())
            .fetch_all(&mut *conn)
            .await
            .map_err(classify)?;
        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name").map_err(classify)?;
                let sql: Option<String> = row.try_get("sql").map_err(classify)?;
                Ok((name, sql))
            })
            .collect()
    }

    fn row_to_record(&self, table: &str, row: &SqliteRow) -> Result<RawRecord> {
        let spec = self.spec(table)?;
        let mut record = RawRecord::new();
        for (name, kind) in &spec.columns {
            let value = match kind {
                ColumnKind::Text => {
                    let v: Option<String> = row.try_get(name.as_str()).map_err(classify)?;
                    v.map(JsonValue::String).unwrap_or(JsonValue::Null)
                }
                ColumnKind::Integer => {
                    let v: Option<i64> = row.try_get(name.as_str()).map_err(classify)?;
                    v.map(JsonValue::from).unwrap_or(JsonValue::Null)
                }
            };
            record.insert(name.clone(), value);
        }
        Ok(record)
    }

    fn select_sql(&self, table: &str, criteria: &RawRecord) -> (String, Vec<JsonValue>) {
        let mut sql = format!("SELECT * FROM {}", quote_ident(table));
        let mut binds = Vec::new();
        if !criteria.is_empty() {
            let clauses: Vec<String> = criteria
                .iter()
                .map(|(col, value)| {
                    if value.is_null() {
                        format!("{} IS NULL", quote_ident(col))
                    } else {
                        binds.push(value.clone());
                        format!("{} = ?", quote_ident(col))
                    }
                })
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        (sql, binds)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_raw<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &JsonValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        JsonValue::String(s) => query.bind(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.to_string())
            }
        }
        JsonValue::Bool(b) => query.bind(if *b { 1_i64 } else { 0 }),
        _ => query.bind(Option::<String>::None),
    }
}

/// Map a store failure onto the engine's error kinds: unique/not-null
/// violations are validation failures, foreign-key/check violations are
/// constraint failures, everything else is a storage failure.
fn classify(e: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(db) = &e {
        let msg = db.message().to_string();
        if msg.contains("UNIQUE constraint") || msg.contains("NOT NULL constraint") {
            return EngineError::Validation(msg);
        }
        if msg.contains("FOREIGN KEY constraint") || msg.contains("CHECK constraint") {
            return EngineError::Constraint(msg);
        }
    }
    EngineError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl StorageAdapter for SqliteStore {
    async fn init(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let options = if self.config.db_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(classify)?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.config.db_path)
                .create_if_missing(self.config.create_if_missing)
        };
        let options = options
            .foreign_keys(true)
            .busy_timeout(self.config.busy_timeout);
        let conn = options.connect().await.map_err(classify)?;
        self.conn = Some(conn);
        info!(path = %self.config.db_path, "sqlite store opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(classify)?;
            debug!("sqlite store closed");
        }
        self.in_txn = false;
        Ok(())
    }

    async fn ensure_table(&mut self, name: &str, def: &EntityDef) -> Result<()> {
        let mut columns = Vec::new();
        let mut col_sql = Vec::new();
        let mut pk_cols = Vec::new();
        for field in &def.fields {
            let col_kind = match field.kind {
                FieldKind::Bool => ColumnKind::Integer,
                _ => ColumnKind::Text,
            };
            columns.push((field.name.clone(), col_kind));
            let mut clause = format!(
                "{} {}",
                quote_ident(&field.name),
                field.kind.column_type()
            );
            if field.not_null || field.primary {
                clause.push_str(" NOT NULL");
            }
            if field.unique {
                clause.push_str(" UNIQUE");
            }
            col_sql.push(clause);
            if field.primary {
                pk_cols.push(quote_ident(&field.name));
            }
        }
        if !pk_cols.is_empty() {
            col_sql.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(name),
            col_sql.join(", ")
        );
        debug!(table = %name, "ensure table");
        let conn = self.conn()?;
        sqlx::query(&sql).execute(&mut *conn).await.map_err(classify)?;
        self.tables.insert(name.to_string(), TableSpec { columns });
        Ok(())
    }

    async fn ensure_relation_table(
        &mut self,
        e1: &str,
        e2: &str,
        pk1: &str,
        pk2: &str,
    ) -> Result<()> {
        // Physical layout depends only on the lex order of the pair.
        let ((first, first_pk), (second, second_pk)) = if e1.to_lowercase() <= e2.to_lowercase() {
            ((e1, pk1), (e2, pk2))
        } else {
            ((e2, pk2), (e1, pk1))
        };
        let table = junction_table_name(first, second);
        let first_col = format!("{}_{}", first.to_lowercase(), first_pk);
        let second_col = format!("{}_{}", second.to_lowercase(), second_pk);

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {t} (\
             {c1} TEXT NOT NULL, \
             {c2} TEXT NOT NULL, \
             \"create_time\" TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             PRIMARY KEY ({c1}, {c2}), \
             FOREIGN KEY ({c1}) REFERENCES {p1}({k1}) ON DELETE CASCADE, \
             FOREIGN KEY ({c2}) REFERENCES {p2}({k2}) ON DELETE CASCADE)",
            t = quote_ident(&table),
            c1 = quote_ident(&first_col),
            c2 = quote_ident(&second_col),
            p1 = quote_ident(first),
            k1 = quote_ident(first_pk),
            p2 = quote_ident(second),
            k2 = quote_ident(second_pk),
        );
        debug!(table = %table, "ensure relation table");
        {
            let conn = self.conn()?;
            sqlx::query(&create).execute(&mut *conn).await.map_err(classify)?;
            for col in [&first_col, &second_col] {
                let index = format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("idx_{table}_{col}")),
                    quote_ident(&table),
                    quote_ident(col)
                );
                sqlx::query(&index).execute(&mut *conn).await.map_err(classify)?;
            }
        }
        self.tables.insert(
            table,
            TableSpec {
                columns: vec![
                    (first_col, ColumnKind::Text),
                    (second_col, ColumnKind::Text),
                    ("create_time".to_string(), ColumnKind::Text),
                ],
            },
        );
        Ok(())
    }

    async fn ensure_orphan_trigger(
        &mut self,
        target_entity: &str,
        target_pk: &str,
        trigger_table: &str,
        target_id_col: &str,
        all_checks: &[OrphanCheck],
    ) -> Result<()> {
        let name = format!(
            "auto_gc_{}_from_{}",
            target_entity.to_lowercase(),
            trigger_table
        );
        // The row goes only when no owner junction still references it:
        // one NOT EXISTS per owner junction, all present in every trigger.
        let guards: Vec<String> = all_checks
            .iter()
            .map(|(junction, col)| {
                format!(
                    "NOT EXISTS (SELECT 1 FROM {} WHERE {} = OLD.{})",
                    quote_ident(junction),
                    quote_ident(col),
                    quote_ident(target_id_col)
                )
            })
            .collect();
        let sql = format!(
            "CREATE TRIGGER IF NOT EXISTS {name} AFTER DELETE ON {table} \
             BEGIN \
             DELETE FROM {target} WHERE {pk} = OLD.{old_col} AND {guards}; \
             END",
            name = quote_ident(&name),
            table = quote_ident(trigger_table),
            target = quote_ident(target_entity),
            pk = quote_ident(target_pk),
            old_col = quote_ident(target_id_col),
            guards = guards.join(" AND "),
        );
        debug!(trigger = %name, "ensure orphan trigger");
        let conn = self.conn()?;
        sqlx::query(&sql).execute(&mut *conn).await.map_err(classify)?;
        Ok(())
    }

    async fn find_one(&mut self, table: &str, criteria: &RawRecord) -> Result<Option<RawRecord>> {
        let (sql, binds) = self.select_sql(table, criteria);
        let conn = self.conn.as_mut().ok_or_else(|| EngineError::Storage("store is not open".into()))?;
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_raw(query, value);
        }
        let row = query.fetch_optional(&mut *conn).await.map_err(classify)?;
        row.map(|r| self.row_to_record(table, &r)).transpose()
    }

    async fn find(&mut self, table: &str, criteria: &RawRecord) -> Result<Vec<RawRecord>> {
        let (sql, binds) = self.select_sql(table, criteria);
        let conn = self.conn.as_mut().ok_or_else(|| EngineError::Storage("store is not open".into()))?;
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_raw(query, value);
        }
        let rows = query.fetch_all(&mut *conn).await.map_err(classify)?;
        rows.iter()
            .map(|r| self.row_to_record(table, r))
            .collect()
    }

    async fn insert(&mut self, table: &str, record: &RawRecord) -> Result<()> {
        // Declared constraints are the store's to enforce; its errors are
        // classified into the engine kinds.
        let cols: Vec<String> = record.keys().map(|k| quote_ident(k)).collect();
        let placeholders = vec!["?"; record.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            cols.join(", "),
            placeholders
        );
        let conn = self.conn()?;
        let mut query = sqlx::query(&sql);
        for value in record.values() {
            query = bind_raw(query, value);
        }
        query.execute(&mut *conn).await.map_err(classify)?;
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        criteria: &RawRecord,
        updates: &RawRecord,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let set_clauses: Vec<String> = updates
            .keys()
            .map(|k| format!("{} = ?", quote_ident(k)))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(table),
            set_clauses.join(", ")
        );
        let mut binds: Vec<JsonValue> = updates.values().cloned().collect();
        if !criteria.is_empty() {
            let clauses: Vec<String> = criteria
                .iter()
                .map(|(col, value)| {
                    if value.is_null() {
                        format!("{} IS NULL", quote_ident(col))
                    } else {
                        binds.push(value.clone());
                        format!("{} = ?", quote_ident(col))
                    }
                })
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let conn = self.conn()?;
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_raw(query, value);
        }
        query.execute(&mut *conn).await.map_err(classify)?;
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.conn.is_none() {
            return Err(EngineError::Transaction("store is not open".into()));
        }
        if self.in_txn {
            return Err(EngineError::Transaction(
                "nested transactions are not supported".into(),
            ));
        }
        let sql = format!("BEGIN {}", self.config.isolation.as_sql());
        let conn = self.conn()?;
        sqlx::query(&sql).execute(&mut *conn).await.map_err(classify)?;
        self.in_txn = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(EngineError::Transaction(
                "commit without an open transaction".into(),
            ));
        }
        let conn = self.conn()?;
        sqlx::query("COMMIT").execute(&mut *conn).await.map_err(classify)?;
        self.in_txn = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(EngineError::Transaction(
                "rollback without an open transaction".into(),
            ));
        }
        let conn = self.conn()?;
        sqlx::query("ROLLBACK").execute(&mut *conn).await.map_err(classify)?;
        self.in_txn = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{FieldDef, RelationField};
    use pretty_assertions::assert_eq;

    fn item_def() -> EntityDef {
        EntityDef {
            name: "Item".into(),
            fields: vec![
                FieldDef {
                    name: "id".into(),
                    raw_type: "number".into(),
                    kind: FieldKind::Number {
                        precision: None,
                        scale: None,
                    },
                    primary: true,
                    not_null: false,
                    unique: false,
                    default_value: None,
                },
                FieldDef {
                    name: "name".into(),
                    raw_type: "str[50]".into(),
                    kind: FieldKind::Text {
                        max_length: Some(50),
                    },
                    primary: false,
                    not_null: false,
                    unique: true,
                    default_value: None,
                },
                FieldDef {
                    name: "in_stock".into(),
                    raw_type: "bool".into(),
                    kind: FieldKind::Bool,
                    primary: false,
                    not_null: false,
                    unique: false,
                    default_value: None,
                },
            ],
            relations: vec![],
            owners: vec![],
        }
    }

    fn record(pairs: &[(&str, JsonValue)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn open_store() -> SqliteStore {
        let mut store = SqliteStore::in_memory();
        store.init().await.unwrap();
        store.ensure_table("Item", &item_def()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let mut store = open_store().await;
        store
            .insert(
                "Item",
                &record(&[
                    ("id", JsonValue::String("1".into())),
                    ("name", JsonValue::String("Sword".into())),
                    ("in_stock", JsonValue::from(1_i64)),
                ]),
            )
            .await
            .unwrap();
        let row = store
            .find_one("Item", &record(&[("id", JsonValue::String("1".into()))]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], JsonValue::String("Sword".into()));
        assert_eq!(row["in_stock"], JsonValue::from(1_i64));

        let missing = store
            .find_one("Item", &record(&[("id", JsonValue::String("2".into()))]))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn ensure_table_is_idempotent() {
        let mut store = open_store().await;
        store.ensure_table("Item", &item_def()).await.unwrap();
        let tables = store.master_entries("table").await.unwrap();
        assert_eq!(tables.len(), 1);
    }

    #[tokio::test]
    async fn unique_violation_is_validation() {
        let mut store = open_store().await;
        for id in ["1", "2"] {
            let result = store
                .insert(
                    "Item",
                    &record(&[
                        ("id", JsonValue::String(id.into())),
                        ("name", JsonValue::String("Sword".into())),
                    ]),
                )
                .await;
            if id == "1" {
                result.unwrap();
            } else {
                let err = result.unwrap_err();
                assert_eq!(err.kind(), "validation");
            }
        }
    }

    #[tokio::test]
    async fn nested_begin_is_transaction_error() {
        let mut store = open_store().await;
        store.begin_transaction().await.unwrap();
        let err = store.begin_transaction().await.unwrap_err();
        assert_eq!(err.kind(), "transaction");
        store.rollback().await.unwrap();
        assert_eq!(store.commit().await.unwrap_err().kind(), "transaction");
    }

    #[tokio::test]
    async fn rollback_restores_state() {
        let mut store = open_store().await;
        store.begin_transaction().await.unwrap();
        store
            .insert(
                "Item",
                &record(&[("id", JsonValue::String("9".into()))]),
            )
            .await
            .unwrap();
        store.rollback().await.unwrap();
        let row = store
            .find_one("Item", &record(&[("id", JsonValue::String("9".into()))]))
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn update_touches_matching_row() {
        let mut store = open_store().await;
        store
            .insert(
                "Item",
                &record(&[
                    ("id", JsonValue::String("1".into())),
                    ("name", JsonValue::String("Sword".into())),
                ]),
            )
            .await
            .unwrap();
        store
            .update(
                "Item",
                &record(&[("id", JsonValue::String("1".into()))]),
                &record(&[("name", JsonValue::String("Axe".into()))]),
            )
            .await
            .unwrap();
        let row = store
            .find_one("Item", &record(&[("id", JsonValue::String("1".into()))]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["name"], JsonValue::String("Axe".into()));
    }

    #[tokio::test]
    async fn orphan_trigger_reclaims_owned_row() {
        let mut store = open_store().await;
        let mut student = item_def();
        student.name = "Student".into();
        store.ensure_table("Student", &student).await.unwrap();
        let class = {
            let mut c = item_def();
            c.name = "Class".into();
            c.relations = vec![RelationField {
                field_name: "students".into(),
                target: "Student".into(),
            }];
            c
        };
        store.ensure_table("Class", &class).await.unwrap();
        store
            .ensure_relation_table("Class", "Student", "id", "id")
            .await
            .unwrap();
        store
            .ensure_orphan_trigger(
                "Student",
                "id",
                "class_student",
                "student_id",
                &[("class_student".into(), "student_id".into())],
            )
            .await
            .unwrap();

        store
            .insert("Class", &record(&[("id", JsonValue::String("201".into()))]))
            .await
            .unwrap();
        store
            .insert(
                "Student",
                &record(&[("id", JsonValue::String("201".into()))]),
            )
            .await
            .unwrap();
        store
            .insert(
                "class_student",
                &record(&[
                    ("class_id", JsonValue::String("201".into())),
                    ("student_id", JsonValue::String("201".into())),
                ]),
            )
            .await
            .unwrap();

        store
            .execute_raw("DELETE FROM \"class_student\" WHERE \"student_id\" = '201'")
            .await
            .unwrap();
        let gone = store
            .find_one(
                "Student",
                &record(&[("id", JsonValue::String("201".into()))]),
            )
            .await
            .unwrap();
        assert!(gone.is_none());
    }
}
