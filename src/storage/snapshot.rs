//! JSON snapshot back end.
//!
//! The whole store is one document: `data` maps each table to its rows in
//! raw form, `schemas` echoes the field definitions so constraints are
//! re-enforced after a restart. Everything operates in memory; the document
//! is written out on commit and on close. Transactions deep-copy the data
//! tree to a shadow and restore it on rollback.
//!
//! This back end has no triggers: `ensure_orphan_trigger` is a no-op and
//! orphan GC is not available here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::{OrphanCheck, RawRecord, StorageAdapter};
use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use crate::schema::types::{junction_table_name, EntityDef};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JunctionSpec {
    left_col: String,
    right_col: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    data: BTreeMap<String, Vec<RawRecord>>,
    schemas: BTreeMap<String, EntityDef>,
    #[serde(default)]
    junctions: BTreeMap<String, JunctionSpec>,
}

pub struct SnapshotStore {
    config: StoreConfig,
    open: bool,
    data: BTreeMap<String, Vec<RawRecord>>,
    schemas: BTreeMap<String, EntityDef>,
    junctions: BTreeMap<String, JunctionSpec>,
    shadow: Option<BTreeMap<String, Vec<RawRecord>>>,
}

impl SnapshotStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            open: false,
            data: BTreeMap::new(),
            schemas: BTreeMap::new(),
            junctions: BTreeMap::new(),
            shadow: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreConfig::in_memory())
    }

    fn ephemeral(&self) -> bool {
        self.config.db_path == ":memory:"
    }

    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(EngineError::Storage("store is not open".into()))
        }
    }

    async fn persist(&self) -> Result<()> {
        if self.ephemeral() {
            return Ok(());
        }
        let doc = SnapshotDocument {
            data: self.data.clone(),
            schemas: self.schemas.clone(),
            junctions: self.junctions.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        tokio::fs::write(&self.config.db_path, bytes).await?;
        debug!(path = %self.config.db_path, "snapshot written");
        Ok(())
    }

    fn rows(&self, table: &str) -> Result<&Vec<RawRecord>> {
        self.data
            .get(table)
            .ok_or_else(|| EngineError::Storage(format!("no such table '{table}'")))
    }

    fn matches(row: &RawRecord, criteria: &RawRecord) -> bool {
        criteria
            .iter()
            .all(|(k, v)| row.get(k).unwrap_or(&JsonValue::Null) == v)
    }

    /// Snapshot-side constraint enforcement: kind tags, `not null`,
    /// `unique`, and primary-key uniqueness.
    fn validate_insert(&self, table: &str, record: &RawRecord) -> Result<()> {
        if let Some(def) = self.schemas.get(table) {
            for field in &def.fields {
                let value = record.get(&field.name).unwrap_or(&JsonValue::Null);
                if value.is_null() {
                    if field.not_null {
                        return Err(EngineError::Validation(format!(
                            "{}.{} may not be null",
                            table, field.name
                        )));
                    }
                    continue;
                }
                field.kind.wrap_raw(value)?;
                if field.unique || field.primary {
                    let taken = self
                        .rows(table)?
                        .iter()
                        .any(|row| row.get(&field.name) == Some(value));
                    if taken {
                        return Err(EngineError::Validation(format!(
                            "{}.{} value {} is already taken",
                            table, field.name, value
                        )));
                    }
                }
            }
        } else if let Some(spec) = self.junctions.get(table) {
            for col in [&spec.left_col, &spec.right_col] {
                if record.get(col).map_or(true, JsonValue::is_null) {
                    return Err(EngineError::Validation(format!(
                        "{table}.{col} may not be null"
                    )));
                }
            }
            let duplicate = self.rows(table)?.iter().any(|row| {
                row.get(&spec.left_col) == record.get(&spec.left_col)
                    && row.get(&spec.right_col) == record.get(&spec.right_col)
            });
            if duplicate {
                return Err(EngineError::Validation(format!(
                    "duplicate link in '{table}'"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageAdapter for SnapshotStore {
    async fn init(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        if !self.ephemeral() {
            match tokio::fs::read(&self.config.db_path).await {
                Ok(bytes) => {
                    let doc: SnapshotDocument = serde_json::from_slice(&bytes)?;
                    self.data = doc.data;
                    self.schemas = doc.schemas;
                    self.junctions = doc.junctions;
                    info!(
                        path = %self.config.db_path,
                        tables = self.data.len(),
                        "snapshot loaded"
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !self.config.create_if_missing {
                        return Err(EngineError::Storage(format!(
                            "snapshot '{}' does not exist",
                            self.config.db_path
                        )));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.persist().await?;
            self.open = false;
            self.shadow = None;
            debug!("snapshot store closed");
        }
        Ok(())
    }

    async fn ensure_table(&mut self, name: &str, def: &EntityDef) -> Result<()> {
        self.check_open()?;
        self.schemas.insert(name.to_string(), def.clone());
        self.data.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn ensure_relation_table(
        &mut self,
        e1: &str,
        e2: &str,
        pk1: &str,
        pk2: &str,
    ) -> Result<()> {
        self.check_open()?;
        let ((first, first_pk), (second, second_pk)) = if e1.to_lowercase() <= e2.to_lowercase() {
            ((e1, pk1), (e2, pk2))
        } else {
            ((e2, pk2), (e1, pk1))
        };
        let table = junction_table_name(first, second);
        self.junctions.insert(
            table.clone(),
            JunctionSpec {
                left_col: format!("{}_{}", first.to_lowercase(), first_pk),
                right_col: format!("{}_{}", second.to_lowercase(), second_pk),
            },
        );
        self.data.entry(table).or_default();
        Ok(())
    }

    async fn ensure_orphan_trigger(
        &mut self,
        target_entity: &str,
        _target_pk: &str,
        _trigger_table: &str,
        _target_id_col: &str,
        _all_checks: &[OrphanCheck],
    ) -> Result<()> {
        // No trigger machinery here; owned rows are not reclaimed.
        warn!(
            entity = %target_entity,
            "snapshot back end has no orphan GC; trigger request ignored"
        );
        Ok(())
    }

    async fn find_one(&mut self, table: &str, criteria: &RawRecord) -> Result<Option<RawRecord>> {
        self.check_open()?;
        Ok(self
            .rows(table)?
            .iter()
            .find(|row| Self::matches(row, criteria))
            .cloned())
    }

    async fn find(&mut self, table: &str, criteria: &RawRecord) -> Result<Vec<RawRecord>> {
        self.check_open()?;
        Ok(self
            .rows(table)?
            .iter()
            .filter(|row| Self::matches(row, criteria))
            .cloned()
            .collect())
    }

    async fn insert(&mut self, table: &str, record: &RawRecord) -> Result<()> {
        self.check_open()?;
        self.validate_insert(table, record)?;
        let mut record = record.clone();
        if self.junctions.contains_key(table) && !record.contains_key("create_time") {
            record.insert(
                "create_time".to_string(),
                JsonValue::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        self.data
            .get_mut(table)
            .ok_or_else(|| EngineError::Storage(format!("no such table '{table}'")))?
            .push(record);
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        criteria: &RawRecord,
        updates: &RawRecord,
    ) -> Result<()> {
        self.check_open()?;
        let rows = self
            .data
            .get_mut(table)
            .ok_or_else(|| EngineError::Storage(format!("no such table '{table}'")))?;
        if let Some(row) = rows.iter_mut().find(|row| Self::matches(row, criteria)) {
            for (k, v) in updates {
                row.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.check_open()
            .map_err(|_| EngineError::Transaction("store is not open".into()))?;
        if self.shadow.is_some() {
            return Err(EngineError::Transaction(
                "nested transactions are not supported".into(),
            ));
        }
        self.shadow = Some(self.data.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.shadow.take().is_none() {
            return Err(EngineError::Transaction(
                "commit without an open transaction".into(),
            ));
        }
        self.persist().await
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.shadow.take() {
            Some(shadow) => {
                self.data = shadow;
                Ok(())
            }
            None => Err(EngineError::Transaction(
                "rollback without an open transaction".into(),
            )),
        }
    }
}
