//! Engine lifecycle and public surface.
//!
//! An `Engine` owns one storage adapter and carries the product of `parse`:
//! the schema set, the relation registry, and the compiled procedure table,
//! all immutable once parsing succeeds. Procedures are the only runtime
//! entry point; each `invoke` runs as one adapter transaction. The engine
//! is an ordinary object with an explicit `parse → invoke* → close`
//! lifecycle, never a process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::StoreConfig;
use crate::dsl::ast::ProcedureDef;
use crate::dsl::evaluator::Executor;
use crate::dsl::parser as procedure_parser;
use crate::error::{EngineError, Result};
use crate::schema::parser as schema_parser;
use crate::schema::types::SchemaSet;
use crate::storage::{SnapshotStore, SqliteStore, StorageAdapter};

pub struct Engine {
    adapter: Arc<Mutex<dyn StorageAdapter>>,
    schema: Arc<SchemaSet>,
    procedures: HashMap<String, ProcedureDef>,
}

impl Engine {
    /// Open an engine over any adapter. The store is initialized here.
    pub async fn new(adapter: impl StorageAdapter + 'static) -> Result<Self> {
        let adapter: Arc<Mutex<dyn StorageAdapter>> = Arc::new(Mutex::new(adapter));
        adapter.lock().await.init().await?;
        Ok(Self {
            adapter,
            schema: Arc::new(SchemaSet::default()),
            procedures: HashMap::new(),
        })
    }

    /// Engine over the relational SQLite back end.
    pub async fn open_sqlite(config: StoreConfig) -> Result<Self> {
        Self::new(SqliteStore::new(config)).await
    }

    /// Engine over the JSON snapshot back end.
    pub async fn open_snapshot(config: StoreConfig) -> Result<Self> {
        Self::new(SnapshotStore::new(config)).await
    }

    /// Ingest one source text: schema blocks synthesize physical tables,
    /// junctions and orphan triggers; procedure blocks compile to
    /// statement trees. On any failure the engine's parsed state is left
    /// unchanged.
    pub async fn parse(&mut self, source: &str) -> Result<()> {
        let ingested = {
            let mut guard = self.adapter.lock().await;
            schema_parser::ingest(source, &mut *guard).await?
        };
        let mut procedures = HashMap::new();
        for raw in &ingested.procedures {
            if procedures.contains_key(&raw.name) {
                return Err(EngineError::Schema(format!(
                    "duplicate procedure name '{}'",
                    raw.name
                )));
            }
            procedures.insert(raw.name.clone(), procedure_parser::compile(raw)?);
        }
        self.schema = Arc::new(ingested.schema);
        self.procedures = procedures;
        info!(procedures = self.procedures.len(), "source parsed");
        Ok(())
    }

    /// Invoke a compiled procedure with a mapping of arguments. Entity
    /// results arrive as serialized trees, lists per element, scalars in
    /// raw form.
    pub async fn invoke(
        &self,
        name: &str,
        args: serde_json::Map<String, JsonValue>,
    ) -> Result<JsonValue> {
        let def = self.procedures.get(name).ok_or_else(|| {
            EngineError::Resolution(format!("unknown procedure '{name}'"))
        })?;
        Executor::new(self.adapter.clone(), self.schema.clone())
            .invoke(def, &args)
            .await
    }

    pub fn procedure_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn schema(&self) -> &SchemaSet {
        &self.schema
    }

    /// Direct adapter access, for seeding and inspection outside any
    /// procedure.
    pub fn adapter(&self) -> Arc<Mutex<dyn StorageAdapter>> {
        self.adapter.clone()
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.lock().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args(pairs: &[(&str, JsonValue)]) -> serde_json::Map<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    const SOURCE: &str = "\
Item {
    number:id [primary]
    str[50]:name
    number[10.2]:price (0.00)
}

CreateItem(number:id, str[50]:name, number:price):
    Create a Item with id of {id} and name of {name} and price of {price} as item
    return {item}

Classify(number:val):
    If {val} is greater than 10:
        return \"High\"
    If {val} is less than 5:
        return \"Low\"
    return \"Medium\"
";

    #[tokio::test]
    async fn parse_exposes_procedures() {
        let mut engine = Engine::open_snapshot(StoreConfig::in_memory()).await.unwrap();
        engine.parse(SOURCE).await.unwrap();
        assert_eq!(engine.procedure_names(), vec!["Classify", "CreateItem"]);
        assert!(engine.schema().entity("item").is_some());
    }

    #[tokio::test]
    async fn invoke_returns_serialized_entity() {
        let mut engine = Engine::open_snapshot(StoreConfig::in_memory()).await.unwrap();
        engine.parse(SOURCE).await.unwrap();
        let tree = engine
            .invoke(
                "CreateItem",
                args(&[
                    ("id", json!(1)),
                    ("name", json!("Sword")),
                    ("price", json!("100.50")),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(tree["price"], json!("100.50"));
        assert_eq!(tree["name"], json!("Sword"));
    }

    #[tokio::test]
    async fn if_else_fallthrough() {
        let mut engine = Engine::open_snapshot(StoreConfig::in_memory()).await.unwrap();
        engine.parse(SOURCE).await.unwrap();
        for (input, expected) in [(20, "High"), (2, "Low"), (7, "Medium")] {
            let out = engine
                .invoke("Classify", args(&[("val", json!(input))]))
                .await
                .unwrap();
            assert_eq!(out, json!(expected));
        }
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_procedure_is_resolution_error() {
        let engine = Engine::open_snapshot(StoreConfig::in_memory()).await.unwrap();
        let err = engine.invoke("Nope", args(&[])).await.unwrap_err();
        assert_eq!(err.kind(), "resolution");
    }

    #[tokio::test]
    async fn failed_parse_leaves_engine_unchanged() {
        let mut engine = Engine::open_snapshot(StoreConfig::in_memory()).await.unwrap();
        engine.parse(SOURCE).await.unwrap();
        let err = engine.parse("Weird {\n  blob:x\n}\n").await.unwrap_err();
        assert_eq!(err.kind(), "schema");
        // The previously parsed procedures are still live.
        assert_eq!(engine.procedure_names(), vec!["Classify", "CreateItem"]);
    }
}
