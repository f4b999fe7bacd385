//! In-memory row instances.
//!
//! An `Entity` pairs a declared type with one row's raw data. Scalar reads
//! wrap the current raw datum freshly; relation reads go through a lazy
//! loader exactly once per slot, with concurrent readers sharing the
//! in-flight load. Serialization covers declared fields plus relations that
//! have already been materialized — an unread relation never appears.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::{OnceCell, RwLock};

use crate::error::{EngineError, Result};
use crate::schema::types::EntityDef;
use crate::storage::RawRecord;
use crate::value::Value;

pub type SharedEntity = Arc<RwLock<Entity>>;

/// A resolved relation: a list of target rows, or null when the junction
/// held nothing usable.
pub type RelationList = Option<Vec<SharedEntity>>;

/// Capability handed to an entity for fetching its relation targets. The
/// engine implements this over the junction tables; every loaded target
/// receives the same capability so traversal is transitive.
#[async_trait]
pub trait RelationLoader: Send + Sync {
    async fn load(&self, source: &EntityDef, field: &str, pk: &JsonValue) -> Result<RelationList>;
}

pub struct Entity {
    def: Arc<EntityDef>,
    data: RawRecord,
    /// One slot per declared relation. The cell starts empty, holds the
    /// in-flight load while it runs, and afterwards the resolved list; a
    /// failed load leaves it empty again.
    relations: HashMap<String, Arc<OnceCell<RelationList>>>,
    loader: Option<Arc<dyn RelationLoader>>,
    dirty: bool,
}

impl Entity {
    pub fn new(def: Arc<EntityDef>, data: RawRecord, loader: Option<Arc<dyn RelationLoader>>) -> Self {
        let relations = def
            .relations
            .iter()
            .map(|r| (r.field_name.clone(), Arc::new(OnceCell::new())))
            .collect();
        Self {
            def,
            data,
            relations,
            loader,
            dirty: false,
        }
    }

    pub fn into_shared(self) -> SharedEntity {
        Arc::new(RwLock::new(self))
    }

    pub fn def(&self) -> &EntityDef {
        &self.def
    }

    pub fn data(&self) -> &RawRecord {
        &self.data
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Raw primary-key value of this row.
    pub fn pk_raw(&self) -> Result<JsonValue> {
        let pk = self.def.primary_field().ok_or_else(|| {
            EngineError::Schema(format!("entity '{}' has no [primary] field", self.def.name))
        })?;
        Ok(self.data.get(&pk.name).cloned().unwrap_or(JsonValue::Null))
    }

    /// Read a scalar field as a freshly wrapped typed value; `None` for a
    /// null datum. Relation fields are read with [`Entity::relation`].
    pub fn get(&self, field: &str) -> Result<Option<Value>> {
        if self.def.relation(field).is_some() {
            return Err(EngineError::Resolution(format!(
                "'{}' is a relation field of '{}'",
                field, self.def.name
            )));
        }
        let def = self.def.field(field).ok_or_else(|| {
            EngineError::Resolution(format!(
                "entity '{}' has no field '{}'",
                self.def.name, field
            ))
        })?;
        match self.data.get(field) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(raw) => def.kind.wrap_raw(raw).map(Some),
        }
    }

    /// Read a relation, loading it on first access. The slot caches the
    /// in-flight load, so concurrent readers of the same relation share one
    /// fetch; a failed load clears the slot and surfaces the error.
    pub async fn relation(&self, field: &str) -> Result<RelationList> {
        let relation = self.def.relation(field).ok_or_else(|| {
            EngineError::Resolution(format!(
                "entity '{}' has no relation '{}'",
                self.def.name, field
            ))
        })?;
        let cell = self
            .relations
            .get(field)
            .expect("slot exists for every declared relation")
            .clone();
        let loader = self.loader.clone().ok_or_else(|| {
            EngineError::Resolution(format!(
                "relation '{}' of '{}' has no loader attached",
                relation.field_name, self.def.name
            ))
        })?;
        let pk = self.pk_raw()?;
        let def = self.def.clone();
        let field_name = relation.field_name.clone();
        let loaded = cell
            .get_or_try_init(|| async move { loader.load(&def, &field_name, &pk).await })
            .await?;
        Ok(loaded.clone())
    }

    /// The resolved list if this relation has already been materialized.
    pub fn materialized(&self, field: &str) -> Option<&RelationList> {
        self.relations.get(field).and_then(|cell| cell.get())
    }

    /// Write a scalar field. The value is coerced to the declared kind
    /// (which revalidates constraints) and stored in raw form; the raw form
    /// is returned so the caller can mirror the write to storage.
    pub fn set(&mut self, field: &str, value: &Value) -> Result<JsonValue> {
        if self.def.relation(field).is_some() {
            return Err(EngineError::Resolution(format!(
                "cannot assign relation field '{}' of '{}'",
                field, self.def.name
            )));
        }
        let def = self.def.field(field).ok_or_else(|| {
            EngineError::Resolution(format!(
                "entity '{}' has no field '{}'",
                self.def.name, field
            ))
        })?;
        let coerced = def.kind.wrap_raw(&value.to_raw())?;
        let raw = coerced.to_raw();
        self.data.insert(field.to_string(), raw.clone());
        self.dirty = true;
        Ok(raw)
    }

    /// Serialize to a plain tree: every declared field in raw form, plus
    /// every already-materialized relation, recursively. Unresolved slots
    /// are omitted; `visited` guards against relation cycles.
    pub fn to_tree(&self, visited: &mut HashSet<usize>) -> JsonValue {
        let mut out = Map::new();
        for field in &self.def.fields {
            let raw = self.data.get(&field.name).cloned().unwrap_or(JsonValue::Null);
            out.insert(field.name.clone(), raw);
        }
        for relation in &self.def.relations {
            let Some(resolved) = self.materialized(&relation.field_name) else {
                continue;
            };
            match resolved {
                None => {
                    out.insert(relation.field_name.clone(), JsonValue::Null);
                }
                Some(list) => {
                    let mut items = Vec::new();
                    for shared in list {
                        let ptr = Arc::as_ptr(shared) as usize;
                        if !visited.insert(ptr) {
                            continue;
                        }
                        if let Ok(guard) = shared.try_read() {
                            items.push(guard.to_tree(visited));
                        }
                    }
                    out.insert(relation.field_name.clone(), JsonValue::Array(items));
                }
            }
        }
        JsonValue::Object(out)
    }
}

/// Serialize a shared entity from outside its lock.
pub async fn shared_to_tree(shared: &SharedEntity) -> JsonValue {
    let mut visited = HashSet::new();
    visited.insert(Arc::as_ptr(shared) as usize);
    let guard = shared.read().await;
    guard.to_tree(&mut visited)
}
