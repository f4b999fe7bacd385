//! prose-db: a declarative persistence engine.
//!
//! A single source text declares entity types (with typed fields,
//! uniqueness constraints, many-to-many relations, and life-cycle
//! ownership) and transactional procedures over them in a
//! natural-language-like vocabulary. `Engine::parse` compiles the schema
//! into physical tables, junction tables, and orphan-removal triggers on
//! the configured back end; afterwards every compiled procedure is callable
//! through `Engine::invoke` and runs as one ACID transaction.
//!
//! Two back ends share the storage contract: a relational SQLite store
//! (exclusive transactions, cascade-delete junctions, trigger-based orphan
//! GC) and a JSON snapshot store (in-memory with shadow-copy transactions,
//! no orphan GC).

pub mod config;
pub mod dsl;
pub mod engine;
pub mod entity;
pub mod error;
pub mod schema;
pub mod storage;
pub mod value;

// Re-export the commonly used types
pub use config::{IsolationMode, StoreConfig};
pub use engine::Engine;
pub use entity::{Entity, RelationLoader, SharedEntity};
pub use error::{EngineError, Result};
pub use schema::{EntityDef, FieldDef, FieldKind, SchemaSet};
pub use storage::{RawRecord, SnapshotStore, SqliteStore, StorageAdapter};
pub use value::{CmpOp, Value};
