//! Storage back ends.
//!
//! Two interchangeable stores implement one adapter contract: a relational
//! SQLite store and a JSON snapshot store. The engine and the schema
//! ingester talk only to the trait; back-end differences (orphan triggers,
//! constraint enforcement) are documented per operation.

pub mod snapshot;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::schema::types::EntityDef;

pub use snapshot::SnapshotStore;
pub use sqlite::SqliteStore;

/// A stored row (or criteria/update fragment) in raw form: decimals and
/// datetimes as text, bools as 0/1, strings as text.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// Columns of one orphan-GC check: `(junction_table, owned_id_column)`.
pub type OrphanCheck = (String, String);

/// The adapter contract shared by every back end.
///
/// Callers serialize through one adapter instance per transaction scope;
/// each method is a single logical operation.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Open or create the store.
    async fn init(&mut self) -> Result<()>;

    /// Flush and finalize. The adapter must not be used afterwards.
    async fn close(&mut self) -> Result<()>;

    /// Idempotently create the physical table for an entity.
    async fn ensure_table(&mut self, name: &str, def: &EntityDef) -> Result<()>;

    /// Idempotently create the junction table between two entities. The
    /// table name and column ordering are case-insensitive lexicographic by
    /// entity name regardless of argument order.
    async fn ensure_relation_table(
        &mut self,
        e1: &str,
        e2: &str,
        pk1: &str,
        pk2: &str,
    ) -> Result<()>;

    /// Install the orphan-removal trigger for one owner junction. Back ends
    /// without trigger support treat this as a no-op and document that
    /// orphan GC is unavailable.
    async fn ensure_orphan_trigger(
        &mut self,
        target_entity: &str,
        target_pk: &str,
        trigger_table: &str,
        target_id_col: &str,
        all_checks: &[OrphanCheck],
    ) -> Result<()>;

    /// First row matching all criteria by equality, if any.
    async fn find_one(&mut self, table: &str, criteria: &RawRecord) -> Result<Option<RawRecord>>;

    /// All rows matching all criteria by equality.
    async fn find(&mut self, table: &str, criteria: &RawRecord) -> Result<Vec<RawRecord>>;

    /// Insert one raw record, enforcing declared constraints.
    async fn insert(&mut self, table: &str, record: &RawRecord) -> Result<()>;

    /// Update at most one row matching the criteria.
    async fn update(
        &mut self,
        table: &str,
        criteria: &RawRecord,
        updates: &RawRecord,
    ) -> Result<()>;

    /// Start an exclusive write transaction. Nested begins fail with
    /// `TransactionError`.
    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
