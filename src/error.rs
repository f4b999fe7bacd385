//! Engine-wide error kinds.
//!
//! Every public call in this crate fails with exactly one of these kinds.
//! Errors are never caught inside engine components; they unwind to the
//! procedure boundary (which rolls back) or to the caller of `parse`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed entity/field declaration, unknown relation target, missing
    /// primary key where one is required, duplicate entity name.
    #[error("schema error: {0}")]
    Schema(String),

    /// Typed-value construction exceeded precision/scale/max-length, or a
    /// `not null`/`unique` constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// Foreign-key or check failure surfaced from the store.
    #[error("constraint error: {0}")]
    Constraint(String),

    /// Nested begin, begin on a closed store, or commit/rollback without an
    /// open transaction.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Unresolved variable/alias/entity name, unparsable expression, or a
    /// missing procedure argument.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// I/O, connection, or serialization failure in a back end.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable kind tag, independent of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema(_) => "schema",
            Self::Validation(_) => "validation",
            Self::Constraint(_) => "constraint",
            Self::Transaction(_) => "transaction",
            Self::Resolution(_) => "resolution",
            Self::Storage(_) => "storage",
        }
    }

    /// Suggested HTTP status for web front ends mapping engine failures.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Schema(_) => 400,
            Self::Validation(_) => 400,
            Self::Resolution(_) => 400,
            Self::Constraint(_) => 409,
            Self::Transaction(_) => 500,
            Self::Storage(_) => 500,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {e}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(format!("i/o failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(EngineError::Schema("x".into()).kind(), "schema");
        assert_eq!(EngineError::Transaction("x".into()).kind(), "transaction");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(EngineError::Validation("v".into()).http_status(), 400);
        assert_eq!(EngineError::Constraint("c".into()).http_status(), 409);
        assert_eq!(EngineError::Storage("s".into()).http_status(), 500);
    }

    #[test]
    fn display_includes_kind_prefix() {
        let e = EngineError::Resolution("unknown alias 'item'".into());
        assert_eq!(e.to_string(), "resolution error: unknown alias 'item'");
    }
}
