//! Store configuration.

use std::time::Duration;

/// Transaction isolation mode for the relational back end.
///
/// SQLite spells these as `BEGIN {mode}`. `Exclusive` is the default: a
/// procedure holds the write lock from begin to commit/rollback, so a second
/// concurrent writer surfaces as a busy error instead of interleaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    Deferred,
    Immediate,
    Exclusive,
}

impl IsolationMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Deferred => "DEFERRED",
            Self::Immediate => "IMMEDIATE",
            Self::Exclusive => "EXCLUSIVE",
        }
    }

    fn from_env_value(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deferred" => Some(Self::Deferred),
            "immediate" => Some(Self::Immediate),
            "exclusive" => Some(Self::Exclusive),
            _ => None,
        }
    }
}

/// Configuration for a storage back end.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file path. `:memory:` opens a private in-memory store on the
    /// relational back end; the snapshot back end treats it as a file path.
    pub db_path: String,
    pub isolation: IsolationMode,
    pub busy_timeout: Duration,
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: std::env::var("PROSE_DB_PATH").unwrap_or_else(|_| ":memory:".to_string()),
            isolation: std::env::var("PROSE_DB_ISOLATION")
                .ok()
                .and_then(|s| IsolationMode::from_env_value(&s))
                .unwrap_or(IsolationMode::Exclusive),
            busy_timeout: std::env::var("PROSE_DB_BUSY_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(5)),
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    /// Config pointing at an explicit path, other settings defaulted.
    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    /// Private in-memory store, for tests and throwaway sessions.
    pub fn in_memory() -> Self {
        Self::at_path(":memory:")
    }
}
