//! Storage backends
//!
//! `sql` covers relational stores through sqlx; `document` covers MongoDB
//! through the official driver. Both implement [`crate::driver::Driver`].

pub mod document;
pub mod sql;

use crate::error::DriverResult;
use crate::sql::validate_identifier;

pub use document::{Collection, DocumentDriver, DocumentDriverOptions, DocumentHandle, ObjectId};
pub use sql::{ExecResult, SqlDriver, SqlDriverOptions, SqlHandle};

/// Default name of the table (or collection) holding migration records
pub const DEFAULT_STATE_TABLE: &str = "groundwork_migrations";

/// Default name of the lock table (or collection)
pub const DEFAULT_LOCK_TABLE: &str = "groundwork_lock";

/// Names of the tables the engine owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTables {
    pub migrations: String,
    pub lock: String,
}

impl Default for StateTables {
    fn default() -> Self {
        Self {
            migrations: DEFAULT_STATE_TABLE.to_string(),
            lock: DEFAULT_LOCK_TABLE.to_string(),
        }
    }
}

impl StateTables {
    pub fn new(migrations: impl Into<String>, lock: impl Into<String>) -> Self {
        Self {
            migrations: migrations.into(),
            lock: lock.into(),
        }
    }

    /// Both names must be usable as SQL identifiers
    pub fn validate(&self) -> DriverResult<()> {
        validate_identifier(&self.migrations)?;
        validate_identifier(&self.lock)?;
        Ok(())
    }
}
