//! # groundwork: versioned migrations for relational and document stores
//!
//! Ordered, reversible change-units are discovered from code or from script
//! files, planned against the applied records kept in the target store, and
//! executed one at a time under a store-level run lock. Each unit and its
//! record commit together where the backend supports transactions.
//!
//! ```ignore
//! use groundwork::{sql, Migrator, MigrationUnit, SqlDriver, SqlHandle, Target};
//!
//! let driver = SqlDriver::connect("sqlite://app.db?mode=rwc").await?;
//! let units = vec![MigrationUnit::new(
//!     "20240101000000-create-users",
//!     |db: &mut SqlHandle| Box::pin(async move {
//!         db.exec_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").await?;
//!         db.exec(&sql!("INSERT INTO users (name) VALUES ({})", "admin")?).await?;
//!         Ok(())
//!     }),
//!     |db: &mut SqlHandle| Box::pin(async move {
//!         db.exec_raw("DROP TABLE users").await?;
//!         Ok(())
//!     }),
//! )];
//!
//! Migrator::new(driver, &units)?.up(Target::All).await?;
//! ```

pub mod backends;
pub mod config;
pub mod driver;
pub mod error;
pub mod migrations;
pub mod sql;

pub use backends::{
    Collection, DocumentDriver, DocumentDriverOptions, DocumentHandle, ExecResult, ObjectId, SqlDriver,
    SqlDriverOptions, SqlHandle, StateTables,
};
pub use bson::doc;
pub use config::{ConfigError, DatabaseConfig, GroundworkConfig};
pub use driver::{with_transaction, Capabilities, Driver, DriverKind, Handle, LockRecord};
pub use error::*;
pub use migrations::{
    create_migration, DirectorySource, Direction, HeadChange, MigrationId, MigrationObserver,
    MigrationRecord, MigrationSource, MigrationUnit, Migrator, RunReport, RunState, SilentObserver,
    Status, Target, TracingObserver,
};
pub use sql::{Ident, SqlArg, SqlDialect, SqlQuery, SqlValue};
