//! Migration System
//!
//! Discovery and ordering of change-units, the state store holding applied
//! records and the run lock, and the runner that drives them.

pub mod definitions;
pub mod discovery;
pub mod observer;
pub mod runner;
pub mod state;

pub use definitions::{
    Direction, MigrationId, MigrationRecord, MigrationUnit, RunReport, RunState, Status, Target,
    UnitFn, ID_TIMESTAMP_FORMAT,
};
pub use discovery::{create_migration, discover, DirectorySource, MigrationSource, MIGRATION_FILE_INFIX};
pub use observer::{MigrationObserver, SilentObserver, TracingObserver};
pub use runner::{HeadChange, Migrator};
pub use state::{default_holder_id, RunLock, StateStore};
