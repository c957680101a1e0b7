//! Driver Abstraction
//!
//! A [`Driver`] owns the connection to one data store and hands out
//! [`Handle`]s bound to a single execution context. Handles expose the
//! backend's native surface (see the concrete types in
//! [`crate::backends`]) plus the shared capability the engine itself needs:
//! raw script execution, migration record access and the run lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DriverResult;
use crate::migrations::definitions::MigrationRecord;

/// Which family of store a driver talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Sql,
    Document,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Sql => write!(f, "sql"),
            DriverKind::Document => write!(f, "document"),
        }
    }
}

/// What a backend can guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Commit/rollback cover every write a unit can make, schema changes
    /// included; a failed unit leaves nothing behind
    pub supports_atomicity: bool,
}

/// A migration record exactly as persisted by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub applied_at: String,
}

/// Current contents of the lock storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked: bool,
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Outcome of a compare-and-set on the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Held(LockRecord),
}

/// Capability shared by every backend handle
#[async_trait]
pub trait Handle: Send {
    /// Execute a backend-native script (SQL statements or a JSON command list)
    async fn exec_raw(&mut self, script: &str) -> DriverResult<()>;

    /// All migration records, in storage order
    async fn applied_records(&mut self) -> DriverResult<Vec<StoredRecord>>;

    async fn insert_record(&mut self, record: &MigrationRecord) -> DriverResult<()>;

    /// Returns false when no record with that id existed
    async fn delete_record(&mut self, id: &str) -> DriverResult<bool>;

    /// Set the lock if and only if it is currently unset
    async fn try_lock(&mut self, holder: &str, at: DateTime<Utc>) -> DriverResult<LockAttempt>;

    /// Clear the lock if `holder` owns it. Returns false otherwise.
    async fn unlock(&mut self, holder: &str) -> DriverResult<bool>;

    /// Clear the lock regardless of holder
    async fn force_unlock(&mut self) -> DriverResult<()>;

    async fn lock_state(&mut self) -> DriverResult<LockRecord>;
}

/// A connection to one data store
#[async_trait]
pub trait Driver: Clone + Send + Sync + 'static {
    type Handle: Handle;

    /// File extension of script-based migrations for this backend
    const SCRIPT_EXTENSION: &'static str;

    fn kind(&self) -> DriverKind;

    fn capabilities(&self) -> Capabilities;

    /// Create the state and lock storage if missing
    async fn prepare(&self) -> DriverResult<()>;

    /// A handle whose writes take effect immediately
    async fn handle(&self) -> DriverResult<Self::Handle>;

    /// A handle bound to a new transaction (where the backend has them)
    async fn begin(&self) -> DriverResult<Self::Handle>;

    async fn commit(&self, handle: Self::Handle) -> DriverResult<()>;

    async fn rollback(&self, handle: Self::Handle) -> DriverResult<()>;

    async fn close(&self) -> DriverResult<()>;
}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
///
/// The error of `f` is propagated unchanged. A failed rollback is logged and
/// does not replace the original error. On backends without atomicity the
/// rollback is a no-op and earlier writes of `f` remain.
pub async fn with_transaction<D, F, R>(driver: &D, f: F) -> anyhow::Result<R>
where
    D: Driver,
    F: for<'h> FnOnce(&'h mut D::Handle) -> BoxFuture<'h, anyhow::Result<R>>,
    R: Send,
{
    let mut handle = driver.begin().await?;

    match f(&mut handle).await {
        Ok(result) => {
            driver.commit(handle).await?;
            debug!("Transaction committed");
            Ok(result)
        }
        Err(e) => {
            if !driver.capabilities().supports_atomicity {
                warn!(
                    "{} backend cannot fully roll back; writes made before the failure may remain",
                    driver.kind()
                );
            }
            if let Err(rollback_err) = driver.rollback(handle).await {
                warn!("Rollback failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}
