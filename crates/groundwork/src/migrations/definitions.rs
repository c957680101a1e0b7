//! Migration Definitions - Core types shared by discovery, state and runner

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::driver::LockRecord;
use crate::error::{DiscoveryError, DiscoveryResult};

/// Timestamp prefix format of migration ids
pub const ID_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{14})-([A-Za-z0-9_-]+)$").expect("static pattern compiles"));

/// Migration identifier: `<14-digit timestamp>-<slug>`.
///
/// Ordering is lexical on the full string, which matches timestamp order
/// because the prefix is fixed-width.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(String);

impl MigrationId {
    pub fn new(id: impl Into<String>) -> Self {
        MigrationId(id.into())
    }

    /// Build a well-formed id from a timestamp and slug
    pub fn generate(at: NaiveDateTime, slug: &str) -> DiscoveryResult<Self> {
        let id = MigrationId(format!("{}-{}", at.format(ID_TIMESTAMP_FORMAT), slug));
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the id against the naming convention
    pub fn validate(&self) -> DiscoveryResult<()> {
        self.parts().map(|_| ())
    }

    /// Timestamp encoded in the id prefix
    pub fn timestamp(&self) -> DiscoveryResult<NaiveDateTime> {
        self.parts().map(|(ts, _)| ts)
    }

    pub fn slug(&self) -> DiscoveryResult<&str> {
        self.parts().map(|(_, slug)| slug)
    }

    fn parts(&self) -> DiscoveryResult<(NaiveDateTime, &str)> {
        let malformed = |reason: &str| DiscoveryError::MalformedId {
            id: self.0.clone(),
            reason: reason.to_string(),
        };

        let captures = ID_PATTERN
            .captures(&self.0)
            .ok_or_else(|| malformed("expected <YYYYMMDDHHMMSS>-<slug>"))?;
        let (Some(ts), Some(slug)) = (captures.get(1), captures.get(2)) else {
            return Err(malformed("expected <YYYYMMDDHHMMSS>-<slug>"));
        };

        let timestamp = NaiveDateTime::parse_from_str(ts.as_str(), ID_TIMESTAMP_FORMAT)
            .map_err(|_| malformed("timestamp prefix is not a valid date"))?;

        Ok((timestamp, slug.as_str()))
    }
}

impl std::fmt::Display for MigrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MigrationId {
    fn from(id: &str) -> Self {
        MigrationId(id.to_string())
    }
}

impl From<String> for MigrationId {
    fn from(id: String) -> Self {
        MigrationId(id)
    }
}

impl AsRef<str> for MigrationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A user-supplied migration procedure, invoked with a backend handle
pub type UnitFn<H> =
    Arc<dyn for<'h> Fn(&'h mut H) -> BoxFuture<'h, anyhow::Result<()>> + Send + Sync>;

/// One ordered, reversible change-unit
pub struct MigrationUnit<H> {
    pub id: MigrationId,
    pub up: UnitFn<H>,
    pub down: UnitFn<H>,
}

impl<H> MigrationUnit<H> {
    /// Register a unit from two closures.
    ///
    /// ```ignore
    /// MigrationUnit::new(
    ///     "20240101000000-create-users",
    ///     |db: &mut SqlHandle| Box::pin(async move {
    ///         db.exec_raw("CREATE TABLE users (id INTEGER PRIMARY KEY)").await?;
    ///         Ok(())
    ///     }),
    ///     |db: &mut SqlHandle| Box::pin(async move {
    ///         db.exec_raw("DROP TABLE users").await?;
    ///         Ok(())
    ///     }),
    /// );
    /// ```
    pub fn new<U, D>(id: impl Into<MigrationId>, up: U, down: D) -> Self
    where
        U: for<'h> Fn(&'h mut H) -> BoxFuture<'h, anyhow::Result<()>> + Send + Sync + 'static,
        D: for<'h> Fn(&'h mut H) -> BoxFuture<'h, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            up: Arc::new(up),
            down: Arc::new(down),
        }
    }

    pub fn id(&self) -> &MigrationId {
        &self.id
    }

    /// Procedure for the given direction
    pub fn procedure(&self, direction: Direction) -> UnitFn<H> {
        match direction {
            Direction::Up => Arc::clone(&self.up),
            Direction::Down => Arc::clone(&self.down),
        }
    }
}

impl<H> Clone for MigrationUnit<H> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            up: Arc::clone(&self.up),
            down: Arc::clone(&self.down),
        }
    }
}

impl<H> std::fmt::Debug for MigrationUnit<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationUnit").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Persisted evidence that a unit is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: String,
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(id: impl Into<String>, applied_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            applied_at,
        }
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply units (run `up`)
    Up,
    /// Revert units (run `down`)
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// How far a run goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every pending unit (up) or every applied unit (down)
    All,
    /// At most this many units
    Count(usize),
    /// Up to and including this id (up), or down to and including it (down)
    Id(MigrationId),
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Planning,
    /// Index into the plan of the unit being applied
    Applying(usize),
    /// Index into the plan of the unit being reverted
    Reverting(usize),
    Completed,
    /// Index into the plan of the unit that failed
    Failed(usize),
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub direction: Direction,
    /// Units committed by this run, in execution order
    pub processed: Vec<MigrationId>,
    /// The run stopped early because cancellation was requested
    pub cancelled: bool,
    pub elapsed_ms: u128,
}

/// Applied and pending units as seen by the store
#[derive(Debug, Clone)]
pub struct Status {
    pub applied: Vec<MigrationRecord>,
    pub pending: Vec<MigrationId>,
    /// Pending units ordered before the latest applied one
    pub gaps: Vec<MigrationId>,
    pub lock: LockRecord,
}
