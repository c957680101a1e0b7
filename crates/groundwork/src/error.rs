//! Error types for the migration engine
//!
//! Each layer owns its error enum; higher layers wrap lower ones so a caller
//! can always tell which stage of a run failed.

use crate::migrations::definitions::Direction;

/// Result type alias for templating operations
pub type TemplatingResult<T> = Result<T, TemplatingError>;

/// Result type alias for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Result type alias for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Result type alias for state store operations
pub type StateResult<T> = Result<T, StateStoreError>;

/// Result type alias for runner operations
pub type RunResult<T> = Result<T, RunnerError>;

/// Errors raised while building a parameterized query
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplatingError {
    #[error("Template arity mismatch: {fragments} fragments for {values} values (expected {expected})")]
    ArityMismatch {
        fragments: usize,
        values: usize,
        expected: usize,
    },

    #[error("Value cannot be bound safely: {0}")]
    UnsafeValue(String),
}

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Cannot establish or lost the connection. Callers may retry with backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed operation or constraint violation. Never retried.
    #[error("Query error: {0}")]
    Query(String),

    /// The transaction was rolled back.
    #[error("Transaction aborted: {0}")]
    TransactionAbort(String),
}

impl DriverError {
    /// Whether a caller may reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Connection(_))
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => DriverError::Connection(err.to_string()),
            other => DriverError::Query(other.to_string()),
        }
    }
}

impl From<mongodb::error::Error> for DriverError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => DriverError::Connection(err.to_string()),
            ErrorKind::Transaction { .. } => DriverError::TransactionAbort(err.to_string()),
            _ => DriverError::Query(err.to_string()),
        }
    }
}

impl From<bson::ser::Error> for DriverError {
    fn from(err: bson::ser::Error) -> Self {
        DriverError::Query(format!("Serialization error: {}", err))
    }
}

impl From<bson::de::Error> for DriverError {
    fn from(err: bson::de::Error) -> Self {
        DriverError::Query(format!("Deserialization error: {}", err))
    }
}

impl From<TemplatingError> for DriverError {
    fn from(err: TemplatingError) -> Self {
        DriverError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Query(format!("Serialization error: {}", err))
    }
}

/// Errors raised while enumerating migration units
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Duplicate migration id: {0}")]
    DuplicateId(String),

    #[error("Malformed migration id '{id}': {reason}")]
    MalformedId { id: String, reason: String },

    #[error("Failed to read migrations from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid migration script {path}: {reason}")]
    Script { path: String, reason: String },
}

/// Errors raised by the migration state store
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Run lock is held by {holder}")]
    LockContention { holder: String },

    #[error("Corrupt migration state: {0}")]
    CorruptRecord(String),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors surfaced by a migration run
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Migration {id} failed during {direction}: {cause:#}")]
    UnitFailed {
        id: String,
        direction: Direction,
        /// Units committed earlier in the same run
        completed: Vec<String>,
        cause: anyhow::Error,
    },

    #[error("Another migration run is in progress (lock held by {holder})")]
    RunInProgress { holder: String },

    #[error("Migration {0} does not exist")]
    TargetNotFound(String),

    #[error("Migration {0} is not applied")]
    NotApplied(String),

    #[error("Pending migrations {pending:?} are ordered before the latest applied migration {latest}")]
    OutOfOrder { pending: Vec<String>, latest: String },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    StateStore(StateStoreError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<StateStoreError> for RunnerError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::LockContention { holder } => RunnerError::RunInProgress { holder },
            StateStoreError::Driver(e) => RunnerError::Driver(e),
            other => RunnerError::StateStore(other),
        }
    }
}

impl RunnerError {
    /// Id of the unit that failed, if the run stopped on a unit
    pub fn failed_unit(&self) -> Option<&str> {
        match self {
            RunnerError::UnitFailed { id, .. } => Some(id),
            _ => None,
        }
    }
}
