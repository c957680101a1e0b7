//! Project configuration loaded from `groundwork.toml`

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backends::{
    DocumentDriverOptions, SqlDriverOptions, StateTables, DEFAULT_LOCK_TABLE, DEFAULT_STATE_TABLE,
};
use crate::driver::DriverKind;

/// File name searched for by [`GroundworkConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "groundwork.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("No {} found in {} or any parent directory", CONFIG_FILE_NAME, .0.display())]
    NotFound(PathBuf),

    #[error("No database named '{0}' is configured")]
    UnknownDatabase(String),

    #[error("Several databases are configured ({}); choose one explicitly", .0.join(", "))]
    AmbiguousDatabase(Vec<String>),

    #[error("Database '{name}' has no usable url: {reason}")]
    MissingUrl { name: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundworkConfig {
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    /// Directory of the file this was loaded from; relative paths resolve
    /// against it
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub kind: DriverKind,
    pub url: Option<String>,
    pub url_env: Option<String>,
    /// Document stores only: database to migrate when the URL names none
    pub database: Option<String>,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: String,
    #[serde(default = "default_state_table")]
    pub state_table: String,
    #[serde(default = "default_lock_table")]
    pub lock_table: String,
    #[serde(default)]
    pub allow_out_of_order: bool,
    pub unit_timeout_secs: Option<u64>,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_migrations_dir() -> String {
    "migrations".to_string()
}

fn default_state_table() -> String {
    DEFAULT_STATE_TABLE.to_string()
}

fn default_lock_table() -> String {
    DEFAULT_LOCK_TABLE.to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl GroundworkConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(content).map_err(|e| e.to_string())?;

        let mut seen = std::collections::HashSet::new();
        for db in &config.databases {
            if !seen.insert(db.name.as_str()) {
                return Err(format!("database '{}' is defined more than once", db.name));
            }
        }
        Ok(config)
    }

    /// Walk up from `start` to the first directory containing `groundwork.toml`
    pub fn discover(start: impl AsRef<Path>) -> ConfigResult<Self> {
        let start = start.as_ref();
        let found = start
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file());

        match found {
            Some(path) => Self::load(path),
            None => Err(ConfigError::NotFound(start.to_path_buf())),
        }
    }

    /// [`GroundworkConfig::discover`] from the working directory
    pub fn find() -> ConfigResult<Self> {
        let cwd = env::current_dir().map_err(|source| ConfigError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        Self::discover(cwd)
    }

    /// The named database, or the only one when `name` is `None`
    pub fn select(&self, name: Option<&str>) -> ConfigResult<&DatabaseConfig> {
        match name {
            Some(name) => self
                .databases
                .iter()
                .find(|db| db.name == name)
                .ok_or_else(|| ConfigError::UnknownDatabase(name.to_string())),
            None => match self.databases.as_slice() {
                [only] => Ok(only),
                [] => Err(ConfigError::UnknownDatabase("<none configured>".to_string())),
                many => Err(ConfigError::AmbiguousDatabase(
                    many.iter().map(|db| db.name.clone()).collect(),
                )),
            },
        }
    }

    /// Migrations directory of `db`, resolved against the config location
    pub fn migrations_path(&self, db: &DatabaseConfig) -> PathBuf {
        self.root.join(&db.migrations_dir)
    }
}

impl DatabaseConfig {
    /// `url` if set, otherwise the value of the `url_env` variable
    pub fn resolve_url(&self) -> ConfigResult<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let missing = |reason: String| ConfigError::MissingUrl {
            name: self.name.clone(),
            reason,
        };
        match &self.url_env {
            Some(var) => env::var(var).map_err(|_| missing(format!("environment variable {} is not set", var))),
            None => Err(missing("neither url nor url_env is set".to_string())),
        }
    }

    pub fn state_tables(&self) -> StateTables {
        StateTables::new(&self.state_table, &self.lock_table)
    }

    pub fn sql_options(&self) -> SqlDriverOptions {
        SqlDriverOptions {
            max_connections: self.pool.max_connections,
            acquire_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            tables: self.state_tables(),
        }
    }

    pub fn document_options(&self) -> DocumentDriverOptions {
        DocumentDriverOptions {
            database: self.database.clone(),
            tables: self.state_tables(),
        }
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[[databases]]
name = "app"
kind = "sql"
url = "sqlite://app.db"
unit_timeout_secs = 120

[databases.pool]
max_connections = 2

[[databases]]
name = "events"
kind = "document"
url_env = "GROUNDWORK_TEST_EVENTS_URL_UNSET"
database = "events"
migrations_dir = "events/migrations"
state_table = "event_migrations"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = GroundworkConfig::parse(SAMPLE).unwrap();
        let app = config.select(Some("app")).unwrap();
        assert_eq!(app.kind, DriverKind::Sql);
        assert_eq!(app.migrations_dir, "migrations");
        assert_eq!(app.lock_table, DEFAULT_LOCK_TABLE);
        assert_eq!(app.pool.max_connections, 2);
        assert_eq!(app.pool.acquire_timeout_secs, 30);
        assert_eq!(app.unit_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(app.resolve_url().unwrap(), "sqlite://app.db");

        let events = config.select(Some("events")).unwrap();
        assert_eq!(events.kind, DriverKind::Document);
        assert_eq!(events.state_tables().migrations, "event_migrations");
        let options = events.document_options();
        assert_eq!(options.database.as_deref(), Some("events"));
        assert_eq!(options.tables.lock, DEFAULT_LOCK_TABLE);
        assert_eq!(app.database, None);
        assert!(!events.allow_out_of_order);
    }

    #[test]
    fn test_selection() {
        let config = GroundworkConfig::parse(SAMPLE).unwrap();
        assert!(matches!(config.select(None), Err(ConfigError::AmbiguousDatabase(names)) if names.len() == 2));
        assert!(matches!(config.select(Some("nope")), Err(ConfigError::UnknownDatabase(_))));

        let single = GroundworkConfig::parse("[[databases]]\nname = \"only\"\nkind = \"document\"\nurl = \"mongodb://localhost/only\"\n").unwrap();
        assert_eq!(single.select(None).unwrap().name, "only");
    }

    #[test]
    fn test_missing_url() {
        let config = GroundworkConfig::parse(SAMPLE).unwrap();
        let events = config.select(Some("events")).unwrap();
        assert!(matches!(events.resolve_url(), Err(ConfigError::MissingUrl { .. })));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(GroundworkConfig::parse("[[databases]]\nname = \"x\"\nkind = \"graph\"\n").is_err());
        let dup = "[[databases]]\nname = \"x\"\nkind = \"sql\"\n[[databases]]\nname = \"x\"\nkind = \"sql\"\n";
        assert!(GroundworkConfig::parse(dup).unwrap_err().contains("more than once"));
    }

    #[test]
    fn test_discover_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), SAMPLE).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = GroundworkConfig::discover(&nested).unwrap();
        assert_eq!(config.root, dir.path());
        let events = config.select(Some("events")).unwrap();
        assert_eq!(config.migrations_path(events), dir.path().join("events/migrations"));
    }

    #[test]
    fn test_discover_not_found() {
        let dir = TempDir::new().unwrap();
        // a stray groundwork.toml above the temp dir would make this flaky
        if dir.path().ancestors().skip(1).any(|d| d.join(CONFIG_FILE_NAME).is_file()) {
            return;
        }
        assert!(matches!(GroundworkConfig::discover(dir.path()), Err(ConfigError::NotFound(_))));
    }
}
