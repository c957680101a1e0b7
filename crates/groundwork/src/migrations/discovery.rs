//! Discovery & Ordering
//!
//! Turns a source of migration units into a strictly ordered, duplicate-free
//! list. Discovery never touches the data store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::definitions::{MigrationId, MigrationUnit};
use crate::driver::{Driver, Handle};
use crate::error::{DiscoveryError, DiscoveryResult};

/// Infix between the id and the extension of migration script files
pub const MIGRATION_FILE_INFIX: &str = ".migration.";

/// Anything that can enumerate migration units
pub trait MigrationSource<H> {
    fn units(&self) -> DiscoveryResult<Vec<MigrationUnit<H>>>;
}

impl<H> MigrationSource<H> for Vec<MigrationUnit<H>> {
    fn units(&self) -> DiscoveryResult<Vec<MigrationUnit<H>>> {
        Ok(self.clone())
    }
}

impl<H> MigrationSource<H> for [MigrationUnit<H>] {
    fn units(&self) -> DiscoveryResult<Vec<MigrationUnit<H>>> {
        Ok(self.to_vec())
    }
}

/// Enumerate, validate and sort the units of a source
pub fn discover<H, S>(source: &S) -> DiscoveryResult<Vec<MigrationUnit<H>>>
where
    S: MigrationSource<H> + ?Sized,
{
    let mut units = source.units()?;

    for unit in &units {
        unit.id.validate()?;
    }

    units.sort_by(|a, b| a.id.cmp(&b.id));

    if let Some(pair) = units.windows(2).find(|pair| pair[0].id == pair[1].id) {
        return Err(DiscoveryError::DuplicateId(pair[0].id.to_string()));
    }

    debug!("Discovered {} migration units", units.len());
    Ok(units)
}

/// Script-based units read from `<id>.migration.<ext>` files in a directory.
///
/// `sql` files hold `-- up` and `-- down` sections; `json` files hold
/// `{"up": [commands], "down": [commands]}`. Each section runs through the
/// handle's `exec_raw`. Files with other names are ignored and a missing
/// directory yields no units.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    extension: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    /// Source reading the script format of driver `D`
    pub fn for_driver<D: Driver>(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, D::SCRIPT_EXTENSION)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Migration files in the directory as `(id, path)`, unsorted
    pub fn scripts(&self) -> DiscoveryResult<Vec<(MigrationId, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let io_err = |source| DiscoveryError::Io {
            path: self.dir.display().to_string(),
            source,
        };
        let suffix = format!("{}{}", MIGRATION_FILE_INFIX, self.extension);

        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() {
                continue;
            }
            let Some(id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(&suffix))
            else {
                continue;
            };
            scripts.push((MigrationId::new(id), path));
        }
        Ok(scripts)
    }

    fn parse(&self, path: &Path) -> DiscoveryResult<Sections> {
        let content = fs::read_to_string(path).map_err(|source| DiscoveryError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let sections = match self.extension.as_str() {
            "sql" => parse_sql_sections(&content),
            "json" => parse_json_sections(&content).map_err(|reason| DiscoveryError::Script {
                path: path.display().to_string(),
                reason,
            })?,
            other => {
                return Err(DiscoveryError::Script {
                    path: path.display().to_string(),
                    reason: format!("unsupported script extension '{}'", other),
                })
            }
        };

        if sections.up.trim().is_empty() {
            return Err(DiscoveryError::Script {
                path: path.display().to_string(),
                reason: "missing or empty up section".to_string(),
            });
        }
        Ok(sections)
    }
}

impl<H: Handle + 'static> MigrationSource<H> for DirectorySource {
    fn units(&self) -> DiscoveryResult<Vec<MigrationUnit<H>>> {
        self.scripts()?
            .into_iter()
            .map(|(id, path)| {
                id.validate()?;
                let sections = self.parse(&path)?;
                Ok(script_unit(id, sections))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Sections {
    up: String,
    down: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

fn section_marker(line: &str) -> Option<Section> {
    let comment = line.trim().strip_prefix("--")?.trim().to_lowercase();
    match comment.as_str() {
        "up" | "up migration" | "+up" => Some(Section::Up),
        "down" | "down migration" | "+down" => Some(Section::Down),
        _ => None,
    }
}

fn parse_sql_sections(content: &str) -> Sections {
    let mut sections = Sections::default();
    let mut current = Section::Preamble;

    for line in content.lines() {
        if let Some(marker) = section_marker(line) {
            current = marker;
            continue;
        }
        let target = match current {
            Section::Preamble => continue,
            Section::Up => &mut sections.up,
            Section::Down => &mut sections.down,
        };
        target.push_str(line);
        target.push('\n');
    }

    sections.up = sections.up.trim().to_string();
    sections.down = sections.down.trim().to_string();
    sections
}

#[derive(Deserialize)]
struct JsonScript {
    up: Vec<JsonValue>,
    #[serde(default)]
    down: Vec<JsonValue>,
}

fn parse_json_sections(content: &str) -> Result<Sections, String> {
    let script: JsonScript = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let render = |commands: Vec<JsonValue>| -> Result<String, String> {
        if commands.is_empty() {
            return Ok(String::new());
        }
        serde_json::to_string(&commands).map_err(|e| e.to_string())
    };
    Ok(Sections {
        up: render(script.up)?,
        down: render(script.down)?,
    })
}

fn script_unit<H: Handle + 'static>(id: MigrationId, sections: Sections) -> MigrationUnit<H> {
    let up: Arc<str> = Arc::from(sections.up);
    let down: Arc<str> = Arc::from(sections.down);
    let unit_id = id.to_string();

    MigrationUnit::new(
        id,
        move |h: &mut H| {
            let script = Arc::clone(&up);
            Box::pin(async move {
                h.exec_raw(&script).await?;
                Ok(())
            })
        },
        move |h: &mut H| {
            let script = Arc::clone(&down);
            let unit_id = unit_id.clone();
            Box::pin(async move {
                if script.trim().is_empty() {
                    anyhow::bail!("migration {} has no down section and cannot be reverted", unit_id);
                }
                h.exec_raw(&script).await?;
                Ok(())
            })
        },
    )
}

fn script_template(id: &MigrationId, extension: &str) -> String {
    match extension {
        "json" => "{\n  \"up\": [],\n  \"down\": []\n}\n".to_string(),
        _ => format!(
            "-- Migration: {}\n\
             -- Created: {}\n\n\
             -- up\n\n\n\
             -- down\n\n",
            id,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ),
    }
}

/// Write a new, timestamped migration script and return its path
pub fn create_migration(dir: impl AsRef<Path>, slug: &str, extension: &str) -> DiscoveryResult<PathBuf> {
    let dir = dir.as_ref();
    let io_err = |source| DiscoveryError::Io {
        path: dir.display().to_string(),
        source,
    };

    let slug = slug.trim().replace(' ', "-");
    let id = MigrationId::generate(Utc::now().naive_utc(), &slug)?;

    fs::create_dir_all(dir).map_err(io_err)?;
    let path = dir.join(format!("{}{}{}", id, MIGRATION_FILE_INFIX, extension));

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .and_then(|mut file| std::io::Write::write_all(&mut file, script_template(&id, extension).as_bytes()))
        .map_err(io_err)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DocumentHandle;
    use tempfile::TempDir;

    fn noop_unit(id: &str) -> MigrationUnit<DocumentHandle> {
        MigrationUnit::new(
            id,
            |_h: &mut DocumentHandle| Box::pin(async { Ok(()) }),
            |_h: &mut DocumentHandle| Box::pin(async { Ok(()) }),
        )
    }

    #[test]
    fn test_discover_sorts() {
        let units = vec![
            noop_unit("20240301000000-c"),
            noop_unit("20240101000000-a"),
            noop_unit("20240201000000-b"),
        ];
        let ids: Vec<String> = discover(&units)
            .unwrap()
            .iter()
            .map(|u| u.id.to_string())
            .collect();
        assert_eq!(ids, vec!["20240101000000-a", "20240201000000-b", "20240301000000-c"]);
    }

    #[test]
    fn test_duplicate_ids() {
        let units = vec![noop_unit("20240101000000-a"), noop_unit("20240101000000-a")];
        assert!(matches!(
            discover(&units),
            Err(DiscoveryError::DuplicateId(id)) if id == "20240101000000-a"
        ));
    }

    #[test]
    fn test_malformed_id() {
        let units = vec![noop_unit("first")];
        assert!(matches!(discover(&units), Err(DiscoveryError::MalformedId { .. })));
    }

    #[test]
    fn test_sql_sections() {
        let sections = parse_sql_sections(
            "-- Migration: create users\n-- up\nCREATE TABLE users (id INTEGER);\n\n-- DOWN\nDROP TABLE users;\n",
        );
        assert_eq!(sections.up, "CREATE TABLE users (id INTEGER);");
        assert_eq!(sections.down, "DROP TABLE users;");
    }

    #[test]
    fn test_json_sections() {
        let sections = parse_json_sections(
            r#"{"up": [{"op": "insertOne", "collection": "c", "document": {"a": 1}}]}"#,
        )
        .unwrap();
        assert!(sections.up.contains("insertOne"));
        assert!(sections.down.is_empty());
        assert!(parse_json_sections(r#"{"down": []}"#).is_err());
    }

    #[test]
    fn test_directory_source() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("20240102000000-two.migration.json"),
            r#"{"up": [{"op": "createCollection", "collection": "two"}]}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("20240101000000-one.migration.json"),
            r#"{"up": [{"op": "createCollection", "collection": "one"}]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();
        fs::write(dir.path().join("20240103000000-other.migration.sql"), "-- up\nSELECT 1;").unwrap();

        let source = DirectorySource::new(dir.path(), "json");
        let units: Vec<MigrationUnit<DocumentHandle>> = discover(&source).unwrap();
        let ids: Vec<_> = units.iter().map(|u| u.id.to_string()).collect();
        assert_eq!(ids, vec!["20240101000000-one", "20240102000000-two"]);
    }

    #[test]
    fn test_directory_source_rejects_bad_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("first.migration.json"), r#"{"up": [{}]}"#).unwrap();
        let source = DirectorySource::new(dir.path(), "json");
        let result: DiscoveryResult<Vec<MigrationUnit<DocumentHandle>>> = discover(&source);
        assert!(matches!(result, Err(DiscoveryError::MalformedId { .. })));

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("20240101000000-empty.migration.sql"), "-- down\nDROP TABLE t;").unwrap();
        let source = DirectorySource::new(dir.path(), "sql");
        let result: DiscoveryResult<Vec<MigrationUnit<DocumentHandle>>> = discover(&source);
        assert!(matches!(result, Err(DiscoveryError::Script { .. })));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let source = DirectorySource::new("/definitely/not/here", "sql");
        let units: Vec<MigrationUnit<DocumentHandle>> = discover(&source).unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn test_create_migration() {
        let dir = TempDir::new().unwrap();
        let path = create_migration(dir.path().join("migrations"), "create users", "sql").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.ends_with("-create-users.migration.sql"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- up"));
        assert!(content.contains("-- down"));

        let scripts = DirectorySource::new(dir.path().join("migrations"), "sql").scripts().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].0.validate().is_ok());

        assert!(create_migration(dir.path(), "bad/slug", "sql").is_err());
    }
}
