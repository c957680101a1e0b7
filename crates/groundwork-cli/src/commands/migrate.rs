use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use console::style;
use groundwork::{
    create_migration, DatabaseConfig, Direction, DirectorySource, DocumentDriver, Driver, DriverKind,
    GroundworkConfig, MigrationId, MigrationObserver, Migrator, RunReport, SqlDriver, Target,
};
use tokio_util::sync::CancellationToken;

/// Selected database and where its migrations live
pub struct Context {
    pub db: DatabaseConfig,
    pub migrations_dir: PathBuf,
}

impl Context {
    pub fn load(config_path: Option<&Path>, db: Option<&str>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => GroundworkConfig::load(path)?,
            None => GroundworkConfig::find()?,
        };
        let db = config.select(db)?.clone();
        let migrations_dir = config.migrations_path(&db);
        Ok(Self { db, migrations_dir })
    }
}

pub enum Action {
    Up(Target),
    Down(Target),
    Status,
    SetHead(MigrationId),
    Unlock,
}

pub fn up_target(id: Option<String>, count: Option<usize>) -> Target {
    match (id, count) {
        (Some(id), _) => Target::Id(id.into()),
        (None, Some(n)) => Target::Count(n),
        (None, None) => Target::All,
    }
}

pub fn down_target(id: Option<String>, count: Option<usize>, all: bool) -> Target {
    match (id, count) {
        _ if all => Target::All,
        (Some(id), _) => Target::Id(id.into()),
        (None, Some(n)) => Target::Count(n),
        (None, None) => Target::Count(1),
    }
}

pub fn create(ctx: &Context, slug: &str) -> anyhow::Result<()> {
    let extension = match ctx.db.kind {
        DriverKind::Sql => SqlDriver::SCRIPT_EXTENSION,
        DriverKind::Document => DocumentDriver::SCRIPT_EXTENSION,
    };
    let path = create_migration(&ctx.migrations_dir, slug, extension)?;
    println!("{} {}", style("Created").green().bold(), path.display());
    Ok(())
}

pub async fn execute(ctx: &Context, action: Action) -> anyhow::Result<()> {
    let url = ctx.db.resolve_url()?;
    match ctx.db.kind {
        DriverKind::Sql => {
            let driver = SqlDriver::connect_with(&url, ctx.db.sql_options())
                .await
                .with_context(|| format!("connecting to database '{}'", ctx.db.name))?;
            run_with(driver, ctx, action).await
        }
        DriverKind::Document => {
            let driver = DocumentDriver::connect_with(&url, ctx.db.document_options())
                .await
                .with_context(|| format!("connecting to document store '{}'", ctx.db.name))?;
            run_with(driver, ctx, action).await
        }
    }
}

async fn run_with<D>(driver: D, ctx: &Context, action: Action) -> anyhow::Result<()>
where
    D: Driver,
    D::Handle: 'static,
{
    let source = DirectorySource::for_driver::<D>(&ctx.migrations_dir);
    let cancel = CancellationToken::new();
    let mut migrator = Migrator::new(driver.clone(), &source)?
        .with_observer(Arc::new(ConsoleObserver))
        .with_cancellation(cancel.clone())
        .allow_out_of_order(ctx.db.allow_out_of_order);
    if let Some(timeout) = ctx.db.unit_timeout() {
        migrator = migrator.with_unit_timeout(timeout);
    }

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style("Interrupted; stopping after the current migration").yellow());
            cancel.cancel();
        }
    });

    let result = match action {
        Action::Up(target) => migrator.up(target).await.map(|_| ()),
        Action::Down(target) => migrator.down(target).await.map(|_| ()),
        Action::Status => print_status(&migrator).await,
        Action::SetHead(id) => migrator.set_head(&id).await.map(|change| {
            for id in &change.marked_applied {
                println!("  {} {}", style("marked applied").green(), id);
            }
            for id in &change.marked_reverted {
                println!("  {} {}", style("marked reverted").yellow(), id);
            }
            println!("Head is now {}", style(&id).bold());
        }),
        Action::Unlock => migrator.force_unlock().await.map(|previous| {
            match previous.holder.filter(|_| previous.locked) {
                Some(holder) => println!("Cleared run lock held by {}", style(holder).bold()),
                None => println!("Run lock was not held"),
            }
        }),
    };

    interrupt.abort();
    driver.close().await?;
    result.map_err(Into::into)
}

async fn print_status<D>(migrator: &Migrator<D>) -> Result<(), groundwork::RunnerError>
where
    D: Driver,
{
    let status = migrator.status().await?;

    println!("{}", style("Migration status").bold());
    for unit in migrator.units() {
        let id = unit.id();
        if let Some(record) = status.applied.iter().find(|r| r.id == id.as_str()) {
            println!(
                "  {} {}  {}",
                style("applied").green(),
                id,
                style(record.applied_at.format("%Y-%m-%d %H:%M:%S")).dim()
            );
        } else if status.gaps.contains(id) {
            println!("  {} {}", style("gap    ").red(), id);
        } else {
            println!("  {} {}", style("pending").yellow(), id);
        }
    }

    println!(
        "\n{} applied, {} pending",
        status.applied.len(),
        status.pending.len()
    );
    if !status.gaps.is_empty() {
        println!(
            "{}",
            style(format!(
                "{} pending migration(s) are ordered before the latest applied one",
                status.gaps.len()
            ))
            .red()
        );
    }
    if status.lock.locked {
        println!(
            "Run lock held by {}",
            style(status.lock.holder.as_deref().unwrap_or("unknown")).bold()
        );
    }
    Ok(())
}

/// Prints unit progress to the terminal
struct ConsoleObserver;

impl MigrationObserver for ConsoleObserver {
    fn unit_completed(&self, direction: Direction, unit: &MigrationId, elapsed: Duration) {
        let verb = match direction {
            Direction::Up => "applied ",
            Direction::Down => "reverted",
        };
        println!(
            "  {} {} {}",
            style(verb).green(),
            unit,
            style(format!("({}ms)", elapsed.as_millis())).dim()
        );
    }

    fn unit_failed(&self, direction: Direction, unit: &MigrationId, error: &anyhow::Error) {
        println!("  {} {} ({}): {:#}", style("failed  ").red().bold(), unit, direction, error);
    }

    fn run_finished(&self, report: &RunReport) {
        if report.cancelled {
            println!(
                "{}",
                style(format!("Cancelled after {} migration(s)", report.processed.len())).yellow()
            );
        } else if report.processed.is_empty() {
            println!("Nothing to do");
        } else {
            println!(
                "{} {} migration(s) in {}ms",
                match report.direction {
                    Direction::Up => "Applied",
                    Direction::Down => "Reverted",
                },
                report.processed.len(),
                report.elapsed_ms
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_target() {
        assert_eq!(up_target(None, None), Target::All);
        assert_eq!(up_target(None, Some(2)), Target::Count(2));
        assert_eq!(
            up_target(Some("20240101000000-a".into()), None),
            Target::Id(MigrationId::new("20240101000000-a"))
        );
    }

    #[test]
    fn test_down_target_defaults_to_one() {
        assert_eq!(down_target(None, None, false), Target::Count(1));
        assert_eq!(down_target(None, None, true), Target::All);
        assert_eq!(down_target(None, Some(3), false), Target::Count(3));
    }

    #[tokio::test]
    async fn test_sql_round_trip_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("groundwork.toml"),
            format!(
                "[[databases]]\nname = \"app\"\nkind = \"sql\"\nurl = \"sqlite://{}?mode=rwc\"\n",
                dir.path().join("app.db").display()
            ),
        )
        .unwrap();

        let ctx = Context::load(Some(dir.path().join("groundwork.toml").as_path()), None).unwrap();
        create(&ctx, "seed settings").unwrap();
        let script = std::fs::read_dir(&ctx.migrations_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(
            &script,
            "-- up\nCREATE TABLE settings (name TEXT PRIMARY KEY, value TEXT);\n\
             INSERT INTO settings VALUES ('theme', 'it''s dark');\n\
             -- down\nDROP TABLE settings;\n",
        )
        .unwrap();

        execute(&ctx, Action::Up(Target::All)).await.unwrap();
        execute(&ctx, Action::Status).await.unwrap();
        execute(&ctx, Action::Down(Target::Count(1))).await.unwrap();
        execute(&ctx, Action::Unlock).await.unwrap();
    }
}
