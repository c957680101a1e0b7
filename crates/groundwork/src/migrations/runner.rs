//! Migration Runner - the run state machine
//!
//! `Idle → Planning → Applying(i) | Reverting(i) → Completed | Failed(i)`.
//!
//! A run takes the run lock, computes its plan from the discovered units and
//! the applied records, then executes units strictly one after another. Each
//! unit and its state record commit together; units committed before a
//! failure stay committed.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::definitions::{
    Direction, MigrationId, MigrationRecord, MigrationUnit, RunReport, RunState, Status, Target,
};
use super::discovery::{discover, MigrationSource};
use super::observer::{MigrationObserver, TracingObserver};
use super::state::{default_holder_id, StateStore};
use crate::driver::{with_transaction, Driver, LockRecord};
use crate::error::{DriverError, RunResult, RunnerError, StateStoreError};

/// Record changes made by [`Migrator::set_head`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadChange {
    pub marked_applied: Vec<MigrationId>,
    pub marked_reverted: Vec<MigrationId>,
}

/// Runs migration units of one driver
pub struct Migrator<D: Driver> {
    driver: D,
    state: StateStore<D>,
    units: Vec<MigrationUnit<D::Handle>>,
    holder: String,
    observer: Arc<dyn MigrationObserver>,
    cancellation: Option<CancellationToken>,
    unit_timeout: Option<Duration>,
    allow_out_of_order: bool,
    current: Mutex<RunState>,
}

impl<D: Driver> Migrator<D> {
    /// Discover the units of `source` once; they are fixed for the life of
    /// the migrator
    pub fn new<S>(driver: D, source: &S) -> RunResult<Self>
    where
        S: MigrationSource<D::Handle> + ?Sized,
    {
        let units = discover(source)?;
        Ok(Self {
            state: StateStore::new(driver.clone()),
            driver,
            units,
            holder: default_holder_id(),
            observer: Arc::new(TracingObserver),
            cancellation: None,
            unit_timeout: None,
            allow_out_of_order: false,
            current: Mutex::new(RunState::Idle),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn MigrationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Stop between units once the token is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Fail a unit whose procedure runs longer than `timeout`
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }

    /// Apply pending units ordered before the latest applied one instead of
    /// failing with `OutOfOrder`
    pub fn allow_out_of_order(mut self, allow: bool) -> Self {
        self.allow_out_of_order = allow;
        self
    }

    /// Identifier written into the run lock
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn units(&self) -> &[MigrationUnit<D::Handle>] {
        &self.units
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// State of the current (or last) run
    pub fn state(&self) -> RunState {
        *self.current.lock()
    }

    /// Apply pending units up to `target`
    pub async fn up(&self, target: Target) -> RunResult<RunReport> {
        self.run(Direction::Up, target).await
    }

    /// Revert applied units down to `target`, newest first
    pub async fn down(&self, target: Target) -> RunResult<RunReport> {
        self.run(Direction::Down, target).await
    }

    /// Units a run would process, without taking the lock or running anything
    pub async fn plan(&self, direction: Direction, target: Target) -> RunResult<Vec<MigrationId>> {
        self.driver.prepare().await?;
        let applied = self.state.load_applied().await?;
        let plan = self.compute_plan(direction, &target, &applied)?;
        Ok(plan.into_iter().map(|unit| unit.id.clone()).collect())
    }

    pub async fn status(&self) -> RunResult<Status> {
        self.driver.prepare().await?;
        let applied = self.state.load_applied().await?;
        let lock = self.state.lock_state().await?;

        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.id.as_str()).collect();
        let pending: Vec<MigrationId> = self
            .units
            .iter()
            .filter(|unit| !applied_ids.contains(unit.id.as_str()))
            .map(|unit| unit.id.clone())
            .collect();
        let gaps = match applied.last() {
            Some(latest) => pending
                .iter()
                .filter(|id| id.as_str() < latest.id.as_str())
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        Ok(Status {
            applied,
            pending,
            gaps,
            lock,
        })
    }

    /// Rewrite the records so that exactly the units up to and including
    /// `id` count as applied. No unit procedure runs.
    pub async fn set_head(&self, id: &MigrationId) -> RunResult<HeadChange> {
        if !self.units.iter().any(|unit| &unit.id == id) {
            return Err(RunnerError::TargetNotFound(id.to_string()));
        }

        self.driver.prepare().await?;
        self.locked(async {
            let applied = self.state.load_applied().await?;
            self.check_known(&applied)?;
            let applied_ids: HashSet<&str> = applied.iter().map(|r| r.id.as_str()).collect();

            let mut change = HeadChange::default();
            for unit in &self.units {
                let is_applied = applied_ids.contains(unit.id.as_str());
                if unit.id <= *id && !is_applied {
                    change.marked_applied.push(unit.id.clone());
                } else if unit.id > *id && is_applied {
                    change.marked_reverted.push(unit.id.clone());
                }
            }

            let to_apply = change.marked_applied.clone();
            let to_revert = change.marked_reverted.clone();
            with_transaction(&self.driver, move |h| {
                Box::pin(async move {
                    for id in &to_apply {
                        StateStore::<D>::record_applied(h, id, Utc::now()).await?;
                    }
                    for id in &to_revert {
                        StateStore::<D>::record_reverted(h, id).await?;
                    }
                    Ok(())
                })
            })
            .await
            .map_err(into_runner_error)?;

            info!(
                "Head set to {} ({} marked applied, {} marked reverted)",
                id,
                change.marked_applied.len(),
                change.marked_reverted.len()
            );
            Ok::<_, RunnerError>(change)
        })
        .await
    }

    /// Clear the run lock regardless of holder
    pub async fn force_unlock(&self) -> RunResult<LockRecord> {
        self.driver.prepare().await?;
        Ok(self.state.force_unlock().await?)
    }

    async fn run(&self, direction: Direction, target: Target) -> RunResult<RunReport> {
        let started = Instant::now();
        self.transition(RunState::Idle, None);

        self.driver.prepare().await?;
        let result = self.locked(self.execute(direction, &target, started)).await;

        match &result {
            Ok(report) => self.observer.run_finished(report),
            Err(RunnerError::UnitFailed { .. }) => {}
            Err(e) => warn!("Migration run ({}) did not start: {}", direction, e),
        }
        result
    }

    /// Run `work` while holding the run lock; the lock is released on every
    /// exit path
    async fn locked<T>(&self, work: impl Future<Output = RunResult<T>>) -> RunResult<T> {
        let lock = self.state.acquire_run_lock(&self.holder).await?;
        let result = work.await;

        match lock.release().await {
            Ok(()) => result,
            Err(release_err) => {
                if result.is_ok() {
                    Err(release_err.into())
                } else {
                    warn!("Failed to release run lock: {}", release_err);
                    result
                }
            }
        }
    }

    async fn execute(&self, direction: Direction, target: &Target, started: Instant) -> RunResult<RunReport> {
        self.transition(RunState::Planning, None);

        let planned = self
            .state
            .load_applied()
            .await
            .map_err(RunnerError::from)
            .and_then(|applied| self.compute_plan(direction, target, &applied));
        let plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                self.transition(RunState::Idle, None);
                return Err(e);
            }
        };
        debug!("Planned {} unit(s) {}", plan.len(), direction);

        let mut processed: Vec<MigrationId> = Vec::with_capacity(plan.len());
        let mut cancelled = false;

        for (index, unit) in plan.iter().enumerate() {
            if self.cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                info!("Cancellation requested; stopping before {}", unit.id);
                cancelled = true;
                break;
            }

            let state = match direction {
                Direction::Up => RunState::Applying(index),
                Direction::Down => RunState::Reverting(index),
            };
            self.transition(state, Some(&unit.id));

            let unit_started = Instant::now();
            if let Err(cause) = self.run_unit(unit, direction).await {
                self.transition(RunState::Failed(index), Some(&unit.id));
                self.observer.unit_failed(direction, &unit.id, &cause);
                return Err(RunnerError::UnitFailed {
                    id: unit.id.to_string(),
                    direction,
                    completed: processed.iter().map(|id| id.to_string()).collect(),
                    cause,
                });
            }
            self.observer
                .unit_completed(direction, &unit.id, unit_started.elapsed());
            processed.push(unit.id.clone());
        }

        self.transition(RunState::Completed, None);
        Ok(RunReport {
            direction,
            processed,
            cancelled,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Run one unit and its record change in a single transaction
    async fn run_unit(&self, unit: &MigrationUnit<D::Handle>, direction: Direction) -> anyhow::Result<()> {
        let procedure = unit.procedure(direction);
        let id = unit.id.clone();
        let timeout = self.unit_timeout;

        with_transaction(&self.driver, move |h| {
            Box::pin(async move {
                let body = AssertUnwindSafe(procedure(&mut *h)).catch_unwind();
                let outcome = match timeout {
                    Some(limit) => tokio::time::timeout(limit, body).await.map_err(|_| {
                        DriverError::Query(format!("{} exceeded the unit timeout of {:?}", id, limit))
                    })?,
                    None => body.await,
                };

                match outcome {
                    Ok(result) => result?,
                    Err(panic) => anyhow::bail!("{} panicked: {}", id, panic_message(panic.as_ref())),
                }

                match direction {
                    Direction::Up => {
                        StateStore::<D>::record_applied(h, &id, Utc::now()).await?;
                    }
                    Direction::Down => StateStore::<D>::record_reverted(h, &id).await?,
                }
                Ok(())
            })
        })
        .await
    }

    /// Select the units a run processes, in execution order
    fn compute_plan(
        &self,
        direction: Direction,
        target: &Target,
        applied: &[MigrationRecord],
    ) -> RunResult<Vec<&MigrationUnit<D::Handle>>> {
        self.check_known(applied)?;
        let applied_ids: HashSet<&str> = applied.iter().map(|r| r.id.as_str()).collect();

        if let Target::Id(id) = target {
            if !self.units.iter().any(|unit| &unit.id == id) {
                return Err(RunnerError::TargetNotFound(id.to_string()));
            }
        }

        match direction {
            Direction::Up => {
                let pending: Vec<&MigrationUnit<D::Handle>> = self
                    .units
                    .iter()
                    .filter(|unit| !applied_ids.contains(unit.id.as_str()))
                    .collect();

                if let Some(latest) = applied.last() {
                    let gaps: Vec<String> = pending
                        .iter()
                        .filter(|unit| unit.id.as_str() < latest.id.as_str())
                        .map(|unit| unit.id.to_string())
                        .collect();
                    if !gaps.is_empty() {
                        if !self.allow_out_of_order {
                            return Err(RunnerError::OutOfOrder {
                                pending: gaps,
                                latest: latest.id.clone(),
                            });
                        }
                        warn!(
                            "Applying {} unit(s) ordered before the latest applied migration {}: {:?}",
                            gaps.len(),
                            latest.id,
                            gaps
                        );
                    }
                }

                Ok(match target {
                    Target::All => pending,
                    Target::Count(n) => pending.into_iter().take(*n).collect(),
                    Target::Id(id) => pending.into_iter().filter(|unit| unit.id <= *id).collect(),
                })
            }
            Direction::Down => {
                if let Target::Id(id) = target {
                    if !applied_ids.contains(id.as_str()) {
                        return Err(RunnerError::NotApplied(id.to_string()));
                    }
                }

                let reverting = self
                    .units
                    .iter()
                    .rev()
                    .filter(|unit| applied_ids.contains(unit.id.as_str()));

                Ok(match target {
                    Target::All => reverting.collect(),
                    Target::Count(n) => reverting.take(*n).collect(),
                    Target::Id(id) => reverting.filter(|unit| unit.id >= *id).collect(),
                })
            }
        }
    }

    /// Every applied record must name a discovered unit
    fn check_known(&self, applied: &[MigrationRecord]) -> RunResult<()> {
        let known: HashSet<&str> = self.units.iter().map(|unit| unit.id.as_str()).collect();
        match applied.iter().find(|r| !known.contains(r.id.as_str())) {
            Some(record) => Err(RunnerError::StateStore(StateStoreError::CorruptRecord(format!(
                "applied migration {} is not among the discovered units",
                record.id
            )))),
            None => Ok(()),
        }
    }

    fn transition(&self, state: RunState, unit: Option<&MigrationId>) {
        *self.current.lock() = state;
        self.observer.state_changed(state, unit);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Recover the typed error of a transaction that failed outside user code
fn into_runner_error(err: anyhow::Error) -> RunnerError {
    match err.downcast::<StateStoreError>() {
        Ok(e) => e.into(),
        Err(err) => match err.downcast::<DriverError>() {
            Ok(e) => RunnerError::Driver(e),
            Err(err) => RunnerError::Driver(DriverError::TransactionAbort(format!("{:#}", err))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SqlDriver, SqlHandle};
    use crate::driver::Handle;
    use crate::sql;
    use tempfile::TempDir;

    async fn sqlite() -> (TempDir, SqlDriver) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("runner.db").display());
        let driver = SqlDriver::connect(&url).await.unwrap();
        driver
            .handle()
            .await
            .unwrap()
            .exec_raw("CREATE TABLE log (event TEXT NOT NULL, unit TEXT NOT NULL)")
            .await
            .unwrap();
        (dir, driver)
    }

    fn unit(id: &'static str) -> MigrationUnit<SqlHandle> {
        MigrationUnit::new(
            id,
            move |h: &mut SqlHandle| {
                Box::pin(async move {
                    h.exec(&sql!("INSERT INTO log (event, unit) VALUES ({}, {})", "up", id)?).await?;
                    Ok(())
                })
            },
            move |h: &mut SqlHandle| {
                Box::pin(async move {
                    h.exec(&sql!("INSERT INTO log (event, unit) VALUES ({}, {})", "down", id)?).await?;
                    Ok(())
                })
            },
        )
    }

    fn migrator(driver: &SqlDriver, ids: &[&'static str]) -> Migrator<SqlDriver> {
        let units: Vec<_> = ids.iter().map(|id| unit(id)).collect();
        Migrator::new(driver.clone(), &units).unwrap()
    }

    fn ids(list: &[MigrationId]) -> Vec<&str> {
        list.iter().map(|id| id.as_str()).collect()
    }

    const A: &str = "20240101000000-a";
    const B: &str = "20240102000000-b";
    const C: &str = "20240103000000-c";

    #[tokio::test]
    async fn test_up_targets() {
        let (_dir, driver) = sqlite().await;
        let m = migrator(&driver, &[A, B, C]);

        let report = m.up(Target::Count(1)).await.unwrap();
        assert_eq!(ids(&report.processed), vec![A]);

        let report = m.up(Target::Id(MigrationId::new(B))).await.unwrap();
        assert_eq!(ids(&report.processed), vec![B]);

        let report = m.up(Target::All).await.unwrap();
        assert_eq!(ids(&report.processed), vec![C]);
        assert_eq!(m.state(), RunState::Completed);

        let report = m.up(Target::All).await.unwrap();
        assert!(report.processed.is_empty());
    }

    #[tokio::test]
    async fn test_down_targets() {
        let (_dir, driver) = sqlite().await;
        let m = migrator(&driver, &[A, B, C]);
        m.up(Target::All).await.unwrap();

        let report = m.down(Target::Count(1)).await.unwrap();
        assert_eq!(ids(&report.processed), vec![C]);

        assert!(matches!(
            m.down(Target::Id(MigrationId::new(C))).await,
            Err(RunnerError::NotApplied(_))
        ));

        let report = m.down(Target::Id(MigrationId::new(A))).await.unwrap();
        assert_eq!(ids(&report.processed), vec![B, A]);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (_dir, driver) = sqlite().await;
        let m = migrator(&driver, &[A]);
        assert!(matches!(
            m.up(Target::Id(MigrationId::new("20990101000000-nope"))).await,
            Err(RunnerError::TargetNotFound(_))
        ));
        assert!(!m.state.lock_state().await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_plan_does_not_run() {
        let (_dir, driver) = sqlite().await;
        let m = migrator(&driver, &[A, B]);
        let planned = m.plan(Direction::Up, Target::All).await.unwrap();
        assert_eq!(ids(&planned), vec![A, B]);
        assert!(m.status().await.unwrap().applied.is_empty());
        assert!(m.plan(Direction::Down, Target::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gaps() {
        let (_dir, driver) = sqlite().await;
        let later = Migrator::new(driver.clone(), &vec![unit(A), unit(C)]).unwrap();
        later.up(Target::All).await.unwrap();

        let with_gap = Migrator::new(driver.clone(), &vec![unit(A), unit(B), unit(C)]).unwrap();
        let status = with_gap.status().await.unwrap();
        assert_eq!(ids(&status.gaps), vec![B]);

        match with_gap.up(Target::All).await {
            Err(RunnerError::OutOfOrder { pending, latest }) => {
                assert_eq!(pending, vec![B.to_string()]);
                assert_eq!(latest, C);
            }
            other => panic!("expected OutOfOrder, got {:?}", other),
        }

        let tolerant = with_gap.allow_out_of_order(true);
        let report = tolerant.up(Target::All).await.unwrap();
        assert_eq!(ids(&report.processed), vec![B]);
    }

    #[tokio::test]
    async fn test_unknown_applied_record_is_corrupt() {
        let (_dir, driver) = sqlite().await;
        Migrator::new(driver.clone(), &vec![unit(A), unit(B)])
            .unwrap()
            .up(Target::All)
            .await
            .unwrap();

        let fewer = Migrator::new(driver, &vec![unit(A)]).unwrap();
        assert!(matches!(
            fewer.up(Target::All).await,
            Err(RunnerError::StateStore(StateStoreError::CorruptRecord(_)))
        ));
    }

    #[tokio::test]
    async fn test_set_head() {
        let (_dir, driver) = sqlite().await;
        let m = migrator(&driver, &[A, B, C]);
        m.up(Target::Count(1)).await.unwrap();

        let change = m.set_head(&MigrationId::new(B)).await.unwrap();
        assert_eq!(ids(&change.marked_applied), vec![B]);
        assert!(change.marked_reverted.is_empty());

        let change = m.set_head(&MigrationId::new(A)).await.unwrap();
        assert_eq!(ids(&change.marked_reverted), vec![B]);

        let applied: Vec<_> = m.status().await.unwrap().applied.into_iter().map(|r| r.id).collect();
        assert_eq!(applied, vec![A.to_string()]);

        #[derive(serde::Deserialize)]
        struct Entry {
            unit: String,
        }
        let ran: Vec<Entry> = m
            .driver()
            .handle()
            .await
            .unwrap()
            .query(&sql!("SELECT unit FROM log WHERE event = {}", "up").unwrap())
            .await
            .unwrap();
        assert_eq!(ran.into_iter().map(|e| e.unit).collect::<Vec<_>>(), vec![A.to_string()]);
    }

    fn explode() -> anyhow::Result<()> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_panicking_unit_is_a_failure() {
        let (_dir, driver) = sqlite().await;
        let units = vec![
            unit(A),
            MigrationUnit::new(
                B,
                |_h: &mut SqlHandle| Box::pin(async { explode() }),
                |_h: &mut SqlHandle| Box::pin(async { Ok(()) }),
            ),
        ];
        let m = Migrator::new(driver.clone(), &units).unwrap();

        match m.up(Target::All).await {
            Err(RunnerError::UnitFailed { id, completed, cause, .. }) => {
                assert_eq!(id, B);
                assert_eq!(completed, vec![A.to_string()]);
                assert!(format!("{:#}", cause).contains("kaboom"));
            }
            other => panic!("expected UnitFailed, got {:?}", other),
        }
        assert_eq!(m.state(), RunState::Failed(1));
        assert!(!m.status().await.unwrap().lock.locked);
    }

    #[tokio::test]
    async fn test_unit_timeout() {
        let (_dir, driver) = sqlite().await;
        let units = vec![MigrationUnit::new(
            A,
            |_h: &mut SqlHandle| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            },
            |_h: &mut SqlHandle| Box::pin(async { Ok(()) }),
        )];
        let m = Migrator::new(driver.clone(), &units)
            .unwrap()
            .with_unit_timeout(Duration::from_millis(20));

        let err = m.up(Target::All).await.unwrap_err();
        assert_eq!(err.failed_unit(), Some(A));
        assert!(m.status().await.unwrap().applied.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_between_units() {
        let (_dir, driver) = sqlite().await;
        let token = CancellationToken::new();
        let trigger = token.clone();
        let units = vec![
            MigrationUnit::new(
                A,
                move |_h: &mut SqlHandle| {
                    let trigger = trigger.clone();
                    Box::pin(async move {
                        trigger.cancel();
                        Ok(())
                    })
                },
                |_h: &mut SqlHandle| Box::pin(async { Ok(()) }),
            ),
            unit(B),
        ];
        let m = Migrator::new(driver.clone(), &units)
            .unwrap()
            .with_cancellation(token);

        let report = m.up(Target::All).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(ids(&report.processed), vec![A]);
        assert_eq!(m.status().await.unwrap().pending.len(), 1);
    }
}
