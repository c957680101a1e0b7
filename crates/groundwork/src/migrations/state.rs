//! State Store - applied-migration records and the run lock
//!
//! Records are written through whatever handle the caller passes in, so the
//! runner can put a unit's effects and its record in the same transaction.
//! The run lock always goes through autocommit handles.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::definitions::{MigrationId, MigrationRecord};
use crate::driver::{Driver, Handle, LockAttempt, LockRecord, StoredRecord};
use crate::error::{StateResult, StateStoreError};

/// Identifier written into the lock by this process
pub fn default_holder_id() -> String {
    format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple())
}

/// Applied-migration records and the run lock of one data store
#[derive(Debug, Clone)]
pub struct StateStore<D: Driver> {
    driver: D,
}

impl<D: Driver> StateStore<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Applied records, sorted by id, read through an autocommit handle
    pub async fn load_applied(&self) -> StateResult<Vec<MigrationRecord>> {
        let mut handle = self.driver.handle().await?;
        Self::read_applied(&mut handle).await
    }

    /// Applied records, sorted by id.
    ///
    /// Fails with `CorruptRecord` on malformed ids, unreadable timestamps or
    /// duplicated ids.
    pub async fn read_applied(handle: &mut D::Handle) -> StateResult<Vec<MigrationRecord>> {
        let stored = handle.applied_records().await?;

        let mut records = stored
            .into_iter()
            .map(validate_record)
            .collect::<StateResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(pair) = records.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(StateStoreError::CorruptRecord(format!(
                "migration {} is recorded more than once",
                pair[0].id
            )));
        }
        Ok(records)
    }

    /// Record `id` as applied
    pub async fn record_applied(
        handle: &mut D::Handle,
        id: &MigrationId,
        applied_at: DateTime<Utc>,
    ) -> StateResult<MigrationRecord> {
        let record = MigrationRecord::new(id.as_str(), applied_at);
        handle.insert_record(&record).await?;
        debug!("Recorded {} as applied", id);
        Ok(record)
    }

    /// Remove the record of `id`; a missing record means the store and the
    /// caller disagree about what is applied
    pub async fn record_reverted(handle: &mut D::Handle, id: &MigrationId) -> StateResult<()> {
        if !handle.delete_record(id.as_str()).await? {
            return Err(StateStoreError::CorruptRecord(format!(
                "no record exists for migration {}",
                id
            )));
        }
        debug!("Removed record of {}", id);
        Ok(())
    }

    /// Take the run lock for `holder`, failing with `LockContention` if
    /// anyone holds it
    pub async fn acquire_run_lock(&self, holder: &str) -> StateResult<RunLock<D>> {
        let mut handle = self.driver.handle().await?;
        match handle.try_lock(holder, Utc::now()).await? {
            LockAttempt::Acquired => {
                debug!("Run lock acquired by {}", holder);
                Ok(RunLock {
                    driver: self.driver.clone(),
                    holder: holder.to_string(),
                    released: false,
                })
            }
            LockAttempt::Held(current) => Err(StateStoreError::LockContention {
                holder: describe_holder(&current),
            }),
        }
    }

    pub async fn lock_state(&self) -> StateResult<LockRecord> {
        let mut handle = self.driver.handle().await?;
        Ok(handle.lock_state().await?)
    }

    /// Clear a stale lock regardless of who holds it
    pub async fn force_unlock(&self) -> StateResult<LockRecord> {
        let mut handle = self.driver.handle().await?;
        let previous = handle.lock_state().await?;
        handle.force_unlock().await?;
        if previous.locked {
            info!("Cleared run lock held by {}", describe_holder(&previous));
        }
        Ok(previous)
    }
}

fn describe_holder(lock: &LockRecord) -> String {
    match (&lock.holder, lock.acquired_at) {
        (Some(holder), Some(at)) => format!("{} since {}", holder, at.to_rfc3339()),
        (Some(holder), None) => holder.clone(),
        (None, _) => "unknown holder".to_string(),
    }
}

fn validate_record(stored: StoredRecord) -> StateResult<MigrationRecord> {
    MigrationId::new(stored.id.as_str())
        .validate()
        .map_err(|e| StateStoreError::CorruptRecord(e.to_string()))?;

    let applied_at = DateTime::parse_from_rfc3339(&stored.applied_at)
        .map_err(|e| {
            StateStoreError::CorruptRecord(format!(
                "record {} has unreadable applied_at '{}': {}",
                stored.id, stored.applied_at, e
            ))
        })?
        .with_timezone(&Utc);

    Ok(MigrationRecord::new(stored.id, applied_at))
}

/// Guard for a held run lock
///
/// Call [`RunLock::release`] on every path. Dropping an unreleased guard logs
/// a warning and, when a tokio runtime is available, releases in the
/// background.
#[derive(Debug)]
pub struct RunLock<D: Driver> {
    driver: D,
    holder: String,
    released: bool,
}

impl<D: Driver> RunLock<D> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(mut self) -> StateResult<()> {
        self.released = true;
        let mut handle = self.driver.handle().await?;
        if !handle.unlock(&self.holder).await? {
            warn!("Run lock was no longer held by {} at release", self.holder);
        } else {
            debug!("Run lock released by {}", self.holder);
        }
        Ok(())
    }
}

impl<D: Driver> Drop for RunLock<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Run lock of {} dropped without release", self.holder);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let driver = self.driver.clone();
            let holder = std::mem::take(&mut self.holder);
            runtime.spawn(async move {
                let result = match driver.handle().await {
                    Ok(mut handle) => handle.unlock(&holder).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Background release of run lock failed: {}", e);
                }
            });
        }
    }
}
