//! Runs against a live MongoDB server named by `GROUNDWORK_TEST_MONGODB_URL`
//! (for example `mongodb://localhost:27017/?replicaSet=rs0`). Each test
//! works in its own throwaway database and is skipped when the variable is
//! unset.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use groundwork::driver::LockAttempt;
use groundwork::{
    doc, DirectorySource, DocumentDriver, DocumentDriverOptions, DocumentHandle, Driver, Handle,
    LockRecord, MigrationId, MigrationUnit, Migrator, ObjectId, RunnerError, SilentObserver, Target,
};
use tempfile::TempDir;
use tokio::sync::Notify;

const URL_VAR: &str = "GROUNDWORK_TEST_MONGODB_URL";

const ONE: &str = "20231225010950-one";
const TWO: &str = "20231225010956-two";

struct TestDb {
    url: String,
    name: String,
}

impl TestDb {
    fn from_env() -> Option<Self> {
        let Ok(url) = std::env::var(URL_VAR) else {
            eprintln!("{} is not set; skipping", URL_VAR);
            return None;
        };
        Some(Self {
            url,
            name: format!("groundwork_test_{}", uuid::Uuid::new_v4().simple()),
        })
    }

    /// A new client on the same database, as a separate process would have
    async fn connect(&self) -> DocumentDriver {
        let options = DocumentDriverOptions {
            database: Some(self.name.clone()),
            ..Default::default()
        };
        DocumentDriver::connect_with(&self.url, options).await.unwrap()
    }

    async fn cleanup(self, driver: &DocumentDriver) {
        driver.database().drop(None).await.unwrap();
    }
}

fn insert_named(id: &'static str, oid: &'static str, name: &'static str) -> MigrationUnit<DocumentHandle> {
    MigrationUnit::new(
        id,
        move |db: &mut DocumentHandle| {
            Box::pin(async move {
                let oid = ObjectId::parse_str(oid)?;
                db.collection("test")
                    .insert_one(&doc! { "_id": oid, "name": name })
                    .await?;
                Ok(())
            })
        },
        move |db: &mut DocumentHandle| {
            Box::pin(async move {
                let oid = ObjectId::parse_str(oid)?;
                db.collection("test").delete_one(doc! { "_id": oid }).await?;
                Ok(())
            })
        },
    )
}

fn one_and_two() -> Vec<MigrationUnit<DocumentHandle>> {
    // declared out of order; discovery sorts by id
    vec![
        insert_named(TWO, "65b8582ee09c9ef3ba6eddb9", "two"),
        insert_named(ONE, "65b8077faddfba1bb64fa9fe", "one"),
    ]
}

fn failing(id: &'static str) -> MigrationUnit<DocumentHandle> {
    MigrationUnit::new(
        id,
        |db: &mut DocumentHandle| {
            Box::pin(async move {
                db.collection("test").insert_one(&doc! { "name": "half-done" }).await?;
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
        },
        |_db: &mut DocumentHandle| Box::pin(async { Ok(()) }),
    )
}

fn applied_ids(status: &groundwork::Status) -> Vec<&str> {
    status.applied.iter().map(|r| r.id.as_str()).collect()
}

#[tokio::test]
async fn test_one_two_scenario() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let migrator = Migrator::new(driver.clone(), &one_and_two())
        .unwrap()
        .with_observer(Arc::new(SilentObserver));

    let report = migrator.up(Target::All).await.unwrap();
    let processed: Vec<_> = report.processed.iter().map(|id| id.as_str()).collect();
    assert_eq!(processed, vec![ONE, TWO]);

    let mut handle = driver.handle().await.unwrap();
    let docs = handle.collection("test").find(doc! {}).await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].get_str("name").unwrap(), "one");
    assert_eq!(docs[0].get_object_id("_id").unwrap().to_hex(), "65b8077faddfba1bb64fa9fe");
    assert_eq!(docs[1].get_str("name").unwrap(), "two");
    assert_eq!(docs[1].get_object_id("_id").unwrap().to_hex(), "65b8582ee09c9ef3ba6eddb9");

    let report = migrator.down(Target::Count(1)).await.unwrap();
    assert_eq!(report.processed, vec![MigrationId::new(TWO)]);
    let report = migrator.down(Target::Count(1)).await.unwrap();
    assert_eq!(report.processed, vec![MigrationId::new(ONE)]);

    assert_eq!(handle.collection("test").count(doc! {}).await.unwrap(), 0);
    assert!(migrator.status().await.unwrap().applied.is_empty());

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_up_is_idempotent() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let migrator = Migrator::new(driver.clone(), &one_and_two()).unwrap();

    migrator.up(Target::All).await.unwrap();
    let again = migrator.up(Target::All).await.unwrap();
    assert!(again.processed.is_empty());

    let status = migrator.status().await.unwrap();
    assert_eq!(applied_ids(&status), vec![ONE, TWO]);
    assert!(status.pending.is_empty());
    assert!(!status.lock.locked);

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_failure_keeps_earlier_units_and_resumes() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let broken = vec![
        insert_named(ONE, "65b8077faddfba1bb64fa9fe", "one"),
        failing(TWO),
    ];
    let migrator = Migrator::new(driver.clone(), &broken).unwrap();

    match migrator.up(Target::All).await {
        Err(RunnerError::UnitFailed { id, completed, .. }) => {
            assert_eq!(id, TWO);
            assert_eq!(completed, vec![ONE.to_string()]);
        }
        other => panic!("expected UnitFailed, got {:?}", other),
    }

    let status = migrator.status().await.unwrap();
    assert_eq!(applied_ids(&status), vec![ONE]);
    assert!(!status.lock.locked, "lock must be released after a failure");

    let mut handle = driver.handle().await.unwrap();
    let half_done = handle.collection("test").count(doc! { "name": "half-done" }).await.unwrap();
    if driver.capabilities().supports_atomicity {
        assert_eq!(half_done, 0, "failed unit's write must be rolled back");
    } else {
        assert_eq!(half_done, 1);
        handle.collection("test").delete_many(doc! { "name": "half-done" }).await.unwrap();
    }

    let fixed = Migrator::new(driver.clone(), &one_and_two()).unwrap();
    let report = fixed.up(Target::All).await.unwrap();
    assert_eq!(report.processed, vec![MigrationId::new(TWO)]);
    assert_eq!(handle.collection("test").count(doc! {}).await.unwrap(), 2);

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_concurrent_runs_are_exclusive() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let started = Arc::new(Notify::new());
    let proceed = Arc::new(Notify::new());

    let (started_tx, proceed_rx) = (Arc::clone(&started), Arc::clone(&proceed));
    let slow = vec![MigrationUnit::new(
        ONE,
        move |_db: &mut DocumentHandle| {
            let (started, proceed) = (Arc::clone(&started_tx), Arc::clone(&proceed_rx));
            Box::pin(async move {
                started.notify_one();
                proceed.notified().await;
                Ok(())
            })
        },
        |_db: &mut DocumentHandle| Box::pin(async { Ok(()) }),
    )];

    let first = Arc::new(Migrator::new(driver.clone(), &slow).unwrap().with_holder("first"));
    let running = {
        let first = Arc::clone(&first);
        tokio::spawn(async move { first.up(Target::All).await })
    };
    started.notified().await;

    let second = Migrator::new(driver.clone(), &one_and_two())
        .unwrap()
        .with_holder("second");
    match second.up(Target::All).await {
        Err(RunnerError::RunInProgress { holder }) => assert!(holder.starts_with("first")),
        other => panic!("expected RunInProgress, got {:?}", other),
    }

    proceed.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.processed.len(), 1);
    assert!(!second.status().await.unwrap().lock.locked);

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_separate_clients_share_one_lock() {
    let Some(db) = TestDb::from_env() else { return };
    let a = db.connect().await;
    let b = db.connect().await;
    a.prepare().await.unwrap();
    b.prepare().await.unwrap();

    let mut handle_a = a.handle().await.unwrap();
    let mut handle_b = b.handle().await.unwrap();
    assert_eq!(
        handle_a.try_lock("proc-a", chrono::Utc::now()).await.unwrap(),
        LockAttempt::Acquired
    );
    match handle_b.try_lock("proc-b", chrono::Utc::now()).await.unwrap() {
        LockAttempt::Held(LockRecord { holder, .. }) => {
            assert_eq!(holder.as_deref(), Some("proc-a"))
        }
        other => panic!("second client acquired a held lock: {:?}", other),
    }
    assert!(handle_a.unlock("proc-a").await.unwrap());

    // Each client records its own unit; neither write may hide the other
    let first = vec![insert_named(ONE, "65b8077faddfba1bb64fa9fe", "one")];
    Migrator::new(a.clone(), &first).unwrap().up(Target::All).await.unwrap();
    Migrator::new(b.clone(), &one_and_two()).unwrap().up(Target::All).await.unwrap();

    let reopened = db.connect().await;
    let status = Migrator::new(reopened.clone(), &one_and_two())
        .unwrap()
        .status()
        .await
        .unwrap();
    assert_eq!(applied_ids(&status), vec![ONE, TWO]);

    db.cleanup(&reopened).await;
}

#[tokio::test]
async fn test_stale_lock_blocks_until_forced() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let migrator = Migrator::new(driver.clone(), &one_and_two()).unwrap();
    migrator.status().await.unwrap();

    let mut handle = driver.handle().await.unwrap();
    handle.try_lock("crashed-process", chrono::Utc::now()).await.unwrap();

    assert!(matches!(
        migrator.up(Target::All).await,
        Err(RunnerError::RunInProgress { .. })
    ));

    let previous = migrator.force_unlock().await.unwrap();
    assert_eq!(previous.holder.as_deref(), Some("crashed-process"));
    assert_eq!(migrator.up(Target::All).await.unwrap().processed.len(), 2);

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_down_all_reverses_in_descending_order() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let units: Vec<_> = ["20240101000000-a", "20240102000000-b", "20240103000000-c"]
        .into_iter()
        .map(|id| {
            let (order, calls) = (Arc::clone(&order), Arc::clone(&calls));
            MigrationUnit::new(
                id,
                |_db: &mut DocumentHandle| Box::pin(async { Ok(()) }),
                move |_db: &mut DocumentHandle| {
                    order.lock().push(id);
                    calls.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(()) })
                },
            )
        })
        .collect();

    let migrator = Migrator::new(driver.clone(), &units).unwrap();
    migrator.up(Target::All).await.unwrap();
    migrator.down(Target::All).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *order.lock(),
        vec!["20240103000000-c", "20240102000000-b", "20240101000000-a"]
    );
    assert!(migrator.status().await.unwrap().applied.is_empty());

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_json_script_directory() {
    let Some(db) = TestDb::from_env() else { return };
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(format!("{}.migration.json", ONE)),
        r#"{
            "up": [{"op": "insertOne", "collection": "test", "document": {"_id": {"$oid": "65b8077faddfba1bb64fa9fe"}, "name": "one"}}],
            "down": [{"op": "deleteOne", "collection": "test", "filter": {"_id": {"$oid": "65b8077faddfba1bb64fa9fe"}}}]
        }"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join(format!("{}.migration.json", TWO)),
        r#"{"up": [{"op": "updateMany", "collection": "test", "update": {"$set": {"seen": true}}}]}"#,
    )
    .unwrap();

    let driver = db.connect().await;
    let source = DirectorySource::for_driver::<DocumentDriver>(dir.path());
    let migrator = Migrator::new(driver.clone(), &source).unwrap();

    migrator.up(Target::All).await.unwrap();
    let mut handle = driver.handle().await.unwrap();
    let oid = ObjectId::parse_str("65b8077faddfba1bb64fa9fe").unwrap();
    let found = handle.collection("test").find_one(doc! { "_id": oid }).await.unwrap().unwrap();
    assert!(found.get_bool("seen").unwrap());

    // TWO has no down section
    let err = migrator.down(Target::Count(1)).await.unwrap_err();
    assert_eq!(err.failed_unit(), Some(TWO));

    let reconnected = db.connect().await;
    let status = Migrator::new(reconnected, &source).unwrap().status().await.unwrap();
    assert_eq!(applied_ids(&status), vec![ONE, TWO]);

    db.cleanup(&driver).await;
}

#[tokio::test]
async fn test_unit_timeout_releases_lock() {
    let Some(db) = TestDb::from_env() else { return };
    let driver = db.connect().await;
    let units = vec![MigrationUnit::new(
        ONE,
        |_db: &mut DocumentHandle| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
        },
        |_db: &mut DocumentHandle| Box::pin(async { Ok(()) }),
    )];
    let migrator = Migrator::new(driver.clone(), &units)
        .unwrap()
        .with_unit_timeout(Duration::from_millis(50));

    let err = migrator.up(Target::All).await.unwrap_err();
    assert!(format!("{:#}", err).contains("timeout"));
    assert!(!migrator.status().await.unwrap().lock.locked);

    db.cleanup(&driver).await;
}
