//! Document Backend Implementation
//!
//! Runs on the official MongoDB driver. A transactional handle owns a client
//! session with an open transaction, so a unit's writes and its migration
//! record commit together. Transactions need a replica set or sharded
//! cluster; against a standalone server the backend reports
//! `supports_atomicity = false` and rollback only logs.
//!
//! The run lock is a sentinel document swapped with `find_one_and_update`,
//! which the server applies atomically for every connected process.

mod collection;
mod commands;

pub use collection::{Collection, UpdateResult};
pub use commands::{parse_script, Command};

pub use bson::oid::ObjectId;
pub use bson::{doc, Bson, Document};

use std::sync::Arc;

use async_trait::async_trait;
use bson::Bson::Null;
use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::options::{ClientOptions, FindOneAndUpdateOptions, ReturnDocument, UpdateOptions};
use mongodb::{Client, ClientSession, Database};
use tracing::{debug, info, warn};

use super::StateTables;
use crate::driver::{Capabilities, Driver, DriverKind, Handle, LockAttempt, LockRecord, StoredRecord};
use crate::error::{DriverError, DriverResult};
use crate::migrations::definitions::MigrationRecord;

/// `_id` of the sentinel document in the lock collection
pub const LOCK_DOCUMENT_ID: &str = "run-lock";

const APP_NAME: &str = "groundwork";

/// Connection settings beyond the URL
#[derive(Debug, Clone, Default)]
pub struct DocumentDriverOptions {
    /// Database to migrate; defaults to the one named in the URL path
    pub database: Option<String>,
    pub tables: StateTables,
}

/// Document driver over a MongoDB client
#[derive(Clone)]
pub struct DocumentDriver {
    client: Client,
    database: Database,
    tables: Arc<StateTables>,
    transactions: bool,
}

impl std::fmt::Debug for DocumentDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDriver")
            .field("database", &self.database.name())
            .field("tables", &self.tables)
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}

impl DocumentDriver {
    /// Connect with default options; the URL must name a database
    pub async fn connect(url: &str) -> DriverResult<Self> {
        Self::connect_with(url, DocumentDriverOptions::default()).await
    }

    pub async fn connect_with(url: &str, options: DocumentDriverOptions) -> DriverResult<Self> {
        let tables = options.tables;
        if tables.migrations.is_empty() || tables.lock.is_empty() || tables.migrations == tables.lock {
            return Err(DriverError::Query(
                "State and lock collections must be distinct, non-empty names".to_string(),
            ));
        }

        let mut client_options = ClientOptions::parse(url)
            .await
            .map_err(|e| DriverError::Connection(format!("Invalid MongoDB URL: {}", e)))?;
        client_options.app_name = Some(APP_NAME.to_string());

        let name = options
            .database
            .or_else(|| client_options.default_database.clone())
            .ok_or_else(|| {
                DriverError::Connection(
                    "No database given: add it to the URL path or set `database`".to_string(),
                )
            })?;

        let client = Client::with_options(client_options)?;
        let database = client.database(&name);
        let transactions = check_server(&database).await?;

        debug!("Connected to MongoDB database {}", name);

        Ok(Self {
            client,
            database,
            tables: Arc::new(tables),
            transactions,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn tables(&self) -> &StateTables {
        &self.tables
    }

    fn new_handle(&self, session: Option<ClientSession>) -> DocumentHandle {
        DocumentHandle {
            database: self.database.clone(),
            tables: Arc::clone(&self.tables),
            session,
        }
    }
}

/// Refuse servers that cannot take writes and report whether multi-document
/// transactions are available
async fn check_server(database: &Database) -> DriverResult<bool> {
    let hello = database
        .run_command(doc! { "hello": 1 }, None)
        .await
        .map_err(|e| DriverError::Connection(format!("Failed to reach MongoDB: {}", e)))?;

    if hello.get_bool("secondary").unwrap_or(false) {
        return Err(DriverError::Connection(
            "Cannot migrate through a secondary MongoDB member".to_string(),
        ));
    }

    let replicated = hello.contains_key("setName") || hello.get_str("msg").ok() == Some("isdbgrid");
    if !replicated {
        warn!("MongoDB server is standalone; migrations will run without transactions");
    }
    Ok(replicated)
}

#[async_trait]
impl Driver for DocumentDriver {
    type Handle = DocumentHandle;

    const SCRIPT_EXTENSION: &'static str = "json";

    fn kind(&self) -> DriverKind {
        DriverKind::Document
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_atomicity: self.transactions,
        }
    }

    async fn prepare(&self) -> DriverResult<()> {
        // Collections cannot be created implicitly inside a transaction on
        // older servers, so both exist before any unit runs
        let existing = self.database.list_collection_names(None).await?;
        for name in [&self.tables.migrations, &self.tables.lock] {
            if !existing.contains(name) {
                self.database.create_collection(name, None).await?;
                info!("Created collection {}", name);
            }
        }

        self.database
            .collection::<Document>(&self.tables.lock)
            .update_one(
                doc! { "_id": LOCK_DOCUMENT_ID },
                doc! { "$setOnInsert": { "locked": false, "holder": Null, "acquired_at": Null } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    async fn handle(&self) -> DriverResult<DocumentHandle> {
        Ok(self.new_handle(None))
    }

    async fn begin(&self) -> DriverResult<DocumentHandle> {
        if !self.transactions {
            return Ok(self.new_handle(None));
        }
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        debug!("Beginning transaction");
        Ok(self.new_handle(Some(session)))
    }

    async fn commit(&self, handle: DocumentHandle) -> DriverResult<()> {
        match handle.session {
            Some(mut session) => session
                .commit_transaction()
                .await
                .map_err(|e| DriverError::TransactionAbort(format!("Failed to commit transaction: {}", e))),
            None => Ok(()),
        }
    }

    async fn rollback(&self, handle: DocumentHandle) -> DriverResult<()> {
        match handle.session {
            Some(mut session) => {
                debug!("Rolling back transaction");
                session
                    .abort_transaction()
                    .await
                    .map_err(|e| DriverError::TransactionAbort(format!("Failed to roll back transaction: {}", e)))
            }
            None => {
                warn!("No transaction to roll back; earlier writes of the unit remain");
                Ok(())
            }
        }
    }

    async fn close(&self) -> DriverResult<()> {
        // Connections are pooled per client and close when the last clone drops
        debug!("Closing MongoDB driver for {}", self.database.name());
        Ok(())
    }
}

/// Handle to a MongoDB database, either autocommit or inside a transaction
pub struct DocumentHandle {
    database: Database,
    tables: Arc<StateTables>,
    session: Option<ClientSession>,
}

impl DocumentHandle {
    pub fn collection(&mut self, name: &str) -> Collection<'_> {
        Collection::new(self.database.collection(name), self.session.as_mut())
    }

    pub async fn collection_names(&mut self) -> DriverResult<Vec<String>> {
        let names = match self.session.as_mut() {
            Some(session) => self.database.list_collection_names_with_session(None, session).await?,
            None => self.database.list_collection_names(None).await?,
        };
        Ok(names)
    }

    pub fn is_transactional(&self) -> bool {
        self.session.is_some()
    }

    async fn run_command(&mut self, command: Command) -> DriverResult<()> {
        debug!(collection = command.collection(), "exec_raw {:?}", command);
        match command {
            Command::InsertOne { collection, document } => {
                self.collection(&collection).insert_one(&document).await?;
            }
            Command::InsertMany { collection, documents } => {
                self.collection(&collection).insert_many(&documents).await?;
            }
            Command::UpdateOne { collection, filter, update } => {
                self.collection(&collection).update_one(filter, update).await?;
            }
            Command::UpdateMany { collection, filter, update } => {
                self.collection(&collection).update_many(filter, update).await?;
            }
            Command::DeleteOne { collection, filter } => {
                self.collection(&collection).delete_one(filter).await?;
            }
            Command::DeleteMany { collection, filter } => {
                self.collection(&collection).delete_many(filter).await?;
            }
            Command::CreateCollection { collection } => match self.session.as_mut() {
                Some(session) => {
                    self.database
                        .create_collection_with_session(&collection, None, session)
                        .await?
                }
                None => self.database.create_collection(&collection, None).await?,
            },
            Command::DropCollection { collection } => {
                self.collection(&collection).drop().await?;
            }
        }
        Ok(())
    }

    /// Lock writes never join the unit's transaction
    fn lock_collection(&self) -> mongodb::Collection<Document> {
        self.database.collection(&self.tables.lock)
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn lock_record(doc: &Document) -> LockRecord {
    LockRecord {
        locked: doc.get_bool("locked").unwrap_or(false),
        holder: doc.get_str("holder").ok().map(str::to_string),
        acquired_at: doc
            .get_str("acquired_at")
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

#[async_trait]
impl Handle for DocumentHandle {
    async fn exec_raw(&mut self, script: &str) -> DriverResult<()> {
        for command in parse_script(script)? {
            self.run_command(command).await?;
        }
        Ok(())
    }

    async fn applied_records(&mut self) -> DriverResult<Vec<StoredRecord>> {
        let migrations = self.tables.migrations.clone();
        let docs = self.collection(&migrations).find(doc! {}).await?;
        Ok(docs
            .iter()
            .map(|doc| StoredRecord {
                id: doc.get_str("id").unwrap_or_default().to_string(),
                applied_at: doc.get_str("applied_at").unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn insert_record(&mut self, record: &MigrationRecord) -> DriverResult<()> {
        let migrations = self.tables.migrations.clone();
        let doc = doc! {
            "_id": record.id.as_str(),
            "id": record.id.as_str(),
            "applied_at": format_timestamp(&record.applied_at),
        };
        self.collection(&migrations).insert_one(&doc).await?;
        Ok(())
    }

    async fn delete_record(&mut self, id: &str) -> DriverResult<bool> {
        let migrations = self.tables.migrations.clone();
        let deleted = self.collection(&migrations).delete_one(doc! { "_id": id }).await?;
        Ok(deleted > 0)
    }

    async fn try_lock(&mut self, holder: &str, at: DateTime<Utc>) -> DriverResult<LockAttempt> {
        let acquired = self
            .lock_collection()
            .find_one_and_update(
                doc! { "_id": LOCK_DOCUMENT_ID, "locked": false },
                doc! { "$set": { "locked": true, "holder": holder, "acquired_at": format_timestamp(&at) } },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await?;

        match acquired {
            Some(_) => Ok(LockAttempt::Acquired),
            None => Ok(LockAttempt::Held(self.lock_state().await?)),
        }
    }

    async fn unlock(&mut self, holder: &str) -> DriverResult<bool> {
        let result = self
            .lock_collection()
            .update_one(
                doc! { "_id": LOCK_DOCUMENT_ID, "locked": true, "holder": holder },
                doc! { "$set": { "locked": false, "holder": Null, "acquired_at": Null } },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn force_unlock(&mut self) -> DriverResult<()> {
        self.lock_collection()
            .update_one(
                doc! { "_id": LOCK_DOCUMENT_ID },
                doc! { "$set": { "locked": false, "holder": Null, "acquired_at": Null } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn lock_state(&mut self) -> DriverResult<LockRecord> {
        let sentinel = self
            .lock_collection()
            .find_one(doc! { "_id": LOCK_DOCUMENT_ID }, None)
            .await?;
        Ok(sentinel.as_ref().map(lock_record).unwrap_or_default())
    }
}
