//! Script commands accepted by the document handle's `exec_raw`
//!
//! A script is a JSON array of commands (a single command object is also
//! accepted). Values use MongoDB extended JSON, so `{"$oid": "..."}` is an
//! `ObjectId`:
//!
//! ```json
//! [
//!   {"op": "insertOne", "collection": "settings", "document": {"name": "one"}},
//!   {"op": "updateMany", "collection": "settings", "filter": {}, "update": {"$set": {"active": true}}},
//!   {"op": "deleteMany", "collection": "settings", "filter": {"name": "one"}}
//! ]
//! ```

use bson::{Bson, Document};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Command {
    InsertOne {
        collection: String,
        document: Document,
    },
    InsertMany {
        collection: String,
        documents: Vec<Document>,
    },
    UpdateOne {
        collection: String,
        #[serde(default)]
        filter: Document,
        update: Document,
    },
    UpdateMany {
        collection: String,
        #[serde(default)]
        filter: Document,
        update: Document,
    },
    DeleteOne {
        collection: String,
        #[serde(default)]
        filter: Document,
    },
    DeleteMany {
        collection: String,
        #[serde(default)]
        filter: Document,
    },
    CreateCollection {
        collection: String,
    },
    DropCollection {
        collection: String,
    },
}

impl Command {
    pub fn collection(&self) -> &str {
        match self {
            Command::InsertOne { collection, .. }
            | Command::InsertMany { collection, .. }
            | Command::UpdateOne { collection, .. }
            | Command::UpdateMany { collection, .. }
            | Command::DeleteOne { collection, .. }
            | Command::DeleteMany { collection, .. }
            | Command::CreateCollection { collection }
            | Command::DropCollection { collection } => collection,
        }
    }
}

/// Parse a command script
pub fn parse_script(script: &str) -> DriverResult<Vec<Command>> {
    let value: JsonValue = serde_json::from_str(script)
        .map_err(|e| DriverError::Query(format!("Invalid command script: {}", e)))?;

    let commands = match value {
        JsonValue::Array(items) => items,
        single @ JsonValue::Object(_) => vec![single],
        _ => {
            return Err(DriverError::Query(
                "Command script must be a JSON array or object".to_string(),
            ))
        }
    };

    commands
        .into_iter()
        .enumerate()
        .map(|(i, command)| {
            let invalid = |e: &dyn std::fmt::Display| DriverError::Query(format!("Invalid command #{}: {}", i + 1, e));
            let command = Bson::try_from(command).map_err(|e| invalid(&e))?;
            bson::from_bson(command).map_err(|e| invalid(&e))
        })
        .collect()
}
