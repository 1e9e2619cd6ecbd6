/*!
Persisted ledger of applied migrations.

The ledger is an ordinary collection in the live store, so it travels with
dumps: restoring an older backup also restores the ledger that matches its
data, and the runner then re-applies the newer steps.
*/

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MigrationVersion;
use crate::document::{Document, DocumentStore};
use crate::{Result, TidemarkError};

/// Collection holding one record per applied migration
pub const LEDGER_COLLECTION: &str = "migrations";

/// Proof that a migration was applied; immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: MigrationVersion,
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn now(version: MigrationVersion) -> Self {
        Self {
            version,
            applied_at: Utc::now(),
        }
    }

    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(document) => Ok(document),
            other => Err(TidemarkError::storage(format!(
                "Migration record serialized to non-object {other}"
            ))),
        }
    }
}

/// Applied versions and when each was applied
pub fn read_applied(store: &dyn DocumentStore) -> Result<BTreeMap<MigrationVersion, DateTime<Utc>>> {
    let mut applied = BTreeMap::new();
    for document in store.documents(LEDGER_COLLECTION)? {
        let record: MigrationRecord =
            serde_json::from_value(Value::Object(document)).map_err(|e| {
                TidemarkError::storage(format!("Malformed record in migration ledger: {e}"))
            })?;
        applied.entry(record.version).or_insert(record.applied_at);
    }
    Ok(applied)
}

/// Append a record to the ledger
pub fn append(store: &dyn DocumentStore, record: &MigrationRecord) -> Result<()> {
    store.insert(LEDGER_COLLECTION, record.to_document()?)
}
