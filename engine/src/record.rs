//! Record types for storing data.

use crate::{RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque field map of a record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Identity of a record: `(table, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: TableName,
    pub id: RecordId,
}

impl RecordKey {
    pub fn new(table: impl Into<TableName>, id: impl Into<RecordId>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// A domain entity (tool, chemical, checkout, audit entry, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Table this record belongs to
    pub table: TableName,
    /// Identifier, unique within the table
    pub id: RecordId,
    /// Domain fields, opaque to the engine
    #[serde(default)]
    pub fields: Fields,
    /// Last write time (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Create a new live record.
    pub fn new(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        fields: Fields,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            fields,
            updated_at,
            deleted: false,
        }
    }

    /// Create a tombstone with no fields.
    pub fn tombstone(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            fields: Fields::new(),
            updated_at,
            deleted: true,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Mark record as deleted (tombstone). Fields are kept for the audit log.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.updated_at = timestamp;
    }

    /// Replace the field map.
    pub fn update_fields(&mut self, fields: Fields, timestamp: Timestamp) {
        self.fields = fields;
        self.updated_at = timestamp;
    }

    /// Same content and stamp; used to detect no-op pulls.
    pub fn same_version(&self, other: &Record) -> bool {
        self.updated_at == other.updated_at
            && self.deleted == other.deleted
            && (self.deleted || self.fields == other.fields)
    }
}
