//! Payload schema for synced tables.
//!
//! Sync itself only relies on a record's table, id and stamp. The schema
//! guards the fields the inventory screens read: every snapshot is checked
//! before it enters the mutation queue, so a payload that drifted from its
//! table's shape is refused at the mutation boundary instead of bouncing off
//! the remote later.

use crate::{error::Result, Error, Fields, Record, TableName};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// JSON shape a field value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Number,
    Flag,
    /// Anything, nested objects included
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::Text => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Flag => value.is_boolean(),
            FieldType::Any => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Flag => "flag",
            FieldType::Any => "any",
        }
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "flag",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub field_type: FieldType,
    /// Absent and `null` are both refused
    pub required: bool,
}

/// Declared fields of one table.
///
/// ```
/// use custody_engine::{FieldType, TableSchema};
///
/// let tools = TableSchema::new()
///     .require("status", FieldType::Text)
///     .allow("holder", FieldType::Text);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    fields: BTreeMap<String, FieldDef>,
    closed: bool,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.declare(name, field_type, true)
    }

    pub fn allow(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.declare(name, field_type, false)
    }

    /// Refuse fields that were not declared.
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    fn declare(mut self, name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        self.fields.insert(
            name.into(),
            FieldDef {
                field_type,
                required,
            },
        );
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    /// Check a field map. Declared fields are checked in name order, so the
    /// reported error is stable.
    pub fn validate(&self, fields: &Fields) -> Result<()> {
        for (name, def) in &self.fields {
            match fields.get(name) {
                None | Some(Value::Null) if def.required => {
                    return Err(Error::MissingRequiredField(name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) if !def.field_type.accepts(value) => {
                    return Err(Error::TypeMismatch {
                        field: name.clone(),
                        expected: def.field_type.as_str().to_string(),
                        got: shape_of(value).to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        if self.closed {
            if let Some(extra) = fields.keys().find(|name| !self.fields.contains_key(*name)) {
                return Err(Error::InvalidPayload(format!("undeclared field: {extra}")));
            }
        }
        Ok(())
    }
}

/// Table shapes for every synced table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    tables: HashMap<TableName, TableSchema>,
    /// Accept tables that have no entry
    permissive: bool,
}

impl Schema {
    /// Only declared tables may be written.
    pub fn strict() -> Self {
        Self {
            tables: HashMap::new(),
            permissive: false,
        }
    }

    /// Any table may be written; declared ones are still checked.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::strict()
        }
    }

    pub fn table(mut self, name: impl Into<TableName>, table: TableSchema) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Validate a record snapshot. Tombstones only need a known table.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        let table = match self.tables.get(&record.table) {
            Some(table) => table,
            None if self.permissive => return Ok(()),
            None => return Err(Error::TableNotFound(record.table.clone())),
        };
        if record.deleted {
            return Ok(());
        }
        table.validate(&record.fields)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::permissive()
    }
}
