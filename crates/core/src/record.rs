//! Typed record abstraction for the data-access boundary.
//!
//! Target and campaign records come from an external record provider as a
//! field map. `Record` gives that map a typed surface (string/bool/datetime
//! accessors, validated at the boundary) so pipeline code never reaches into
//! raw JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

/// A generic attribute map for a record of some module/kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Module/kind the record belongs to (e.g. "contacts", "prospects").
    pub module: String,
    /// Record identifier, as stored by the provider.
    pub id: String,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(module: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Raw field access.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String field, `None` when absent or null.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// String field that must be present and non-empty.
    pub fn require_str(&self, field: &str) -> DomainResult<&str> {
        match self.str_field(field) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(DomainError::validation(format!(
                "record {}/{} is missing field '{}'",
                self.module, self.id, field
            ))),
        }
    }

    /// Boolean field; absent/null reads as `false` (legacy flag columns).
    pub fn flag(&self, field: &str) -> bool {
        match self.fields.get(field) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// RFC 3339 datetime field.
    pub fn datetime_field(&self, field: &str) -> DomainResult<Option<DateTime<Utc>>> {
        match self.str_field(field) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| {
                    DomainError::validation(format!(
                        "record {}/{} field '{}' is not a datetime: {}",
                        self.module, self.id, field, e
                    ))
                }),
        }
    }
}
