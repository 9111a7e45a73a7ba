// Record model - identity, payload, chain linkage and read-side query params

use crate::error::{Result, StoreError};
use crate::hash;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Every field mapped on a record, in column order.
pub const ALL_FIELDS: &[&str] = &[
    "id",
    "creator_id",
    "owner_id",
    "partition_id",
    "key",
    "value",
    "hash",
    "peer_hash",
    "prev_hash",
    "timestamp",
    "query_params",
];

/// Fields that are never persisted or used as filters.
pub const BLACKLISTED_FIELDS: &[&str] = &["query_params"];

/// Persistable fields: all mapped fields minus the blacklist.
pub fn valid_fields() -> Vec<&'static str> {
    ALL_FIELDS
        .iter()
        .copied()
        .filter(|f| !BLACKLISTED_FIELDS.contains(f))
        .collect()
}

/// A raw SQL predicate with positional `?` arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expr {
    pub expr: String,
    pub args: Vec<Value>,
}

impl Expr {
    pub fn new(expr: impl Into<String>, args: Vec<Value>) -> Self {
        Expr {
            expr: expr.into(),
            args,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expr.trim().is_empty()
    }
}

/// Read-side parameters carried on a filter record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryParams {
    /// Replaces the record-derived equality filter when set.
    pub expr: Option<Expr>,
    pub key_starts_with: Option<String>,
    /// Raw ORDER BY clause, e.g. `key desc`.
    pub order_by: Option<String>,
    pub limit: Option<u64>,
}

/// A single content-hashed, append-only unit of persisted data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub partition_id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub peer_hash: String,
    #[serde(default)]
    pub prev_hash: String,
    /// Creation time in unix nanoseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(skip)]
    pub query_params: QueryParams,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Record {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// A filter record that only carries query parameters.
    pub fn with_params(query_params: QueryParams) -> Self {
        Record {
            query_params,
            ..Default::default()
        }
    }

    /// Assign an id and creation timestamp. Values already set are kept.
    pub fn init(&mut self) -> &mut Self {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.timestamp == 0 {
            self.timestamp = now_nanos();
        }
        self
    }

    pub fn compute_hash(&mut self) -> &mut Self {
        self.hash = hash::content_hash(self);
        self
    }

    /// Set `peer_hash` to the link between this record and `next_hash`.
    pub fn compute_peer_hash(&mut self, next_hash: &str) -> Result<&mut Self> {
        if self.hash.is_empty() {
            return Err(StoreError::MissingHash);
        }
        self.peer_hash = hash::peer_hash(&self.hash, next_hash);
        Ok(self)
    }

    pub fn query_params(&self) -> &QueryParams {
        &self.query_params
    }

    pub fn query_params_mut(&mut self) -> &mut QueryParams {
        &mut self.query_params
    }

    /// Persistable fields and their values, in `valid_fields()` order.
    pub fn field_values(&self) -> Vec<(&'static str, Value)> {
        valid_fields()
            .into_iter()
            .filter_map(|name| self.field_value(name).map(|v| (name, v)))
            .collect()
    }

    /// Fields holding a non-zero value, used for query-by-example filters.
    pub fn non_zero_fields(&self) -> Vec<(&'static str, Value)> {
        self.field_values()
            .into_iter()
            .filter(|(_, v)| match v {
                Value::Text(s) => !s.is_empty(),
                Value::Integer(n) => *n != 0,
                _ => false,
            })
            .collect()
    }

    fn field_value(&self, name: &str) -> Option<Value> {
        let text = |s: &String| Some(Value::Text(s.clone()));
        match name {
            "id" => text(&self.id),
            "creator_id" => text(&self.creator_id),
            "owner_id" => text(&self.owner_id),
            "partition_id" => text(&self.partition_id),
            "key" => text(&self.key),
            "value" => text(&self.value),
            "hash" => text(&self.hash),
            "peer_hash" => text(&self.peer_hash),
            "prev_hash" => text(&self.prev_hash),
            "timestamp" => Some(Value::Integer(self.timestamp)),
            _ => None,
        }
    }

    /// Build a record from a row selected with the persistable columns.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Record {
            id: row.get("id")?,
            creator_id: row.get("creator_id")?,
            owner_id: row.get("owner_id")?,
            partition_id: row.get("partition_id")?,
            key: row.get("key")?,
            value: row.get("value")?,
            hash: row.get("hash")?,
            peer_hash: row.get("peer_hash")?,
            prev_hash: row.get("prev_hash")?,
            timestamp: row.get("timestamp")?,
            query_params: QueryParams::default(),
        })
    }
}

fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}
