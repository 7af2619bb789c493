//! Store descriptors and secondary index keys.
//!
//! A [`StoreDescriptor`] names a store and its indexes. Index key paths are
//! resolved against a whole [`Record`]: the reserved names `id`, `timestamp`,
//! `version`, `synced` and `deleted` address record metadata, anything else is
//! a dot path into the payload (optionally written with a `data.` prefix).

use crate::{error::Result, Error, Record, StoreName};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Bound;

/// The only supported primary key path.
pub const PRIMARY_KEY_PATH: &str = "id";

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    /// Index name, unique within its store
    pub name: String,
    /// Key path evaluated against each record
    pub key_path: String,
    /// Whether two live records may share a key
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index.
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::new(name, key_path)
        }
    }

    /// Compute this index's key for a record, if the record is indexed.
    pub fn key_for(&self, record: &Record) -> Option<IndexKey> {
        resolve_key_path(record, &self.key_path)
    }
}

/// Schema of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDescriptor {
    /// Store name
    pub name: StoreName,
    /// Primary key path
    pub key_path: String,
    /// Secondary indexes
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl StoreDescriptor {
    /// Create a descriptor keyed by `id` with no indexes.
    pub fn new(name: impl Into<StoreName>) -> Self {
        Self {
            name: name.into(),
            key_path: PRIMARY_KEY_PATH.to_string(),
            indexes: Vec::new(),
        }
    }

    /// Add an index (builder pattern).
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Get an index definition by name.
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Check the descriptor is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidSchema("store name must not be empty".into()));
        }
        if self.key_path != PRIMARY_KEY_PATH {
            return Err(Error::InvalidSchema(format!(
                "store '{}': primary key path must be '{}', got '{}'",
                self.name, PRIMARY_KEY_PATH, self.key_path
            )));
        }
        let mut seen = HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() || index.key_path.is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "store '{}': index name and key path must not be empty",
                    self.name
                )));
            }
            if !seen.insert(index.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "store '{}': duplicate index '{}'",
                    self.name, index.name
                )));
            }
        }
        Ok(())
    }
}

/// A float with a total order, so it can live in an index.
#[derive(Debug, Clone, Copy)]
pub struct KeyNumber(pub f64);

impl PartialEq for KeyNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyNumber {}

impl PartialOrd for KeyNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// An index key. Variants order as `Bool < Number < Text`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKey {
    Bool(bool),
    Number(KeyNumber),
    Text(String),
}

impl IndexKey {
    /// Convert a JSON scalar into a key. Null, arrays and objects are not indexable.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(IndexKey::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(|f| IndexKey::Number(KeyNumber(f))),
            serde_json::Value::String(s) => Some(IndexKey::Text(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKey::Bool(b) => write!(f, "{b}"),
            IndexKey::Number(n) => write!(f, "{}", n.0),
            IndexKey::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for IndexKey {
    fn from(v: bool) -> Self {
        IndexKey::Bool(v)
    }
}

impl From<f64> for IndexKey {
    fn from(v: f64) -> Self {
        IndexKey::Number(KeyNumber(v))
    }
}

impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        IndexKey::Number(KeyNumber(v as f64))
    }
}

impl From<u64> for IndexKey {
    fn from(v: u64) -> Self {
        IndexKey::Number(KeyNumber(v as f64))
    }
}

impl From<i32> for IndexKey {
    fn from(v: i32) -> Self {
        IndexKey::Number(KeyNumber(f64::from(v)))
    }
}

impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        IndexKey::Text(v.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(v: String) -> Self {
        IndexKey::Text(v)
    }
}

/// Resolve a key path against a record.
pub fn resolve_key_path(record: &Record, path: &str) -> Option<IndexKey> {
    match path {
        "id" => return Some(IndexKey::Text(record.id.clone())),
        "timestamp" => return Some(record.timestamp.into()),
        "version" => return Some(record.version.into()),
        "synced" => return Some(IndexKey::Bool(record.synced)),
        "deleted" => return Some(IndexKey::Bool(record.deleted)),
        _ => {}
    }

    let path = path.strip_prefix("data.").unwrap_or(path);
    let mut value = &record.data;
    for segment in path.split('.') {
        value = value.as_object()?.get(segment)?;
    }
    IndexKey::from_value(value)
}

/// A range over index keys, in the manner of `IDBKeyRange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<IndexKey>,
    upper: Bound<IndexKey>,
}

impl KeyRange {
    /// Match a single key.
    pub fn only(key: impl Into<IndexKey>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Keys at or above (or strictly above, if `open`) `key`.
    pub fn lower_bound(key: impl Into<IndexKey>, open: bool) -> Self {
        Self {
            lower: bound(key.into(), open),
            upper: Bound::Unbounded,
        }
    }

    /// Keys at or below (or strictly below, if `open`) `key`.
    pub fn upper_bound(key: impl Into<IndexKey>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(key.into(), open),
        }
    }

    /// Keys between `lower` and `upper`.
    pub fn bound(
        lower: impl Into<IndexKey>,
        upper: impl Into<IndexKey>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            lower: bound(lower.into(), lower_open),
            upper: bound(upper.into(), upper_open),
        }
    }

    /// Lower end of the range.
    pub fn lower(&self) -> &Bound<IndexKey> {
        &self.lower
    }

    /// Check whether `key` falls below the upper end.
    pub fn below_upper(&self, key: &IndexKey) -> bool {
        match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        }
    }

    /// Check whether `key` falls above the lower end.
    pub fn above_lower(&self, key: &IndexKey) -> bool {
        match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        }
    }

    /// Check whether `key` lies within the range.
    pub fn contains(&self, key: &IndexKey) -> bool {
        self.above_lower(key) && self.below_upper(key)
    }
}

fn bound(key: IndexKey, open: bool) -> Bound<IndexKey> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}
