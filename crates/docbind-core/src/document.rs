//! Document model - identifiers, revision tokens and field mappings.
//!
//! A [`Document`] is a mapping of field names to JSON values plus the
//! metadata owned by the storage engine: the immutable id, the revision
//! token used for optimistic concurrency, the deletion marker and the list
//! of conflicting revisions. The metadata never leaks into the field data
//! handed to collaborators; see [`strip_reserved`].

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use ulid::Ulid;

/// Field data of a document.
pub type Fields = Map<String, Value>;

/// Wire name of the document id.
pub const ID_FIELD: &str = "_id";
/// Wire name of the revision token.
pub const REV_FIELD: &str = "_rev";
/// Wire name of the deletion marker.
pub const DELETED_FIELD: &str = "_deleted";
/// Wire name of the conflict list.
pub const CONFLICTS_FIELD: &str = "_conflicts";

/// Field names owned by the storage engine.
pub const RESERVED_FIELDS: [&str; 4] = [ID_FIELD, REV_FIELD, DELETED_FIELD, CONFLICTS_FIELD];

/// Remove every reserved metadata key from a field mapping.
pub fn strip_reserved(fields: &mut Fields) {
    for key in RESERVED_FIELDS {
        fields.remove(key);
    }
}

/// Copy of `fields` without reserved metadata keys.
pub fn without_reserved(fields: &Fields) -> Fields {
    fields
        .iter()
        .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Unique identifier for a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque revision token of the form `<generation>-<digest>`.
///
/// Ordering is the engine-native one: by generation, then by digest.
/// Tokens that do not carry a numeric generation sort as generation zero.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(generation: u64, digest: impl AsRef<str>) -> Self {
        Self(format!("{}-{}", generation, digest.as_ref()))
    }

    /// Wrap a raw token as produced by an engine.
    pub fn parse(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn generation(&self) -> u64 {
        self.0
            .split_once('-')
            .and_then(|(gen, _)| gen.parse().ok())
            .unwrap_or(0)
    }

    pub fn digest(&self) -> &str {
        match self.0.split_once('-') {
            Some((gen, digest)) if gen.parse::<u64>().is_ok() => digest,
            _ => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.digest().cmp(other.digest()))
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// A stored document: field data plus engine-owned metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocumentId,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    #[serde(rename = "_conflicts", default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Revision>,

    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    /// Create a document without a revision, i.e. a creation attempt.
    pub fn new(id: impl Into<DocumentId>, fields: Fields) -> Self {
        let mut fields = fields;
        strip_reserved(&mut fields);
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            conflicts: Vec::new(),
            fields,
        }
    }

    pub fn with_revision(mut self, rev: Option<Revision>) -> Self {
        self.rev = rev;
        self
    }

    /// A deletion marker targeting `rev`.
    pub fn tombstone(id: impl Into<DocumentId>, rev: Revision) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev),
            deleted: true,
            conflicts: Vec::new(),
            fields: Fields::new(),
        }
    }

    /// Field data with any reserved keys removed.
    pub fn data(&self) -> Fields {
        without_reserved(&self.fields)
    }

    pub fn first_conflict(&self) -> Option<&Revision> {
        self.conflicts.first()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Wire representation: `{"_id", "_rev"?, "_deleted"?, "_conflicts"?, ...fields}`.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(StoreError::Serialization(format!(
                "expected a JSON object, found {}",
                value
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}
