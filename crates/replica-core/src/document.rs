//! Document and Revision: the unit of replication.
//!
//! A document is an opaque JSON object body with a stable id, a revision
//! marker, and a mutation timestamp. The sync core never interprets the body
//! beyond field-level comparison for conflict classification and merging.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Stable document identifier.
pub type DocId = String;

/// Field name → value. Backed by a BTreeMap, so serialization is canonical.
pub type Body = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RevisionParseError {
    #[error("Invalid revision format: {0} (expected <seq>-<hash>)")]
    InvalidFormat(String),
    #[error("Invalid revision sequence: {0}")]
    InvalidSeq(#[from] std::num::ParseIntError),
}

/// Revision marker, advanced on every accepted write.
///
/// Displays as `"{seq}-{hash}"`. The hash is a digest of the sequence number
/// and the document content, so two replicas that independently reach the
/// same content at the same sequence agree on the revision. Revisions are
/// compared by equality only; `seq` is informational ordering within a
/// single replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    seq: u64,
    hash: String,
}

impl Revision {
    pub fn new(seq: u64, hash: impl Into<String>) -> Self {
        Self {
            seq,
            hash: hash.into(),
        }
    }

    /// Revision of the first write of a document.
    pub fn initial(body: &Body, deleted: bool) -> Self {
        Self::compute(1, body, deleted)
    }

    /// Revision that follows this one for the given new content.
    pub fn next(&self, body: &Body, deleted: bool) -> Self {
        Self::compute(self.seq + 1, body, deleted)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    fn compute(seq: u64, body: &Body, deleted: bool) -> Self {
        let canonical = serde_json::to_string(body).unwrap_or_default();
        let digest = fnv1a_hash(&format!("{}|{}|{}", seq, deleted, canonical));
        Self {
            seq,
            hash: format!("{:016x}", digest),
        }
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.seq, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionParseError::InvalidFormat(s.to_string()))?;
        if hash.is_empty() {
            return Err(RevisionParseError::InvalidFormat(s.to_string()));
        }
        Ok(Self {
            seq: seq.parse()?,
            hash: hash.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A replicated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocId,
    /// `None` until the document has been accepted by a store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Last mutation time, milliseconds since Unix epoch.
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Body,
}

impl Document {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            updated_at: 0,
            deleted: false,
            body: Body::new(),
        }
    }

    /// Build a document from a JSON object. Non-object values produce an empty body.
    pub fn from_json(id: impl Into<DocId>, body: Value) -> Self {
        let mut doc = Self::new(id);
        if let Value::Object(map) = body {
            doc.body = map;
        }
        doc
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.body.insert(key.into(), value.into());
    }

    /// Apply a partial update: each key in `delta` replaces the field, `null` removes it.
    pub fn apply_delta(&mut self, delta: &Body) {
        for (key, value) in delta {
            if value.is_null() {
                self.body.remove(key);
            } else {
                self.body.insert(key.clone(), value.clone());
            }
        }
    }

    /// The revision this document carries, as a display string (for logs).
    pub fn rev_string(&self) -> String {
        self.rev
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "<new>".to_string())
    }

    /// Names of the fields whose value differs between `self` and `other`
    /// (including fields present on only one side).
    pub fn changed_fields(&self, other: &Document) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (key, value) in &self.body {
            if other.body.get(key) != Some(value) {
                changed.insert(key.clone());
            }
        }
        for key in other.body.keys() {
            if !self.body.contains_key(key) {
                changed.insert(key.clone());
            }
        }
        changed
    }

    /// Same content, ignoring revision and timestamp.
    pub fn same_content(&self, other: &Document) -> bool {
        self.deleted == other.deleted && self.body == other.body
    }

    /// Stable digest of the content (body + deleted flag).
    pub fn fingerprint(&self) -> u64 {
        let canonical = serde_json::to_string(&self.body).unwrap_or_default();
        fnv1a_hash(&format!("{}|{}", self.deleted, canonical))
    }
}

/// FNV-1a hash. Stable across Rust versions (unlike DefaultHasher), which
/// matters because it ends up in persisted revisions.
pub(crate) fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
