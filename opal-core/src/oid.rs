//! Object identifiers.
//!
//! Every persistent object is identified by an [`Oid`]: a local key that
//! is unique within one storage, paired with the [`StorageId`] of the
//! storage that issued it. Keys are either numeric (SQL backends) or
//! free-form text (file backends may use either).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a configured storage backend.
///
/// Storage ids are non-empty strings; emptiness is rejected at
/// registration time so that the codec's `local@storage` form stays
/// unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(String);

impl StorageId {
    pub fn new(id: impl Into<String>) -> Self {
        StorageId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageId {
    fn from(s: &str) -> Self {
        StorageId(s.to_string())
    }
}

impl From<String> for StorageId {
    fn from(s: String) -> Self {
        StorageId(s)
    }
}

/// The storage-local part of an [`Oid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OidKey {
    Num(u64),
    Text(String),
}

impl fmt::Display for OidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OidKey::Num(n) => write!(f, "{n}"),
            OidKey::Text(s) => f.write_str(s),
        }
    }
}

/// Storage-scoped object identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid {
    storage: StorageId,
    key: OidKey,
}

impl Oid {
    pub fn numeric(storage: StorageId, id: u64) -> Self {
        Oid {
            storage,
            key: OidKey::Num(id),
        }
    }

    pub fn text(storage: StorageId, id: impl Into<String>) -> Self {
        Oid {
            storage,
            key: OidKey::Text(id.into()),
        }
    }

    pub fn storage(&self) -> &StorageId {
        &self.storage
    }

    pub fn key(&self) -> &OidKey {
        &self.key
    }

    /// The storage-local id rendered as a string, without the storage
    /// qualifier. This is the form stored on disk and in SQL rows.
    pub fn local_id(&self) -> String {
        self.key.to_string()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_display() {
        let oid = Oid::numeric(StorageId::new("s0"), 42);
        assert_eq!(oid.to_string(), "42@s0");
        assert_eq!(oid.local_id(), "42");

        let oid = Oid::text(StorageId::new("fs"), "person#3");
        assert_eq!(oid.to_string(), "person#3@fs");
    }

    #[test]
    fn test_oid_equality_covers_storage() {
        let a = Oid::numeric(StorageId::new("s0"), 1);
        let b = Oid::numeric(StorageId::new("s1"), 1);
        assert_ne!(a, b);
        assert_eq!(a, Oid::numeric(StorageId::new("s0"), 1));
    }
}
