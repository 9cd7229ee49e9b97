//! Storage abstraction.
//!
//! A [`Storage`] owns the durable state of a set of objects: their
//! fields, their collections, their class tags, and the root-name
//! bindings used to bootstrap object graphs. Two backends implement
//! the trait in this crate: [`crate::fs_storage::FsStorage`] and
//! [`crate::sql_storage::SqlStorage`].
//!
//! All methods are synchronous and blocking. Implementations must be
//! safe to share behind an `Arc` across threads.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::codec::CodecError;
use crate::oid::{Oid, StorageId};
use crate::schema::{ClassDescriptor, FieldDescriptor, SchemaRegistry};
use crate::value::Value;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no such object: {0}")]
    NoSuchOid(Oid),
    #[error("no object bound to name '{0}'")]
    NoSuchName(String),
    #[error("index {index} out of bounds for collection {cid} of size {size}")]
    IndexOutOfBounds { cid: Oid, index: u64, size: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQL error: {0}")]
    Sql(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("storage is closed")]
    Closed,
    #[error("corrupt storage state: {0}")]
    Corrupt(String),
}

/// A pluggable persistence backend.
pub trait Storage: Send + Sync {
    /// Identifier of this storage, unique within the registry.
    fn id(&self) -> &StorageId;

    // --- object lifecycle ---

    /// Allocates a fresh OID and records `class` as its class tag.
    fn create_object(&self, class: &str) -> Result<Oid>;

    /// Removes the object's fields, class tag and name bindings.
    /// Collections referenced by the object are separate objects and
    /// are not cascaded.
    fn delete_object(&self, oid: &Oid) -> Result<()>;

    /// Class tag recorded at creation time.
    fn class_of(&self, oid: &Oid) -> Result<String>;

    // --- fields ---

    fn set_field(&self, oid: &Oid, field: &str, value: &Value) -> Result<()>;

    /// Overwrites an existing field; falls back to creating it when the
    /// object has no stored value for `field` yet.
    fn update_field(&self, oid: &Oid, field: &str, value: &Value) -> Result<()>;

    /// `None` when the field was never written.
    fn get_field(&self, oid: &Oid, field: &str) -> Result<Option<Value>>;

    /// Batch fetch, positionally aligned with `fields`. Non-persisted
    /// descriptors yield `None` without touching the backend.
    fn get_fields(&self, oid: &Oid, fields: &[&FieldDescriptor]) -> Result<Vec<Option<Value>>>;

    fn remove_field(&self, oid: &Oid, field: &str) -> Result<()>;

    /// Every stored field of the object, for inspection tooling.
    fn fields_of(&self, oid: &Oid) -> Result<Vec<(String, Value)>>;

    // --- lists ---

    fn add_to_list(&self, cid: &Oid, value: &Value) -> Result<()>;

    fn insert_into_list(&self, cid: &Oid, index: u64, value: &Value) -> Result<()>;

    fn get_list(&self, cid: &Oid) -> Result<Vec<Value>>;

    fn get_list_item(&self, cid: &Oid, index: u64) -> Result<Value>;

    fn set_list_item(&self, cid: &Oid, index: u64, value: &Value) -> Result<()>;

    fn remove_list_index(&self, cid: &Oid, index: u64) -> Result<()>;

    /// Removes the first occurrence of `value`, if any.
    fn remove_list_value(&self, cid: &Oid, value: &Value) -> Result<()>;

    /// Index of the first occurrence, or -1.
    fn list_index_of(&self, cid: &Oid, value: &Value) -> Result<i64>;

    /// Index of the last occurrence, or -1.
    fn list_last_index_of(&self, cid: &Oid, value: &Value) -> Result<i64>;

    fn list_contains(&self, cid: &Oid, value: &Value) -> Result<bool>;

    fn list_size(&self, cid: &Oid) -> Result<u64>;

    fn clear_list(&self, cid: &Oid) -> Result<()>;

    // --- sets ---

    /// Returns false when the value was already present.
    fn add_to_set(&self, cid: &Oid, value: &Value) -> Result<bool>;

    /// Returns false when the value was absent.
    fn remove_from_set(&self, cid: &Oid, value: &Value) -> Result<bool>;

    fn get_set(&self, cid: &Oid) -> Result<Vec<Value>>;

    fn set_contains(&self, cid: &Oid, value: &Value) -> Result<bool>;

    fn set_size(&self, cid: &Oid) -> Result<u64>;

    fn clear_set(&self, cid: &Oid) -> Result<()>;

    // --- maps ---

    /// Returns the value previously bound to `key`, if any.
    fn put_in_map(&self, cid: &Oid, key: &Value, value: &Value) -> Result<Option<Value>>;

    fn get_from_map(&self, cid: &Oid, key: &Value) -> Result<Option<Value>>;

    fn get_map(&self, cid: &Oid) -> Result<Vec<(Value, Value)>>;

    fn map_contains_key(&self, cid: &Oid, key: &Value) -> Result<bool>;

    fn map_contains_value(&self, cid: &Oid, value: &Value) -> Result<bool>;

    /// Returns the removed value, if the key was bound.
    fn remove_from_map(&self, cid: &Oid, key: &Value) -> Result<Option<Value>>;

    fn map_size(&self, cid: &Oid) -> Result<u64>;

    fn clear_map(&self, cid: &Oid) -> Result<()>;

    // --- naming ---

    /// Generates a fresh unique name of the form `shortclass#N` using a
    /// per-class counter.
    fn new_name(&self, class: &str) -> Result<String>;

    fn get_oid_from_name(&self, name: &str) -> Result<Option<Oid>>;

    fn get_name_from_oid(&self, oid: &Oid) -> Result<Option<String>>;

    fn bind_oid_to_name(&self, oid: &Oid, name: &str) -> Result<()>;

    fn delete_name(&self, name: &str) -> Result<()>;

    /// Snapshot of the per-class name counters.
    fn name_counters(&self) -> Result<BTreeMap<String, u64>>;

    /// Merges external counters, keeping the maximum per class. Used
    /// when migrating objects between storages.
    fn update_name_counters(&self, counters: &BTreeMap<String, u64>) -> Result<()>;

    // --- queries ---

    /// OIDs of all objects whose class tag is one of `classes`.
    fn objects_of_classes(&self, classes: &[String]) -> Result<Vec<Oid>>;

    /// OIDs of `class` and all its registered subclasses.
    fn objects_of_class(
        &self,
        class: &ClassDescriptor,
        schema: &SchemaRegistry,
    ) -> Result<Vec<Oid>> {
        self.objects_of_classes(&schema.class_and_subclasses(&class.name))
    }

    /// All objects reachable by name, i.e. the storage's roots.
    fn root_objects(&self) -> Result<Vec<(String, Oid)>>;

    // --- lifecycle / transactions ---

    fn close(&self) -> Result<()>;

    fn start_transaction(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;
}

/// Strips package or module qualifiers from a class name. Handles both
/// `a::b::C` and `a.b.C` forms.
pub fn short_class_name(class: &str) -> &str {
    let after_path = match class.rfind("::") {
        Some(pos) => &class[pos + 2..],
        None => class,
    };
    match after_path.rfind('.') {
        Some(pos) => &after_path[pos + 1..],
        None => after_path,
    }
}

/// `person#3` style generated names.
pub(crate) fn format_name(class: &str, counter: u64) -> String {
    format!("{}#{}", short_class_name(class).to_lowercase(), counter)
}

/// Extracts the counter from a generated name, `None` for names that
/// were bound explicitly.
pub(crate) fn name_counter_suffix(name: &str) -> Option<(&str, u64)> {
    let (prefix, digits) = name.rsplit_once('#')?;
    digits.parse::<u64>().ok().map(|n| (prefix, n))
}
