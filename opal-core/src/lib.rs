//! OPAL Core Library
//!
//! The persistence core of the OPAL object framework:
//! - Storage-scoped object identifiers (OIDs)
//! - Typed value model and string value codec
//! - Pluggable `Storage` trait with two reference backends
//!   (flat files and SQL)
//! - Lazy, cached collection proxies (list, set, map)
//! - Identity map / persistence coordinator
//! - Idle-based eviction sweep bounding cache memory
//!
//! The method-interception layer that decides *when* a tracked access
//! should hit persistence lives outside this crate; it drives the
//! coordinator and proxy entry points defined here.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod eviction;
pub mod fs_storage;
pub mod oid;
pub mod proxy;
pub mod schema;
pub mod sql_storage;
pub mod storage;
pub mod value;

#[cfg(test)]
mod equivalence_tests;

pub use codec::{Codec, CodecError, StorageRegistry, StringConverter};
pub use config::{ClassBinding, ConfigError, MaxIdleRule, PersistenceConfig, StorageConfig};
pub use coordinator::{Coordinator, LiveObject, NewObject, NewValue, PersistenceError};
pub use eviction::EvictionSweep;
pub use fs_storage::FsStorage;
pub use oid::{Oid, OidKey, StorageId};
pub use proxy::{CollectionProxy, ListOp, ListProxy, MapOp, MapProxy, OpOutcome, SetOp, SetProxy};
pub use schema::{ClassDescriptor, CollectionKind, FieldDescriptor, FieldKind, SchemaRegistry};
pub use sql_storage::{SqlDriver, SqlStorage, SqliteDriver};
pub use storage::{Result, Storage, StorageError};
pub use value::Value;
