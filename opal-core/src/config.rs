//! Runtime configuration.
//!
//! A JSON document declares the storages to open, which storage each
//! class lives on, and the eviction policy. [`PersistenceConfig::build`]
//! turns it into a wired [`Coordinator`] plus a running eviction sweep.
//!
//! ```json
//! {
//!   "storages": [
//!     { "kind": "file", "id": "fs0", "dir": "/var/lib/app/objects" },
//!     { "kind": "sqlite", "id": "db0", "path": "/var/lib/app/app.db" }
//!   ],
//!   "default_storage": "db0",
//!   "classes": [ { "class": "AuditEntry", "storage": "fs0" } ],
//!   "sweep_period_secs": 200,
//!   "max_idle": [ { "class": "Person", "field": "emails", "idle_secs": 600 } ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::codec::{Codec, CodecError, StorageRegistry};
use crate::coordinator::Coordinator;
use crate::eviction::{EvictionSweep, DEFAULT_SWEEP_PERIOD};
use crate::fs_storage::FsStorage;
use crate::oid::StorageId;
use crate::schema::SchemaRegistry;
use crate::sql_storage::{SqlStorage, SqliteDriver};
use crate::storage::{Storage, StorageError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration declares no storages")]
    NoStorages,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    File { id: String, dir: PathBuf },
    Sqlite { id: String, path: PathBuf },
}

impl StorageConfig {
    pub fn id(&self) -> &str {
        match self {
            StorageConfig::File { id, .. } => id,
            StorageConfig::Sqlite { id, .. } => id,
        }
    }
}

/// Pins all objects of a class to a specific storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassBinding {
    pub class: String,
    pub storage: String,
}

/// Idle limit for one collection field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxIdleRule {
    pub class: String,
    pub field: String,
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub storages: Vec<StorageConfig>,
    /// Storage for classes without an explicit binding. Defaults to
    /// the first declared storage.
    #[serde(default)]
    pub default_storage: Option<String>,
    #[serde(default)]
    pub classes: Vec<ClassBinding>,
    #[serde(default = "default_sweep_period_secs")]
    pub sweep_period_secs: u64,
    #[serde(default)]
    pub max_idle: Vec<MaxIdleRule>,
}

fn default_sweep_period_secs() -> u64 {
    DEFAULT_SWEEP_PERIOD.as_secs()
}

impl PersistenceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Opens every declared storage and registers it.
    pub fn open_registry(&self) -> Result<(StorageRegistry, Codec), ConfigError> {
        let registry = StorageRegistry::new();
        let codec = Codec::new(registry.clone());
        for declared in &self.storages {
            let storage: Arc<dyn Storage> = match declared {
                StorageConfig::File { id, dir } => Arc::new(FsStorage::open(
                    StorageId::new(id.clone()),
                    dir,
                    codec.clone(),
                )?),
                StorageConfig::Sqlite { id, path } => Arc::new(SqlStorage::new(
                    StorageId::new(id.clone()),
                    SqliteDriver::open(path)?,
                    codec.clone(),
                )?),
            };
            info!(id = %declared.id(), "opened storage");
            registry.register(storage)?;
        }
        Ok((registry, codec))
    }

    /// Wires the full runtime: storages, coordinator, eviction sweep.
    pub fn build(
        &self,
        schema: SchemaRegistry,
    ) -> Result<(Arc<Coordinator>, EvictionSweep), ConfigError> {
        let first = self.storages.first().ok_or(ConfigError::NoStorages)?;
        let default = self
            .default_storage
            .clone()
            .unwrap_or_else(|| first.id().to_string());

        let (registry, codec) = self.open_registry()?;
        let coordinator = Arc::new(Coordinator::new(
            registry,
            schema,
            codec,
            StorageId::new(default),
        ));
        for binding in &self.classes {
            coordinator.bind_class(binding.class.clone(), StorageId::new(binding.storage.clone()));
        }
        for rule in &self.max_idle {
            coordinator.set_max_idle(
                rule.class.clone(),
                rule.field.clone(),
                Duration::from_secs(rule.idle_secs),
            );
        }
        let sweep = EvictionSweep::start(
            coordinator.clone(),
            Duration::from_secs(self.sweep_period_secs),
        );
        Ok((coordinator, sweep))
    }
}
