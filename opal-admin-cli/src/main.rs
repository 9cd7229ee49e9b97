//! OPAL Administration CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use opal_core::{Oid, PersistenceConfig, Storage, StorageId, StorageRegistry, Value};

#[derive(Parser, Debug)]
#[command(name = "opal-admin")]
#[command(author = "OPAL Contributors")]
#[command(version = "0.1.0")]
#[command(about = "OPAL storage administration and inspection tool")]
struct Cli {
    /// Persistence configuration file
    #[arg(short, long, default_value = "opal.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open every configured storage, creating files and schemas
    Init,

    /// List root name bindings
    Roots {
        /// Restrict to one storage id
        #[arg(short, long)]
        storage: Option<String>,
    },

    /// Show an object's class, name and stored fields
    Object {
        /// `localId@storageId`, or a root name
        target: String,
    },

    /// Print a collection's contents
    Collection {
        /// `localId@storageId`, or a root name
        target: String,
    },

    /// Show per-class name counters
    Counters {
        /// Restrict to one storage id
        #[arg(short, long)]
        storage: Option<String>,
    },

    /// Re-open file storages, applying index repairs and migrations
    Repair,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PersistenceConfig::load(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => {
            let (registry, _codec) = config.open_registry()?;
            for id in registry.ids() {
                println!("opened storage '{}'", id);
            }
        }

        Commands::Roots { storage } => {
            let (registry, _codec) = config.open_registry()?;
            for storage in select_storages(&registry, storage.as_deref())? {
                let mut roots = Vec::new();
                for (name, oid) in storage.root_objects()? {
                    roots.push(json!({
                        "name": name,
                        "oid": oid.to_string(),
                        "class": storage.class_of(&oid)?,
                    }));
                }
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "storage": storage.id().as_str(),
                        "roots": roots,
                    }))?
                );
            }
        }

        Commands::Object { target } => {
            let (registry, _codec) = config.open_registry()?;
            let oid = resolve_target(&registry, &target)?;
            let storage = registry
                .get(oid.storage())
                .ok_or_else(|| anyhow!("unknown storage '{}'", oid.storage()))?;
            let fields: serde_json::Map<String, serde_json::Value> = storage
                .fields_of(&oid)?
                .into_iter()
                .map(|(field, value)| (field, value_json(&value)))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "oid": oid.to_string(),
                    "class": storage.class_of(&oid)?,
                    "name": storage.get_name_from_oid(&oid)?,
                    "fields": fields,
                }))?
            );
        }

        Commands::Collection { target } => {
            let (registry, _codec) = config.open_registry()?;
            let oid = resolve_target(&registry, &target)?;
            let storage = registry
                .get(oid.storage())
                .ok_or_else(|| anyhow!("unknown storage '{}'", oid.storage()))?;
            let class = storage.class_of(&oid)?;
            let contents = match class.as_str() {
                "list" => json!(storage
                    .get_list(&oid)?
                    .iter()
                    .map(value_json)
                    .collect::<Vec<_>>()),
                "set" => json!(storage
                    .get_set(&oid)?
                    .iter()
                    .map(value_json)
                    .collect::<Vec<_>>()),
                "map" => json!(storage
                    .get_map(&oid)?
                    .iter()
                    .map(|(k, v)| json!([value_json(k), value_json(v)]))
                    .collect::<Vec<_>>()),
                other => {
                    return Err(anyhow!(
                        "{} is a '{}' object, not a collection",
                        oid,
                        other
                    ))
                }
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "oid": oid.to_string(),
                    "kind": class,
                    "contents": contents,
                }))?
            );
        }

        Commands::Counters { storage } => {
            let (registry, _codec) = config.open_registry()?;
            for storage in select_storages(&registry, storage.as_deref())? {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "storage": storage.id().as_str(),
                        "counters": storage.name_counters()?,
                    }))?
                );
            }
        }

        Commands::Repair => {
            // File storages repair their indexes while opening:
            // duplicate names, stale counters, legacy name forms.
            let (registry, _codec) = config.open_registry()?;
            for id in registry.ids() {
                println!("checked storage '{}'", id);
            }
        }
    }

    Ok(())
}

fn select_storages(
    registry: &StorageRegistry,
    id: Option<&str>,
) -> Result<Vec<Arc<dyn Storage>>> {
    match id {
        Some(id) => {
            let id = StorageId::new(id);
            let storage = registry
                .get(&id)
                .ok_or_else(|| anyhow!("unknown storage '{}'", id))?;
            Ok(vec![storage])
        }
        None => Ok(registry
            .ids()
            .into_iter()
            .filter_map(|id| registry.get(&id))
            .collect()),
    }
}

/// Accepts either `localId@storageId` or a root name to search for.
fn resolve_target(registry: &StorageRegistry, target: &str) -> Result<Oid> {
    if let Some((local, storage)) = target.rsplit_once('@') {
        let id = StorageId::new(storage);
        if registry.get(&id).is_none() {
            return Err(anyhow!("unknown storage '{}'", storage));
        }
        return Ok(match local.parse::<u64>() {
            Ok(n) => Oid::numeric(id, n),
            Err(_) => Oid::text(id, local),
        });
    }
    for id in registry.ids() {
        if let Some(storage) = registry.get(&id) {
            if let Some(oid) = storage.get_oid_from_name(target)? {
                return Ok(oid);
            }
        }
    }
    Err(anyhow!("no object bound to name '{}'", target))
}

fn value_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Float(x) => json!(x),
        Value::Str(s) => json!(s),
        Value::Bytes(b) => json!(format!("{} bytes", b.len())),
        Value::Ref(oid) => json!(oid.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::{Codec, FsStorage};
    use tempfile::TempDir;

    fn registry_with_fs(dir: &TempDir) -> StorageRegistry {
        let registry = StorageRegistry::new();
        let codec = Codec::new(registry.clone());
        let storage = FsStorage::open(StorageId::new("fs0"), dir.path(), codec).unwrap();
        registry.register(Arc::new(storage)).unwrap();
        registry
    }

    #[test]
    fn test_resolve_target_forms() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with_fs(&dir);
        let storage = registry.get(&StorageId::new("fs0")).unwrap();
        let oid = storage.create_object("Person").unwrap();
        storage.bind_oid_to_name(&oid, "boss").unwrap();

        assert_eq!(resolve_target(&registry, "boss").unwrap(), oid);
        assert_eq!(
            resolve_target(&registry, &format!("{}@fs0", oid.local_id())).unwrap(),
            oid
        );
        assert!(resolve_target(&registry, "nobody").is_err());
        assert!(resolve_target(&registry, "1@nosuch").is_err());
    }

    #[test]
    fn test_value_json_shapes() {
        assert_eq!(value_json(&Value::Null), serde_json::Value::Null);
        assert_eq!(value_json(&Value::Int(3)), json!(3));
        assert_eq!(value_json(&Value::from("x")), json!("x"));
        assert_eq!(value_json(&Value::Bytes(vec![1, 2])), json!("2 bytes"));
    }
}
