//! Background eviction sweep.
//!
//! A dedicated thread periodically asks the coordinator to unload
//! collection proxies that have been idle past their configured limit,
//! keeping the in-memory mirrors bounded on long-running processes.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::coordinator::Coordinator;

/// Sweep interval used when the configuration does not override it.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(200);

/// Handle to the sweep thread. Dropping it stops the thread.
pub struct EvictionSweep {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionSweep {
    pub fn start(coordinator: Arc<Coordinator>, period: Duration) -> Self {
        let (shutdown, ticker) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            info!(period = ?period, "eviction sweep started");
            loop {
                match ticker.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        let unloaded = coordinator.sweep_once();
                        if unloaded > 0 {
                            debug!(unloaded, "eviction sweep unloaded idle collections");
                        }
                    }
                    // Sender dropped or explicit shutdown.
                    _ => break,
                }
            }
            info!("eviction sweep stopped");
        });
        EvictionSweep {
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }
}

impl Drop for EvictionSweep {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, StorageRegistry};
    use crate::coordinator::{NewObject, NewValue};
    use crate::fs_storage::FsStorage;
    use crate::oid::StorageId;
    use crate::schema::{ClassDescriptor, FieldDescriptor, SchemaRegistry};
    use crate::value::Value;
    use tempfile::TempDir;

    #[test]
    fn test_sweep_thread_unloads_idle_proxy() {
        let dir = TempDir::new().unwrap();
        let registry = StorageRegistry::new();
        let codec = Codec::new(registry.clone());
        let storage =
            FsStorage::open(StorageId::new("fs0"), dir.path(), codec.clone()).unwrap();
        registry.register(Arc::new(storage)).unwrap();
        let schema = SchemaRegistry::new();
        schema.register(ClassDescriptor::new("Doc").field(FieldDescriptor::list("tags")));

        let coord = Arc::new(Coordinator::new(
            registry,
            schema,
            codec,
            StorageId::new("fs0"),
        ));
        coord.set_max_idle("Doc", "tags", Duration::ZERO);

        let obj = NewObject::new("Doc");
        obj.set("tags", NewValue::List(vec![NewValue::Value(Value::from("t"))]));
        let oid = coord.make_persistent(&obj).unwrap();
        let live = coord.get_object(&oid).unwrap();
        let proxy = coord.collection_proxy(&live, "tags").unwrap();
        proxy.as_list().unwrap().to_vec().unwrap();
        assert!(proxy.is_loaded());

        let sweep = EvictionSweep::start(coord.clone(), Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while proxy.is_loaded() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!proxy.is_loaded());
        drop(sweep);
    }

    #[test]
    fn test_drop_stops_thread() {
        let dir = TempDir::new().unwrap();
        let registry = StorageRegistry::new();
        let codec = Codec::new(registry.clone());
        let storage =
            FsStorage::open(StorageId::new("fs0"), dir.path(), codec.clone()).unwrap();
        registry.register(Arc::new(storage)).unwrap();
        let coord = Arc::new(Coordinator::new(
            registry,
            SchemaRegistry::new(),
            codec,
            StorageId::new("fs0"),
        ));
        let sweep = EvictionSweep::start(coord, Duration::from_secs(3600));
        // Must return promptly even with a long period.
        drop(sweep);
    }
}
