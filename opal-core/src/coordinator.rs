//! Persistence coordinator.
//!
//! The coordinator owns the identity map: at most one [`LiveObject`]
//! exists per OID at any time, so reference equality of live objects
//! mirrors identity in storage. It mediates every field access,
//! resolves references lazily, hands out collection proxies, and turns
//! transient object graphs into storage rows via [`NewObject`].
//!
//! Cyclic graphs are handled by registering identity (the OID) before
//! populating or persisting fields, so a cycle terminates at the
//! already-known OID instead of recursing forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::codec::{Codec, StorageRegistry};
use crate::oid::{Oid, StorageId};
use crate::proxy::CollectionProxy;
use crate::schema::{ClassDescriptor, FieldKind, SchemaRegistry};
use crate::storage::{Storage, StorageError};
use crate::value::Value;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("an object is already registered for {0}")]
    AlreadyRegistered(Oid),
    #[error("no storage registered with id '{0}'")]
    UnknownStorage(StorageId),
    #[error("no class descriptor registered for '{0}'")]
    UnknownClass(String),
    #[error("class '{class}' has no field '{field}'")]
    UnknownField { class: String, field: String },
    #[error("field '{field}' cannot hold {reason}")]
    InvalidValue { field: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

type Result<T> = std::result::Result<T, PersistenceError>;

/// In-memory face of one persistent object.
///
/// Primitive and reference fields are cached as [`Value`]s; collection
/// fields are reachable only through their proxies.
pub struct LiveObject {
    oid: Oid,
    class: String,
    fields: Mutex<HashMap<String, Value>>,
    collections: Mutex<HashMap<String, Arc<CollectionProxy>>>,
}

impl LiveObject {
    fn new(oid: Oid, class: String) -> Self {
        LiveObject {
            oid,
            class,
            fields: Mutex::new(HashMap::new()),
            collections: Mutex::new(HashMap::new()),
        }
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn cached_field(&self, field: &str) -> Option<Value> {
        self.fields.lock().unwrap().get(field).cloned()
    }

    pub fn collection(&self, field: &str) -> Option<Arc<CollectionProxy>> {
        self.collections.lock().unwrap().get(field).cloned()
    }

    fn collections_snapshot(&self) -> Vec<(String, Arc<CollectionProxy>)> {
        self.collections
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A transient object graph waiting to be persisted.
///
/// Fields are set after construction so graphs with cycles can be
/// assembled from `Arc` clones before the first [`Coordinator::
/// make_persistent`] call.
pub struct NewObject {
    class: String,
    name: Option<String>,
    oid: Mutex<Option<Oid>>,
    fields: Mutex<Vec<(String, NewValue)>>,
}

impl NewObject {
    pub fn new(class: impl Into<String>) -> Arc<Self> {
        Arc::new(NewObject {
            class: class.into(),
            name: None,
            oid: Mutex::new(None),
            fields: Mutex::new(Vec::new()),
        })
    }

    /// Like [`NewObject::new`] but bound to an explicit root name
    /// instead of a generated one.
    pub fn named(class: impl Into<String>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(NewObject {
            class: class.into(),
            name: Some(name.into()),
            oid: Mutex::new(None),
            fields: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, field: impl Into<String>, value: NewValue) {
        self.fields.lock().unwrap().push((field.into(), value));
    }

    /// The OID assigned by `make_persistent`, once persisted.
    pub fn oid(&self) -> Option<Oid> {
        self.oid.lock().unwrap().clone()
    }
}

/// Field initializer for a [`NewObject`].
#[derive(Clone)]
pub enum NewValue {
    Value(Value),
    Object(Arc<NewObject>),
    List(Vec<NewValue>),
    Set(Vec<NewValue>),
    Map(Vec<(NewValue, NewValue)>),
}

pub struct Coordinator {
    registry: StorageRegistry,
    schema: SchemaRegistry,
    codec: Codec,
    default_storage: StorageId,
    live: Mutex<HashMap<Oid, Arc<LiveObject>>>,
    class_storage: RwLock<HashMap<String, StorageId>>,
    // (class, field) -> unload after this much idleness
    idle_limits: RwLock<HashMap<(String, String), Duration>>,
}

impl Coordinator {
    pub fn new(
        registry: StorageRegistry,
        schema: SchemaRegistry,
        codec: Codec,
        default_storage: StorageId,
    ) -> Self {
        Coordinator {
            registry,
            schema,
            codec,
            default_storage,
            live: Mutex::new(HashMap::new()),
            class_storage: RwLock::new(HashMap::new()),
            idle_limits: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Routes new objects of `class` to a specific storage instead of
    /// the default one.
    pub fn bind_class(&self, class: impl Into<String>, storage: StorageId) {
        self.class_storage
            .write()
            .unwrap()
            .insert(class.into(), storage);
    }

    fn storage(&self, id: &StorageId) -> Result<Arc<dyn Storage>> {
        self.registry
            .get(id)
            .ok_or_else(|| PersistenceError::UnknownStorage(id.clone()))
    }

    fn storage_for(&self, class: &str) -> Result<Arc<dyn Storage>> {
        let id = self
            .class_storage
            .read()
            .unwrap()
            .get(class)
            .cloned()
            .unwrap_or_else(|| self.default_storage.clone());
        self.storage(&id)
    }

    fn descriptor(&self, class: &str) -> Result<Arc<ClassDescriptor>> {
        self.schema
            .get(class)
            .ok_or_else(|| PersistenceError::UnknownClass(class.to_string()))
    }

    // --- identity map ---

    /// Loads the object behind `oid`, or returns the live instance if
    /// one already exists.
    pub fn get_object(&self, oid: &Oid) -> Result<Arc<LiveObject>> {
        if let Some(obj) = self.live.lock().unwrap().get(oid) {
            return Ok(obj.clone());
        }
        let storage = self.storage(oid.storage())?;
        let class = storage.class_of(oid)?;
        let descriptor = self.descriptor(&class)?;

        // Register before populating so reference cycles resolve to
        // this instance instead of loading forever.
        let obj = Arc::new(LiveObject::new(oid.clone(), class));
        {
            let mut live = self.live.lock().unwrap();
            if let Some(existing) = live.get(oid) {
                return Ok(existing.clone());
            }
            live.insert(oid.clone(), obj.clone());
        }
        if let Err(err) = self.populate(&storage, &descriptor, &obj) {
            self.live.lock().unwrap().remove(oid);
            return Err(err);
        }
        Ok(obj)
    }

    /// Registers an externally constructed live object.
    ///
    /// Re-registering the same instance is harmless; a different
    /// instance under the same OID would break identity and is fatal.
    pub fn register_object(&self, obj: Arc<LiveObject>) -> Result<()> {
        let mut live = self.live.lock().unwrap();
        match live.get(obj.oid()) {
            Some(existing) if Arc::ptr_eq(existing, &obj) => {
                warn!(oid = %obj.oid(), "object registered twice");
                Ok(())
            }
            Some(_) => Err(PersistenceError::AlreadyRegistered(obj.oid().clone())),
            None => {
                live.insert(obj.oid().clone(), obj);
                Ok(())
            }
        }
    }

    fn populate(
        &self,
        storage: &Arc<dyn Storage>,
        descriptor: &ClassDescriptor,
        obj: &LiveObject,
    ) -> Result<()> {
        let persisted: Vec<_> = descriptor.persisted_fields().collect();
        let values = storage.get_fields(&obj.oid, &persisted)?;
        for (fd, value) in persisted.iter().zip(values) {
            match fd.kind {
                FieldKind::Collection(kind) => {
                    // Older rows may lack the collection record; create
                    // it on first touch so the proxy has a target.
                    let cid = match value {
                        Some(Value::Ref(cid)) => cid,
                        _ => {
                            let cid = storage.create_object(kind.class_tag())?;
                            storage.update_field(&obj.oid, &fd.name, &Value::Ref(cid.clone()))?;
                            cid
                        }
                    };
                    let proxy = Arc::new(CollectionProxy::new(
                        kind,
                        cid,
                        storage.clone(),
                        self.registry.clone(),
                    ));
                    obj.collections
                        .lock()
                        .unwrap()
                        .insert(fd.name.clone(), proxy);
                }
                _ => {
                    if let Some(value) = value {
                        obj.fields.lock().unwrap().insert(fd.name.clone(), value);
                    }
                }
            }
        }
        Ok(())
    }

    // --- field access ---

    pub fn get_field(&self, obj: &LiveObject, field: &str) -> Result<Option<Value>> {
        let descriptor = self.descriptor(&obj.class)?;
        let fd = descriptor
            .find_field(field)
            .ok_or_else(|| PersistenceError::UnknownField {
                class: obj.class.clone(),
                field: field.to_string(),
            })?;
        if !fd.persisted() {
            return Ok(obj.cached_field(field));
        }
        if let Some(value) = obj.cached_field(field) {
            return Ok(Some(value));
        }
        let storage = self.storage(obj.oid.storage())?;
        let value = storage.get_field(&obj.oid, field)?;
        if let Some(value) = &value {
            obj.fields
                .lock()
                .unwrap()
                .insert(field.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Writes a field through to storage and refreshes the cache.
    pub fn set_field(&self, obj: &LiveObject, field: &str, value: Value) -> Result<()> {
        let descriptor = self.descriptor(&obj.class)?;
        let fd = descriptor
            .find_field(field)
            .ok_or_else(|| PersistenceError::UnknownField {
                class: obj.class.clone(),
                field: field.to_string(),
            })?;
        if fd.persisted() {
            let storage = self.storage(obj.oid.storage())?;
            storage.update_field(&obj.oid, field, &value)?;
        }
        obj.fields.lock().unwrap().insert(field.to_string(), value);
        Ok(())
    }

    /// Resolves a reference-valued field to its live object.
    pub fn get_reference(&self, obj: &LiveObject, field: &str) -> Result<Option<Arc<LiveObject>>> {
        match self.get_field(obj, field)? {
            Some(Value::Ref(oid)) => Ok(Some(self.get_object(&oid)?)),
            _ => Ok(None),
        }
    }

    pub fn collection_proxy(&self, obj: &LiveObject, field: &str) -> Result<Arc<CollectionProxy>> {
        obj.collection(field)
            .ok_or_else(|| PersistenceError::UnknownField {
                class: obj.class.clone(),
                field: field.to_string(),
            })
    }

    // --- persisting new graphs ---

    /// Persists a transient graph rooted at `obj`, returning its OID.
    ///
    /// Idempotent: an already-persisted node returns its existing OID
    /// without touching storage. The graph's field writes run inside
    /// one transaction on the root's storage; on failure the
    /// transaction is rolled back and the error propagated.
    pub fn make_persistent(&self, obj: &Arc<NewObject>) -> Result<Oid> {
        if let Some(oid) = obj.oid() {
            return Ok(oid);
        }
        let storage = self.storage_for(&obj.class)?;
        storage.start_transaction()?;
        let mut walk = Vec::new();
        let result = self
            .persist_graph(obj, &mut walk)
            .and_then(|oid| storage.commit().map(|_| oid).map_err(Into::into));
        match result {
            Ok(oid) => {
                // Initializers are consumed only once the whole graph
                // has committed.
                for node in walk {
                    node.fields.lock().unwrap().clear();
                }
                Ok(oid)
            }
            Err(err) => {
                if let Err(rb) = storage.rollback() {
                    error!(%rb, "rollback failed after persist error");
                }
                // The OIDs handed out during this walk died with the
                // transaction; clearing them lets a retry start over.
                for node in walk {
                    *node.oid.lock().unwrap() = None;
                }
                Err(err)
            }
        }
    }

    fn persist_graph(&self, obj: &Arc<NewObject>, walk: &mut Vec<Arc<NewObject>>) -> Result<Oid> {
        let oid = {
            // Assign the OID before recursing into fields so cycles
            // bottom out here.
            let mut slot = obj.oid.lock().unwrap();
            if let Some(oid) = slot.as_ref() {
                return Ok(oid.clone());
            }
            let storage = self.storage_for(&obj.class)?;
            let oid = storage.create_object(&obj.class)?;
            let name = match &obj.name {
                Some(name) => name.clone(),
                None => storage.new_name(&obj.class)?,
            };
            storage.bind_oid_to_name(&oid, &name)?;
            debug!(oid = %oid, name = %name, class = %obj.class, "persisted new object");
            *slot = Some(oid.clone());
            walk.push(obj.clone());
            oid
        };
        let storage = self.storage_for(&obj.class)?;
        let descriptor = self.descriptor(&obj.class)?;

        let fields = obj.fields.lock().unwrap().clone();
        for (field, init) in fields {
            let fd = descriptor
                .find_field(&field)
                .ok_or_else(|| PersistenceError::UnknownField {
                    class: obj.class.clone(),
                    field: field.clone(),
                })?;
            if !fd.persisted() {
                continue;
            }
            match (fd.kind, init) {
                (FieldKind::Collection(kind), init) => {
                    let cid = storage.create_object(kind.class_tag())?;
                    storage.set_field(&oid, &field, &Value::Ref(cid.clone()))?;
                    self.persist_collection(&storage, &cid, kind, &field, init, walk)?;
                }
                (_, init) => {
                    let value = self.resolve_init(&field, init, walk)?;
                    storage.set_field(&oid, &field, &value)?;
                }
            }
        }
        Ok(oid)
    }

    fn persist_collection(
        &self,
        storage: &Arc<dyn Storage>,
        cid: &Oid,
        kind: crate::schema::CollectionKind,
        field: &str,
        init: NewValue,
        walk: &mut Vec<Arc<NewObject>>,
    ) -> Result<()> {
        use crate::schema::CollectionKind::*;
        match (kind, init) {
            (List, NewValue::List(items)) => {
                for item in items {
                    let value = self.resolve_init(field, item, walk)?;
                    storage.add_to_list(cid, &value)?;
                }
                Ok(())
            }
            (Set, NewValue::Set(items)) => {
                for item in items {
                    let value = self.resolve_init(field, item, walk)?;
                    storage.add_to_set(cid, &value)?;
                }
                Ok(())
            }
            (Map, NewValue::Map(entries)) => {
                for (key, value) in entries {
                    let key = self.resolve_init(field, key, walk)?;
                    let value = self.resolve_init(field, value, walk)?;
                    storage.put_in_map(cid, &key, &value)?;
                }
                Ok(())
            }
            (_, _) => Err(PersistenceError::InvalidValue {
                field: field.to_string(),
                reason: format!("an initializer of the wrong shape for a {kind:?}"),
            }),
        }
    }

    fn resolve_init(
        &self,
        field: &str,
        init: NewValue,
        walk: &mut Vec<Arc<NewObject>>,
    ) -> Result<Value> {
        match init {
            NewValue::Value(value) => Ok(value),
            NewValue::Object(obj) => Ok(Value::Ref(self.persist_graph(&obj, walk)?)),
            NewValue::List(_) | NewValue::Set(_) | NewValue::Map(_) => {
                Err(PersistenceError::InvalidValue {
                    field: field.to_string(),
                    reason: "a nested collection".to_string(),
                })
            }
        }
    }

    // --- deletion and release ---

    /// Deletes the object from its storage, dropping its name bindings
    /// and evicting the live instance.
    pub fn delete(&self, oid: &Oid) -> Result<()> {
        let storage = self.storage(oid.storage())?;
        if let Some(name) = storage.get_name_from_oid(oid)? {
            storage.delete_name(&name)?;
        }
        storage.delete_object(oid)?;
        self.live.lock().unwrap().remove(oid);
        Ok(())
    }

    /// Drops the live instance without touching storage; the next
    /// `get_object` reloads it.
    pub fn release(&self, oid: &Oid) {
        self.live.lock().unwrap().remove(oid);
    }

    // --- queries ---

    /// Live objects for every stored instance of `class` and its
    /// subclasses, on the storage that class is bound to.
    pub fn get_objects(&self, class: &str) -> Result<Vec<Arc<LiveObject>>> {
        let descriptor = self.descriptor(class)?;
        let storage = self.storage_for(class)?;
        let oids = storage.objects_of_class(&descriptor, &self.schema)?;
        oids.iter().map(|oid| self.get_object(oid)).collect()
    }

    /// Searches all registered storages for a name binding.
    pub fn lookup_name(&self, name: &str) -> Result<Option<Oid>> {
        for id in self.registry.ids() {
            let storage = self.storage(&id)?;
            if let Some(oid) = storage.get_oid_from_name(name)? {
                return Ok(Some(oid));
            }
        }
        Ok(None)
    }

    // --- eviction ---

    /// Unloads collection proxies of `class.field` once they have been
    /// idle for `limit`.
    pub fn set_max_idle(&self, class: impl Into<String>, field: impl Into<String>, limit: Duration) {
        self.idle_limits
            .write()
            .unwrap()
            .insert((class.into(), field.into()), limit);
    }

    /// One eviction pass over all live objects; returns the number of
    /// proxies unloaded.
    pub fn sweep_once(&self) -> usize {
        let live: Vec<Arc<LiveObject>> = self.live.lock().unwrap().values().cloned().collect();
        let limits = self.idle_limits.read().unwrap().clone();
        let mut unloaded = 0;
        for obj in live {
            for ((class, field), limit) in &limits {
                if class != &obj.class {
                    continue;
                }
                let Some((_, proxy)) = obj
                    .collections_snapshot()
                    .into_iter()
                    .find(|(name, _)| name == field)
                else {
                    continue;
                };
                if proxy.is_loaded() && proxy.last_access().elapsed() >= *limit {
                    debug!(oid = %obj.oid, field = %field, "unloading idle collection");
                    proxy.unload();
                    unloaded += 1;
                }
            }
        }
        unloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_storage::FsStorage;
    use crate::schema::FieldDescriptor;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Coordinator {
        let registry = StorageRegistry::new();
        let codec = Codec::new(registry.clone());
        let storage =
            FsStorage::open(StorageId::new("fs0"), dir.path(), codec.clone()).unwrap();
        registry.register(Arc::new(storage)).unwrap();

        let schema = SchemaRegistry::new();
        schema.register(
            ClassDescriptor::new("Person")
                .field(FieldDescriptor::primitive("name"))
                .field(FieldDescriptor::reference("friend"))
                .field(FieldDescriptor::list("emails")),
        );
        Coordinator::new(registry, schema, codec, StorageId::new("fs0"))
    }

    #[test]
    fn test_make_persistent_and_reload() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);

        let ann = NewObject::new("Person");
        ann.set("name", NewValue::Value(Value::from("Ann")));
        ann.set(
            "emails",
            NewValue::List(vec![NewValue::Value(Value::from("ann@example.com"))]),
        );
        let oid = coord.make_persistent(&ann).unwrap();
        // Idempotent.
        assert_eq!(coord.make_persistent(&ann).unwrap(), oid);

        let obj = coord.get_object(&oid).unwrap();
        assert_eq!(obj.class(), "Person");
        assert_eq!(
            coord.get_field(&obj, "name").unwrap(),
            Some(Value::from("Ann"))
        );
        let emails = coord.collection_proxy(&obj, "emails").unwrap();
        let list = emails.as_list().unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![Value::from("ann@example.com")]);
    }

    #[test]
    fn test_generated_root_name_binds_object() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        let oid = coord.make_persistent(&obj).unwrap();
        assert_eq!(coord.lookup_name("person#0").unwrap(), Some(oid));

        let named = NewObject::named("Person", "boss");
        let oid = coord.make_persistent(&named).unwrap();
        assert_eq!(coord.lookup_name("boss").unwrap(), Some(oid));
    }

    #[test]
    fn test_identity_map_returns_same_instance() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        let oid = coord.make_persistent(&obj).unwrap();

        let a = coord.get_object(&oid).unwrap();
        let b = coord.get_object(&oid).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // After release, a fresh instance is loaded.
        coord.release(&oid);
        let c = coord.get_object(&oid).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_register_conflicting_instance_is_fatal() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        let oid = coord.make_persistent(&obj).unwrap();
        let live = coord.get_object(&oid).unwrap();

        // Same instance again: tolerated.
        coord.register_object(live.clone()).unwrap();
        // A different instance under the same OID: rejected.
        let impostor = Arc::new(LiveObject::new(oid.clone(), "Person".to_string()));
        assert!(matches!(
            coord.register_object(impostor),
            Err(PersistenceError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_cyclic_graph_persists() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);

        let ann = NewObject::new("Person");
        let bob = NewObject::new("Person");
        ann.set("name", NewValue::Value(Value::from("Ann")));
        bob.set("name", NewValue::Value(Value::from("Bob")));
        ann.set("friend", NewValue::Object(bob.clone()));
        bob.set("friend", NewValue::Object(ann.clone()));

        let ann_oid = coord.make_persistent(&ann).unwrap();
        let bob_oid = bob.oid().unwrap();
        assert_ne!(ann_oid, bob_oid);

        let live_ann = coord.get_object(&ann_oid).unwrap();
        let friend = coord.get_reference(&live_ann, "friend").unwrap().unwrap();
        assert_eq!(friend.oid(), &bob_oid);
        let back = coord.get_reference(&friend, "friend").unwrap().unwrap();
        assert!(Arc::ptr_eq(&back, &live_ann));
    }

    #[test]
    fn test_failed_persist_leaves_graph_repersistable() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);

        let ann = NewObject::new("Person");
        let bob = NewObject::new("Person");
        ann.set("name", NewValue::Value(Value::from("Ann")));
        ann.set("friend", NewValue::Object(bob.clone()));
        // The schema does not know this field yet, so the walk fails
        // after Ann and Bob already received OIDs.
        bob.set("nickname", NewValue::Value(Value::from("Bobby")));

        assert!(coord.make_persistent(&ann).is_err());
        assert_eq!(ann.oid(), None);
        assert_eq!(bob.oid(), None);

        // Once the class knows the field, the same graph persists.
        coord.schema().register(
            ClassDescriptor::new("Person")
                .field(FieldDescriptor::primitive("name"))
                .field(FieldDescriptor::primitive("nickname"))
                .field(FieldDescriptor::reference("friend"))
                .field(FieldDescriptor::list("emails")),
        );
        let oid = coord.make_persistent(&ann).unwrap();
        let live = coord.get_object(&oid).unwrap();
        assert_eq!(
            coord.get_field(&live, "name").unwrap(),
            Some(Value::from("Ann"))
        );
        let friend = coord.get_reference(&live, "friend").unwrap().unwrap();
        assert_eq!(
            coord.get_field(&friend, "nickname").unwrap(),
            Some(Value::from("Bobby"))
        );
    }

    #[test]
    fn test_set_field_writes_through() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        obj.set("name", NewValue::Value(Value::from("Ann")));
        let oid = coord.make_persistent(&obj).unwrap();

        let live = coord.get_object(&oid).unwrap();
        coord
            .set_field(&live, "name", Value::from("Annie"))
            .unwrap();

        coord.release(&oid);
        let reloaded = coord.get_object(&oid).unwrap();
        assert_eq!(
            coord.get_field(&reloaded, "name").unwrap(),
            Some(Value::from("Annie"))
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        obj.set("nickname", NewValue::Value(Value::from("A")));
        assert!(matches!(
            coord.make_persistent(&obj),
            Err(PersistenceError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_missing_collection_record_created_on_load() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        // An object written without its collection field, as an older
        // deployment would have left it.
        let storage = coord.registry().get(&StorageId::new("fs0")).unwrap();
        let oid = storage.create_object("Person").unwrap();

        let live = coord.get_object(&oid).unwrap();
        let proxy = coord.collection_proxy(&live, "emails").unwrap();
        assert!(proxy.as_list().unwrap().is_empty().unwrap());
        // The record now exists in storage.
        assert_eq!(storage.class_of(proxy.cid()).unwrap(), "list");
    }

    #[test]
    fn test_delete_drops_storage_rows_and_identity() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        let oid = coord.make_persistent(&obj).unwrap();
        coord.get_object(&oid).unwrap();

        coord.delete(&oid).unwrap();
        assert_eq!(coord.lookup_name("person#0").unwrap(), None);
        assert!(matches!(
            coord.get_object(&oid),
            Err(PersistenceError::Storage(StorageError::NoSuchOid(_)))
        ));
    }

    #[test]
    fn test_sweep_unloads_idle_proxies() {
        let dir = TempDir::new().unwrap();
        let coord = setup(&dir);
        let obj = NewObject::new("Person");
        obj.set(
            "emails",
            NewValue::List(vec![NewValue::Value(Value::from("a@b"))]),
        );
        let oid = coord.make_persistent(&obj).unwrap();
        let live = coord.get_object(&oid).unwrap();
        let proxy = coord.collection_proxy(&live, "emails").unwrap();
        proxy.as_list().unwrap().to_vec().unwrap();
        assert!(proxy.is_loaded());

        // No limit configured: nothing unloads.
        assert_eq!(coord.sweep_once(), 0);

        coord.set_max_idle("Person", "emails", Duration::ZERO);
        assert_eq!(coord.sweep_once(), 1);
        assert!(!proxy.is_loaded());

        // Data is still available, reloaded on demand.
        assert_eq!(
            proxy.as_list().unwrap().to_vec().unwrap(),
            vec![Value::from("a@b")]
        );
    }
}
