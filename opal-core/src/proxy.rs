//! Lazy collection proxies.
//!
//! Application code sees a persistent list, set or map through a proxy
//! that starts unloaded and pulls the backing storage's contents into
//! an in-memory mirror on first read. Mutations always write through
//! to storage; the mirror is updated too when loaded, so a loaded proxy
//! answers reads without touching the backend again.
//!
//! Point queries (size, membership, a single element or map value) on
//! an unloaded proxy are answered by the backend without loading; only
//! enumeration pulls the whole collection in. A size of zero proves
//! the mirror (empty) is already exact, so the proxy flips to loaded
//! for free.
//!
//! Every operation refreshes the proxy's access time; the eviction
//! sweep unloads proxies that stay idle past their class limit.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::error;

use crate::codec::StorageRegistry;
use crate::oid::Oid;
use crate::schema::CollectionKind;
use crate::storage::{Result, Storage, StorageError};
use crate::value::Value;

/// Operations understood by [`ListProxy::apply`].
#[derive(Debug, Clone)]
pub enum ListOp {
    Add(Value),
    Insert(u64, Value),
    Get(u64),
    Set(u64, Value),
    RemoveAt(u64),
    Remove(Value),
    IndexOf(Value),
    LastIndexOf(Value),
    Contains(Value),
    Size,
    IsEmpty,
    Clear,
    ToVec,
}

#[derive(Debug, Clone)]
pub enum SetOp {
    Add(Value),
    Remove(Value),
    Contains(Value),
    Size,
    IsEmpty,
    Clear,
    ToVec,
}

#[derive(Debug, Clone)]
pub enum MapOp {
    Put(Value, Value),
    Get(Value),
    Remove(Value),
    ContainsKey(Value),
    ContainsValue(Value),
    Size,
    IsEmpty,
    Clear,
    Entries,
}

/// Result of a dispatched collection operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Unit,
    Bool(bool),
    Index(i64),
    Size(u64),
    Value(Option<Value>),
    Values(Vec<Value>),
    Entries(Vec<(Value, Value)>),
}

struct ProxyInner<M> {
    loaded: bool,
    last_access: Instant,
    mirror: M,
}

impl<M: Default> ProxyInner<M> {
    fn new() -> Self {
        ProxyInner {
            loaded: false,
            last_access: Instant::now(),
            mirror: M::default(),
        }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    fn unload(&mut self) {
        self.loaded = false;
        self.mirror = M::default();
    }
}

/// A stored reference is broken when its storage is gone from the
/// registry or the target object no longer exists. Broken elements are
/// skipped on load rather than poisoning the whole collection.
fn resolvable(registry: &StorageRegistry, value: &Value) -> bool {
    let Value::Ref(oid) = value else {
        return true;
    };
    match registry.get(oid.storage()) {
        Some(storage) => storage.class_of(oid).is_ok(),
        None => false,
    }
}

// Shared accessors for the three proxy shapes; each instantiation is
// typed to that proxy's mirror.
macro_rules! proxy_common {
    ($mirror:ty) => {
        pub fn cid(&self) -> &Oid {
            &self.cid
        }

        pub fn is_loaded(&self) -> bool {
            self.inner.lock().unwrap().loaded
        }

        pub fn last_access(&self) -> Instant {
            self.inner.lock().unwrap().last_access
        }

        /// Drops the mirror; the next read reloads from storage.
        pub fn unload(&self) {
            self.inner.lock().unwrap().unload();
        }

        fn lock(&self) -> MutexGuard<'_, ProxyInner<$mirror>> {
            let mut inner = self.inner.lock().unwrap();
            inner.touch();
            inner
        }
    };
}

// --- list ---

type ListMirror = Vec<Value>;

pub struct ListProxy {
    cid: Oid,
    storage: Arc<dyn Storage>,
    registry: StorageRegistry,
    inner: Mutex<ProxyInner<ListMirror>>,
}

impl ListProxy {
    pub fn new(cid: Oid, storage: Arc<dyn Storage>, registry: StorageRegistry) -> Self {
        ListProxy {
            cid,
            storage,
            registry,
            inner: Mutex::new(ProxyInner::new()),
        }
    }

    proxy_common!(ListMirror);

    fn load(&self, inner: &mut ProxyInner<ListMirror>) -> Result<()> {
        if inner.loaded {
            return Ok(());
        }
        let mut mirror = Vec::new();
        for value in self.storage.get_list(&self.cid)? {
            if resolvable(&self.registry, &value) {
                mirror.push(value);
            } else {
                error!(collection = %self.cid, ?value, "skipping unresolvable list element");
            }
        }
        inner.mirror = mirror;
        inner.loaded = true;
        Ok(())
    }

    pub fn apply(&self, op: ListOp) -> Result<OpOutcome> {
        match op {
            ListOp::Add(v) => self.add(&v).map(|_| OpOutcome::Unit),
            ListOp::Insert(i, v) => self.insert(i, &v).map(|_| OpOutcome::Unit),
            ListOp::Get(i) => self.get(i).map(|v| OpOutcome::Value(Some(v))),
            ListOp::Set(i, v) => self.set(i, &v).map(|_| OpOutcome::Unit),
            ListOp::RemoveAt(i) => self.remove_at(i).map(|_| OpOutcome::Unit),
            ListOp::Remove(v) => self.remove(&v).map(|_| OpOutcome::Unit),
            ListOp::IndexOf(v) => self.index_of(&v).map(OpOutcome::Index),
            ListOp::LastIndexOf(v) => self.last_index_of(&v).map(OpOutcome::Index),
            ListOp::Contains(v) => self.contains(&v).map(OpOutcome::Bool),
            ListOp::Size => self.len().map(OpOutcome::Size),
            ListOp::IsEmpty => self.is_empty().map(OpOutcome::Bool),
            ListOp::Clear => self.clear().map(|_| OpOutcome::Unit),
            ListOp::ToVec => self.to_vec().map(OpOutcome::Values),
        }
    }

    pub fn add(&self, value: &Value) -> Result<()> {
        let mut inner = self.lock();
        self.storage.add_to_list(&self.cid, value)?;
        if inner.loaded {
            inner.mirror.push(value.clone());
        }
        Ok(())
    }

    pub fn insert(&self, index: u64, value: &Value) -> Result<()> {
        let mut inner = self.lock();
        self.storage.insert_into_list(&self.cid, index, value)?;
        if inner.loaded {
            // An external writer may have grown the backend past the
            // mirror; a stale mirror is dropped rather than indexed.
            if index as usize <= inner.mirror.len() {
                inner.mirror.insert(index as usize, value.clone());
            } else {
                inner.unload();
            }
        }
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<Value> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.get_list_item(&self.cid, index);
        }
        inner
            .mirror
            .get(index as usize)
            .cloned()
            .ok_or_else(|| StorageError::IndexOutOfBounds {
                cid: self.cid.clone(),
                index,
                size: inner.mirror.len() as u64,
            })
    }

    pub fn set(&self, index: u64, value: &Value) -> Result<()> {
        let mut inner = self.lock();
        self.storage.set_list_item(&self.cid, index, value)?;
        if inner.loaded {
            if (index as usize) < inner.mirror.len() {
                inner.mirror[index as usize] = value.clone();
            } else {
                inner.unload();
            }
        }
        Ok(())
    }

    pub fn remove_at(&self, index: u64) -> Result<()> {
        let mut inner = self.lock();
        self.storage.remove_list_index(&self.cid, index)?;
        if inner.loaded {
            if (index as usize) < inner.mirror.len() {
                inner.mirror.remove(index as usize);
            } else {
                inner.unload();
            }
        }
        Ok(())
    }

    pub fn remove(&self, value: &Value) -> Result<()> {
        let mut inner = self.lock();
        self.storage.remove_list_value(&self.cid, value)?;
        if inner.loaded {
            if let Some(pos) = inner.mirror.iter().position(|v| v == value) {
                inner.mirror.remove(pos);
            }
        }
        Ok(())
    }

    pub fn index_of(&self, value: &Value) -> Result<i64> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.list_index_of(&self.cid, value);
        }
        Ok(inner
            .mirror
            .iter()
            .position(|v| v == value)
            .map(|i| i as i64)
            .unwrap_or(-1))
    }

    pub fn last_index_of(&self, value: &Value) -> Result<i64> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.list_last_index_of(&self.cid, value);
        }
        Ok(inner
            .mirror
            .iter()
            .rposition(|v| v == value)
            .map(|i| i as i64)
            .unwrap_or(-1))
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.list_contains(&self.cid, value);
        }
        Ok(inner.mirror.contains(value))
    }

    pub fn len(&self) -> Result<u64> {
        let mut inner = self.lock();
        if inner.loaded {
            return Ok(inner.mirror.len() as u64);
        }
        let size = self.storage.list_size(&self.cid)?;
        if size == 0 {
            inner.loaded = true;
        }
        Ok(size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();
        self.storage.clear_list(&self.cid)?;
        inner.mirror.clear();
        inner.loaded = true;
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let mut inner = self.lock();
        self.load(&mut inner)?;
        Ok(inner.mirror.clone())
    }
}

// --- set ---

type SetMirror = Vec<Value>;

pub struct SetProxy {
    cid: Oid,
    storage: Arc<dyn Storage>,
    registry: StorageRegistry,
    inner: Mutex<ProxyInner<SetMirror>>,
}

impl SetProxy {
    pub fn new(cid: Oid, storage: Arc<dyn Storage>, registry: StorageRegistry) -> Self {
        SetProxy {
            cid,
            storage,
            registry,
            inner: Mutex::new(ProxyInner::new()),
        }
    }

    proxy_common!(SetMirror);

    fn load(&self, inner: &mut ProxyInner<SetMirror>) -> Result<()> {
        if inner.loaded {
            return Ok(());
        }
        let mut mirror = Vec::new();
        for value in self.storage.get_set(&self.cid)? {
            if resolvable(&self.registry, &value) {
                mirror.push(value);
            } else {
                error!(collection = %self.cid, ?value, "skipping unresolvable set element");
            }
        }
        inner.mirror = mirror;
        inner.loaded = true;
        Ok(())
    }

    pub fn apply(&self, op: SetOp) -> Result<OpOutcome> {
        match op {
            SetOp::Add(v) => self.add(&v).map(OpOutcome::Bool),
            SetOp::Remove(v) => self.remove(&v).map(OpOutcome::Bool),
            SetOp::Contains(v) => self.contains(&v).map(OpOutcome::Bool),
            SetOp::Size => self.len().map(OpOutcome::Size),
            SetOp::IsEmpty => self.is_empty().map(OpOutcome::Bool),
            SetOp::Clear => self.clear().map(|_| OpOutcome::Unit),
            SetOp::ToVec => self.to_vec().map(OpOutcome::Values),
        }
    }

    pub fn add(&self, value: &Value) -> Result<bool> {
        let mut inner = self.lock();
        let added = self.storage.add_to_set(&self.cid, value)?;
        if added && inner.loaded {
            inner.mirror.push(value.clone());
        }
        Ok(added)
    }

    pub fn remove(&self, value: &Value) -> Result<bool> {
        let mut inner = self.lock();
        let removed = self.storage.remove_from_set(&self.cid, value)?;
        if removed && inner.loaded {
            if let Some(pos) = inner.mirror.iter().position(|v| v == value) {
                inner.mirror.remove(pos);
            }
        }
        Ok(removed)
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.set_contains(&self.cid, value);
        }
        Ok(inner.mirror.contains(value))
    }

    pub fn len(&self) -> Result<u64> {
        let mut inner = self.lock();
        if inner.loaded {
            return Ok(inner.mirror.len() as u64);
        }
        let size = self.storage.set_size(&self.cid)?;
        if size == 0 {
            inner.loaded = true;
        }
        Ok(size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();
        self.storage.clear_set(&self.cid)?;
        inner.mirror.clear();
        inner.loaded = true;
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let mut inner = self.lock();
        self.load(&mut inner)?;
        Ok(inner.mirror.clone())
    }
}

// --- map ---

// Values are not hashable (floats), so the mirror is an association
// vector searched by equality, like the storage row model.
type MapMirror = Vec<(Value, Value)>;

pub struct MapProxy {
    cid: Oid,
    storage: Arc<dyn Storage>,
    registry: StorageRegistry,
    inner: Mutex<ProxyInner<MapMirror>>,
}

impl MapProxy {
    pub fn new(cid: Oid, storage: Arc<dyn Storage>, registry: StorageRegistry) -> Self {
        MapProxy {
            cid,
            storage,
            registry,
            inner: Mutex::new(ProxyInner::new()),
        }
    }

    proxy_common!(MapMirror);

    fn load(&self, inner: &mut ProxyInner<MapMirror>) -> Result<()> {
        if inner.loaded {
            return Ok(());
        }
        let mut mirror = Vec::new();
        for (key, value) in self.storage.get_map(&self.cid)? {
            if resolvable(&self.registry, &key) && resolvable(&self.registry, &value) {
                mirror.push((key, value));
            } else {
                error!(collection = %self.cid, "skipping map entry with unresolvable reference");
            }
        }
        inner.mirror = mirror;
        inner.loaded = true;
        Ok(())
    }

    pub fn apply(&self, op: MapOp) -> Result<OpOutcome> {
        match op {
            MapOp::Put(k, v) => self.put(&k, &v).map(OpOutcome::Value),
            MapOp::Get(k) => self.get(&k).map(OpOutcome::Value),
            MapOp::Remove(k) => self.remove(&k).map(OpOutcome::Value),
            MapOp::ContainsKey(k) => self.contains_key(&k).map(OpOutcome::Bool),
            MapOp::ContainsValue(v) => self.contains_value(&v).map(OpOutcome::Bool),
            MapOp::Size => self.len().map(OpOutcome::Size),
            MapOp::IsEmpty => self.is_empty().map(OpOutcome::Bool),
            MapOp::Clear => self.clear().map(|_| OpOutcome::Unit),
            MapOp::Entries => self.entries().map(OpOutcome::Entries),
        }
    }

    pub fn put(&self, key: &Value, value: &Value) -> Result<Option<Value>> {
        let mut inner = self.lock();
        let previous = self.storage.put_in_map(&self.cid, key, value)?;
        if inner.loaded {
            match inner.mirror.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value.clone(),
                None => inner.mirror.push((key.clone(), value.clone())),
            }
        }
        Ok(previous)
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.get_from_map(&self.cid, key);
        }
        Ok(inner
            .mirror
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }

    pub fn remove(&self, key: &Value) -> Result<Option<Value>> {
        let mut inner = self.lock();
        let previous = self.storage.remove_from_map(&self.cid, key)?;
        if inner.loaded {
            if let Some(pos) = inner.mirror.iter().position(|(k, _)| k == key) {
                inner.mirror.remove(pos);
            }
        }
        Ok(previous)
    }

    pub fn contains_key(&self, key: &Value) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.map_contains_key(&self.cid, key);
        }
        Ok(inner.mirror.iter().any(|(k, _)| k == key))
    }

    pub fn contains_value(&self, value: &Value) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.loaded {
            return self.storage.map_contains_value(&self.cid, value);
        }
        Ok(inner.mirror.iter().any(|(_, v)| v == value))
    }

    pub fn len(&self) -> Result<u64> {
        let mut inner = self.lock();
        if inner.loaded {
            return Ok(inner.mirror.len() as u64);
        }
        let size = self.storage.map_size(&self.cid)?;
        if size == 0 {
            inner.loaded = true;
        }
        Ok(size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();
        self.storage.clear_map(&self.cid)?;
        inner.mirror.clear();
        inner.loaded = true;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<(Value, Value)>> {
        let mut inner = self.lock();
        self.load(&mut inner)?;
        Ok(inner.mirror.clone())
    }
}

/// Any collection proxy, as tracked by the coordinator.
pub enum CollectionProxy {
    List(ListProxy),
    Set(SetProxy),
    Map(MapProxy),
}

impl CollectionProxy {
    pub fn new(
        kind: CollectionKind,
        cid: Oid,
        storage: Arc<dyn Storage>,
        registry: StorageRegistry,
    ) -> Self {
        match kind {
            CollectionKind::List => CollectionProxy::List(ListProxy::new(cid, storage, registry)),
            CollectionKind::Set => CollectionProxy::Set(SetProxy::new(cid, storage, registry)),
            CollectionKind::Map => CollectionProxy::Map(MapProxy::new(cid, storage, registry)),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            CollectionProxy::List(_) => CollectionKind::List,
            CollectionProxy::Set(_) => CollectionKind::Set,
            CollectionProxy::Map(_) => CollectionKind::Map,
        }
    }

    pub fn cid(&self) -> &Oid {
        match self {
            CollectionProxy::List(p) => p.cid(),
            CollectionProxy::Set(p) => p.cid(),
            CollectionProxy::Map(p) => p.cid(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        match self {
            CollectionProxy::List(p) => p.is_loaded(),
            CollectionProxy::Set(p) => p.is_loaded(),
            CollectionProxy::Map(p) => p.is_loaded(),
        }
    }

    pub fn last_access(&self) -> Instant {
        match self {
            CollectionProxy::List(p) => p.last_access(),
            CollectionProxy::Set(p) => p.last_access(),
            CollectionProxy::Map(p) => p.last_access(),
        }
    }

    pub fn unload(&self) {
        match self {
            CollectionProxy::List(p) => p.unload(),
            CollectionProxy::Set(p) => p.unload(),
            CollectionProxy::Map(p) => p.unload(),
        }
    }

    pub fn as_list(&self) -> Option<&ListProxy> {
        match self {
            CollectionProxy::List(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&SetProxy> {
        match self {
            CollectionProxy::Set(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapProxy> {
        match self {
            CollectionProxy::Map(p) => Some(p),
            _ => None,
        }
    }
}
