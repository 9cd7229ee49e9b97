//! Class and field metadata.
//!
//! The coordinator needs to know, for each persistent class, which
//! fields exist, which are references or collections, and which are
//! transient or calculated (never persisted). Applications register
//! [`ClassDescriptor`]s in a shared [`SchemaRegistry`] at startup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Collection shape of a collection-typed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    List,
    Set,
    Map,
}

impl CollectionKind {
    /// Class tag recorded in storage for the collection's own OID.
    pub fn class_tag(&self) -> &'static str {
        match self {
            CollectionKind::List => "list",
            CollectionKind::Set => "set",
            CollectionKind::Map => "map",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Primitive,
    Reference,
    Collection(CollectionKind),
}

/// One persistent field of a class.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub transient: bool,
    pub calculated: bool,
}

impl FieldDescriptor {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldDescriptor {
            name: name.into(),
            kind,
            transient: false,
            calculated: false,
        }
    }

    pub fn primitive(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Primitive)
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Reference)
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Collection(CollectionKind::List))
    }

    pub fn set(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Collection(CollectionKind::Set))
    }

    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Collection(CollectionKind::Map))
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn calculated(mut self) -> Self {
        self.calculated = true;
        self
    }

    /// Whether this field participates in persistence at all.
    pub fn persisted(&self) -> bool {
        !self.transient && !self.calculated
    }

    pub fn collection_kind(&self) -> Option<CollectionKind> {
        match self.kind {
            FieldKind::Collection(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Persistent class metadata.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub name: String,
    pub parent: Option<String>,
    pub fields: Vec<FieldDescriptor>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        ClassDescriptor {
            name: name.into(),
            parent: None,
            fields: Vec::new(),
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Persisted fields, in declaration order.
    pub fn persisted_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.persisted())
    }
}

/// Thread-safe registry of class descriptors, shared by the
/// coordinator and the backends. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    classes: Arc<RwLock<HashMap<String, Arc<ClassDescriptor>>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: ClassDescriptor) {
        let mut map = self.classes.write().unwrap();
        map.insert(class.name.clone(), Arc::new(class));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassDescriptor>> {
        self.classes.read().unwrap().get(name).cloned()
    }

    /// The given class plus all transitive subclasses known to the
    /// registry, the class itself first.
    pub fn class_and_subclasses(&self, name: &str) -> Vec<String> {
        let map = self.classes.read().unwrap();
        let mut out = vec![name.to_string()];
        let mut i = 0;
        while i < out.len() {
            for class in map.values() {
                if class.parent.as_deref() == Some(out[i].as_str())
                    && !out.contains(&class.name)
                {
                    out.push(class.name.clone());
                }
            }
            i += 1;
        }
        out
    }
}
