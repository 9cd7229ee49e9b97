//! Value codec.
//!
//! Backends store every field as a single line of text. The encoding is
//! deliberately simple and self-describing:
//!
//! - `null` for the null value
//! - `<digits>` or `<digits>@<storageId>` for object references
//!   (the storage qualifier is dropped when the reference targets the
//!   storage that owns the row)
//! - `<typeName>:<stringForm>` for everything else
//!
//! Built-in types are `bool`, `int`, `float`, `string` and `bytes`
//! (base64). Applications can plug extra [`StringConverter`]s for
//! domain types; converters are consulted before the built-ins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::oid::{Oid, StorageId};
use crate::storage::Storage;
use crate::value::Value;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown value type '{0}'")]
    UnknownType(String),
    #[error("reference to unknown storage '{0}'")]
    UnknownStorage(String),
    #[error("malformed encoded value '{0}'")]
    Malformed(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Pluggable encoder/decoder for one application value type.
///
/// `encode` returns `None` when the converter does not claim the value;
/// the codec then falls through to the built-ins.
pub trait StringConverter: Send + Sync {
    /// Type name this converter claims on the wire.
    fn type_name(&self) -> &str;

    fn encode(&self, value: &Value) -> Option<String>;

    fn decode(&self, form: &str) -> Result<Value, CodecError>;
}

/// Registry of configured storages, keyed by id.
///
/// The codec validates cross-storage references against it, and the
/// coordinator resolves `Value::Ref`s through it. Cheap to clone.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    storages: Arc<RwLock<HashMap<StorageId, Arc<dyn Storage>>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a storage. Empty ids are rejected so the
    /// `local@storage` reference form stays parseable.
    pub fn register(&self, storage: Arc<dyn Storage>) -> Result<(), CodecError> {
        let id = storage.id().clone();
        if id.is_empty() {
            return Err(CodecError::UnknownStorage(String::new()));
        }
        self.storages.write().unwrap().insert(id, storage);
        Ok(())
    }

    pub fn get(&self, id: &StorageId) -> Option<Arc<dyn Storage>> {
        self.storages.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &StorageId) -> bool {
        self.storages.read().unwrap().contains_key(id)
    }

    pub fn ids(&self) -> Vec<StorageId> {
        let mut ids: Vec<StorageId> = self.storages.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// String codec bound to a storage registry. Cheap to clone.
#[derive(Clone)]
pub struct Codec {
    registry: StorageRegistry,
    converters: Arc<RwLock<HashMap<String, Arc<dyn StringConverter>>>>,
}

impl Codec {
    pub fn new(registry: StorageRegistry) -> Self {
        Codec {
            registry,
            converters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    pub fn register_converter(&self, converter: Arc<dyn StringConverter>) {
        let mut map = self.converters.write().unwrap();
        map.insert(converter.type_name().to_string(), converter);
    }

    /// Encodes a value from the point of view of storage `current`.
    /// References into `current` omit the storage qualifier.
    pub fn encode(&self, current: &StorageId, value: &Value) -> String {
        if let Value::Ref(oid) = value {
            return if oid.storage() == current {
                oid.local_id()
            } else {
                format!("{}@{}", oid.local_id(), oid.storage())
            };
        }
        if !matches!(value, Value::Null) {
            let converters = self.converters.read().unwrap();
            for converter in converters.values() {
                if let Some(form) = converter.encode(value) {
                    return format!("{}:{}", converter.type_name(), form);
                }
            }
        }
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("bool:{b}"),
            Value::Int(n) => format!("int:{n}"),
            Value::Float(x) => format!("float:{x}"),
            Value::Str(s) => format!("string:{s}"),
            Value::Bytes(b) => format!("bytes:{}", BASE64.encode(b)),
            Value::Ref(_) => unreachable!("handled above"),
        }
    }

    /// Decodes a stored string from the point of view of storage
    /// `current`. Unknown type names are a hard error; silently turning
    /// them into strings would corrupt data on the next write-back.
    pub fn decode(&self, current: &StorageId, encoded: &str) -> Result<Value, CodecError> {
        if encoded == "null" {
            return Ok(Value::Null);
        }
        if encoded.starts_with(|c: char| c.is_ascii_digit()) {
            return self.decode_reference(current, encoded);
        }
        let (type_name, form) = encoded
            .split_once(':')
            .ok_or_else(|| CodecError::Malformed(encoded.to_string()))?;
        if let Some(converter) = self.converters.read().unwrap().get(type_name) {
            return converter.decode(form);
        }
        match type_name {
            "bool" => match form {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(CodecError::Malformed(encoded.to_string())),
            },
            "int" => form
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| CodecError::Malformed(encoded.to_string())),
            "float" => form
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| CodecError::Malformed(encoded.to_string())),
            "string" => Ok(Value::Str(form.to_string())),
            "bytes" => Ok(Value::Bytes(BASE64.decode(form)?)),
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }

    fn decode_reference(&self, current: &StorageId, encoded: &str) -> Result<Value, CodecError> {
        let (local, storage) = match encoded.split_once('@') {
            Some((local, storage)) => {
                let id = StorageId::new(storage);
                if !self.registry.contains(&id) {
                    return Err(CodecError::UnknownStorage(storage.to_string()));
                }
                (local, id)
            }
            None => (encoded, current.clone()),
        };
        let oid = match local.parse::<u64>() {
            Ok(n) => Oid::numeric(storage, n),
            Err(_) => Oid::text(storage, local),
        };
        Ok(Value::Ref(oid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(StorageRegistry::new())
    }

    #[test]
    fn test_encode_builtins() {
        let codec = codec();
        let s0 = StorageId::new("s0");
        assert_eq!(codec.encode(&s0, &Value::Null), "null");
        assert_eq!(codec.encode(&s0, &Value::Bool(true)), "bool:true");
        assert_eq!(codec.encode(&s0, &Value::Int(-3)), "int:-3");
        assert_eq!(codec.encode(&s0, &Value::Str("a:b".into())), "string:a:b");
        assert_eq!(
            codec.encode(&s0, &Value::Bytes(vec![1, 2, 3])),
            "bytes:AQID"
        );
    }

    #[test]
    fn test_decode_builtins() {
        let codec = codec();
        let s0 = StorageId::new("s0");
        assert_eq!(codec.decode(&s0, "null").unwrap(), Value::Null);
        assert_eq!(codec.decode(&s0, "bool:false").unwrap(), Value::Bool(false));
        assert_eq!(codec.decode(&s0, "int:12").unwrap(), Value::Int(12));
        assert_eq!(
            codec.decode(&s0, "string:a:b").unwrap(),
            Value::Str("a:b".into())
        );
        assert_eq!(
            codec.decode(&s0, "bytes:AQID").unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_reference_round_trip_local_and_foreign() {
        let codec = codec();
        let s0 = StorageId::new("s0");

        let local = Value::Ref(Oid::numeric(s0.clone(), 17));
        assert_eq!(codec.encode(&s0, &local), "17");
        assert_eq!(codec.decode(&s0, "17").unwrap(), local);

        // Foreign reference keeps its qualifier, but decoding requires
        // the target storage to be registered.
        let s1 = StorageId::new("s1");
        let foreign = Value::Ref(Oid::numeric(s1.clone(), 5));
        assert_eq!(codec.encode(&s0, &foreign), "5@s1");
        assert!(matches!(
            codec.decode(&s0, "5@s1"),
            Err(CodecError::UnknownStorage(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let codec = codec();
        let s0 = StorageId::new("s0");
        assert!(matches!(
            codec.decode(&s0, "money:12.50 EUR"),
            Err(CodecError::UnknownType(_))
        ));
        assert!(matches!(
            codec.decode(&s0, "no-colon-no-digit"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_custom_converter_takes_precedence() {
        struct Upper;
        impl StringConverter for Upper {
            fn type_name(&self) -> &str {
                "string"
            }
            fn encode(&self, value: &Value) -> Option<String> {
                value.as_str().map(|s| s.to_uppercase())
            }
            fn decode(&self, form: &str) -> Result<Value, CodecError> {
                Ok(Value::Str(form.to_lowercase()))
            }
        }
        let codec = codec();
        codec.register_converter(Arc::new(Upper));
        let s0 = StorageId::new("s0");
        assert_eq!(codec.encode(&s0, &Value::Str("abc".into())), "string:ABC");
        assert_eq!(
            codec.decode(&s0, "string:ABC").unwrap(),
            Value::Str("abc".into())
        );
    }
}
