//! Cross-backend behavior tests.
//!
//! The two reference backends must be interchangeable: the same
//! sequence of operations against either one yields the same
//! observable state. Each scenario here runs against both.

use std::sync::Arc;

use tempfile::TempDir;

use crate::codec::{Codec, StorageRegistry};
use crate::coordinator::{Coordinator, NewObject, NewValue};
use crate::fs_storage::FsStorage;
use crate::oid::StorageId;
use crate::schema::{ClassDescriptor, FieldDescriptor, SchemaRegistry};
use crate::sql_storage::{SqlStorage, SqliteDriver};
use crate::storage::Storage;
use crate::value::Value;

fn backends(dir: &TempDir) -> Vec<(StorageRegistry, Codec, Arc<dyn Storage>)> {
    let mut out: Vec<(StorageRegistry, Codec, Arc<dyn Storage>)> = Vec::new();

    let registry = StorageRegistry::new();
    let codec = Codec::new(registry.clone());
    let fs = Arc::new(
        FsStorage::open(StorageId::new("fs0"), dir.path().join("fs"), codec.clone()).unwrap(),
    );
    registry.register(fs.clone()).unwrap();
    out.push((registry, codec, fs));

    let registry = StorageRegistry::new();
    let codec = Codec::new(registry.clone());
    let sql = Arc::new(
        SqlStorage::new(
            StorageId::new("db0"),
            SqliteDriver::open_in_memory().unwrap(),
            codec.clone(),
        )
        .unwrap(),
    );
    registry.register(sql.clone()).unwrap();
    out.push((registry, codec, sql));

    out
}

fn person_schema() -> SchemaRegistry {
    let schema = SchemaRegistry::new();
    schema.register(
        ClassDescriptor::new("Person")
            .field(FieldDescriptor::primitive("name"))
            .field(FieldDescriptor::primitive("age"))
            .field(FieldDescriptor::list("emails")),
    );
    schema
}

#[test]
fn test_person_scenario_on_both_backends() {
    let dir = TempDir::new().unwrap();
    for (registry, codec, storage) in backends(&dir) {
        let default = storage.id().clone();
        let coord = Coordinator::new(registry, person_schema(), codec, default);

        let person = NewObject::new("Person");
        person.set("name", NewValue::Value(Value::from("Ann")));
        let oid = coord.make_persistent(&person).unwrap();

        let live = coord.get_object(&oid).unwrap();
        coord.set_field(&live, "name", Value::from("Annie")).unwrap();

        let emails = coord.collection_proxy(&live, "emails").unwrap();
        let list = emails.as_list().unwrap();
        list.add(&Value::from("x")).unwrap();
        list.insert(0, &Value::from("y")).unwrap();
        assert_eq!(
            list.to_vec().unwrap(),
            vec![Value::from("y"), Value::from("x")]
        );
        list.remove(&Value::from("y")).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![Value::from("x")]);

        // Drop the live instance; reloading must observe every write.
        coord.release(&oid);
        let reloaded = coord.get_object(&oid).unwrap();
        assert_eq!(
            coord.get_field(&reloaded, "name").unwrap(),
            Some(Value::from("Annie"))
        );
        let list = coord
            .collection_proxy(&reloaded, "emails")
            .unwrap();
        assert_eq!(
            list.as_list().unwrap().to_vec().unwrap(),
            vec![Value::from("x")]
        );
    }
}

#[test]
fn test_scripted_storage_operations_match() {
    let dir = TempDir::new().unwrap();
    let mut observed: Vec<Vec<String>> = Vec::new();

    for (_registry, _codec, storage) in backends(&dir) {
        let mut log = Vec::new();

        let oid = storage.create_object("crm::Person").unwrap();
        storage.set_field(&oid, "name", &Value::from("Ann")).unwrap();
        storage.set_field(&oid, "age", &Value::from(33i64)).unwrap();
        storage
            .set_field(&oid, "active", &Value::from(true))
            .unwrap();
        storage
            .update_field(&oid, "name", &Value::from("Annie"))
            .unwrap();
        log.push(format!("class={}", storage.class_of(&oid).unwrap()));
        log.push(format!("name={:?}", storage.get_field(&oid, "name").unwrap()));
        log.push(format!("age={:?}", storage.get_field(&oid, "age").unwrap()));
        log.push(format!(
            "active={:?}",
            storage.get_field(&oid, "active").unwrap()
        ));

        let cid = storage.create_object("list").unwrap();
        for s in ["a", "b", "c"] {
            storage.add_to_list(&cid, &Value::from(s)).unwrap();
        }
        storage.insert_into_list(&cid, 1, &Value::from("x")).unwrap();
        storage.remove_list_value(&cid, &Value::from("b")).unwrap();
        log.push(format!("list={:?}", storage.get_list(&cid).unwrap()));
        log.push(format!(
            "idx={}",
            storage.list_index_of(&cid, &Value::from("c")).unwrap()
        ));
        log.push(format!("size={}", storage.list_size(&cid).unwrap()));

        log.push(format!("gen={}", storage.new_name("crm::Person").unwrap()));
        log.push(format!("gen={}", storage.new_name("crm::Person").unwrap()));

        storage.delete_object(&oid).unwrap();
        log.push(format!("deleted={}", storage.class_of(&oid).is_err()));

        observed.push(log);
    }

    assert_eq!(observed[0], observed[1], "backends diverged");
}

#[test]
fn test_reference_round_trip_on_both_backends() {
    let dir = TempDir::new().unwrap();
    for (_registry, _codec, storage) in backends(&dir) {
        let a = storage.create_object("Person").unwrap();
        let b = storage.create_object("Person").unwrap();
        storage.set_field(&a, "friend", &Value::Ref(b.clone())).unwrap();
        assert_eq!(
            storage.get_field(&a, "friend").unwrap(),
            Some(Value::Ref(b))
        );
    }
}

#[test]
fn test_cross_storage_reference_round_trip() {
    let dir = TempDir::new().unwrap();
    let registry = StorageRegistry::new();
    let codec = Codec::new(registry.clone());
    let fs = Arc::new(
        FsStorage::open(StorageId::new("fs0"), dir.path().join("fs"), codec.clone()).unwrap(),
    );
    let sql = Arc::new(
        SqlStorage::new(
            StorageId::new("db0"),
            SqliteDriver::open_in_memory().unwrap(),
            codec.clone(),
        )
        .unwrap(),
    );
    registry.register(fs.clone()).unwrap();
    registry.register(sql.clone()).unwrap();

    // A file-stored object pointing at a SQL-stored one: the encoded
    // field carries the `@db0` qualifier and decodes back through the
    // registry.
    let remote = sql.create_object("Account").unwrap();
    let local = fs.create_object("Person").unwrap();
    fs.set_field(&local, "account", &Value::Ref(remote.clone()))
        .unwrap();
    assert_eq!(
        fs.get_field(&local, "account").unwrap(),
        Some(Value::Ref(remote.clone()))
    );
    assert_eq!(
        codec.encode(&StorageId::new("fs0"), &Value::Ref(remote.clone())),
        format!("{}@db0", remote.local_id())
    );
}

#[test]
fn test_null_and_bytes_round_trip_on_both_backends() {
    let dir = TempDir::new().unwrap();
    for (_registry, _codec, storage) in backends(&dir) {
        let oid = storage.create_object("Blob").unwrap();
        storage.set_field(&oid, "payload", &Value::Bytes(vec![0, 255, 10, 32])).unwrap();
        storage.set_field(&oid, "note", &Value::Null).unwrap();
        assert_eq!(
            storage.get_field(&oid, "payload").unwrap(),
            Some(Value::Bytes(vec![0, 255, 10, 32]))
        );
        assert_eq!(storage.get_field(&oid, "note").unwrap(), Some(Value::Null));
    }
}
