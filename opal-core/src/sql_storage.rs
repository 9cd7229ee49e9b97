//! SQL storage backend.
//!
//! [`SqlStorage`] implements the [`Storage`] trait against any engine
//! exposed through the narrow [`SqlDriver`] seam. The generic layer
//! builds plain SQL strings (escaping values at the boundary) so that
//! engine specifics stay confined to the driver: sequence allocation,
//! table introspection and transactions differ per engine, row shapes
//! do not.
//!
//! Schema:
//!
//! - `classes (id, classid)`       class tag per object
//! - `objects (id, fieldid, value)` one row per stored field
//! - `lists   (id, idx, value)`    ordered by `idx`, gaps allowed
//! - `sets    (id, value)`
//! - `maps    (id, key, value)`
//! - `roots   (id, name)`          name bindings
//! - `storage (key, value)`        metadata, currently only `version`
//!
//! A `version` row tracks the on-disk format. Version 0 databases
//! (which predate the `storage` table and used bare class prefixes as
//! sequence names) are upgraded in place on open.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::info;

use crate::codec::Codec;
use crate::oid::{Oid, OidKey, StorageId};
use crate::schema::FieldDescriptor;
use crate::storage::{format_name, short_class_name};
use crate::storage::{Result, Storage, StorageError};
use crate::value::Value;

const CURRENT_VERSION: u64 = 1;
const OID_SEQUENCE: &str = "object_id";
const NAME_SEQUENCE_PREFIX: &str = "name_counter_";

/// Engine-specific operations needed by [`SqlStorage`].
///
/// `query` returns rows as stringified cells; integer and text columns
/// come back as their obvious string forms, SQL NULL as `None`.
pub trait SqlDriver: Send + Sync {
    fn execute(&self, sql: &str) -> Result<usize>;

    fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>>;

    fn has_table(&self, name: &str) -> Result<bool>;

    fn has_sequence(&self, name: &str) -> Result<bool>;

    fn rename_sequence(&self, from: &str, to: &str) -> Result<()>;

    /// Allocates and returns the next value of a sequence, starting at
    /// 1 for a sequence that has never been used.
    fn next_val(&self, name: &str) -> Result<u64>;

    /// Last allocated value, 0 for an unused sequence.
    fn current_val(&self, name: &str) -> Result<u64>;

    fn set_val(&self, name: &str, value: u64) -> Result<()>;

    /// Names of all sequences known to the engine.
    fn sequences(&self) -> Result<Vec<String>>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// SQL-backed [`Storage`], generic over the engine driver.
pub struct SqlStorage<D: SqlDriver> {
    id: StorageId,
    driver: D,
    codec: Codec,
}

impl<D: SqlDriver> SqlStorage<D> {
    pub fn new(id: StorageId, driver: D, codec: Codec) -> Result<Self> {
        let storage = SqlStorage { id, driver, codec };
        storage.bootstrap()?;
        Ok(storage)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn bootstrap(&self) -> Result<()> {
        // A database with data tables but no metadata table predates
        // versioning and is treated as version 0.
        let legacy = self.driver.has_table("classes")? && !self.driver.has_table("storage")?;

        for sql in [
            "create table if not exists classes (id integer not null, classid text not null)",
            "create table if not exists objects (id integer not null, fieldid text not null, value text not null)",
            "create table if not exists lists (id integer not null, idx integer not null, value text not null)",
            "create table if not exists sets (id integer not null, value text not null)",
            "create table if not exists maps (id integer not null, key text not null, value text not null)",
            "create table if not exists roots (id integer not null, name text not null)",
            "create table if not exists storage (key text primary key, value text not null)",
        ] {
            self.driver.execute(sql)?;
        }

        let mut version = match self.query_single("select value from storage where key = 'version'")? {
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| StorageError::Corrupt(format!("bad version '{v}'")))?,
            None if legacy => 0,
            None => CURRENT_VERSION,
        };

        if version > CURRENT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "database version {version} is newer than supported {CURRENT_VERSION}"
            )));
        }
        if version == 0 {
            self.upgrade_v0_to_v1()?;
            version = 1;
        }
        debug_assert_eq!(version, CURRENT_VERSION);

        self.driver
            .execute("delete from storage where key = 'version'")?;
        self.driver.execute(&format!(
            "insert into storage (key, value) values ('version', '{CURRENT_VERSION}')"
        ))?;
        Ok(())
    }

    /// Version 0 named its name-counter sequences after the bare class
    /// prefix. Rename them to the namespaced form.
    fn upgrade_v0_to_v1(&self) -> Result<()> {
        info!(storage = %self.id, "upgrading database from version 0 to 1");
        let rows = self.driver.query("select distinct classid from classes")?;
        for row in rows {
            let Some(Some(class)) = row.into_iter().next() else {
                continue;
            };
            let prefix = short_class_name(&class).to_lowercase();
            if !self.driver.has_sequence(&prefix)? {
                continue;
            }
            let target = format!("{NAME_SEQUENCE_PREFIX}{prefix}");
            if self.driver.has_sequence(&target)? {
                return Err(StorageError::Corrupt(format!(
                    "both legacy sequence '{prefix}' and '{target}' exist"
                )));
            }
            self.driver.rename_sequence(&prefix, &target)?;
        }
        Ok(())
    }

    fn query_single(&self, sql: &str) -> Result<Option<String>> {
        let rows = self.driver.query(sql)?;
        Ok(rows.into_iter().next().and_then(|r| r.into_iter().next()).flatten())
    }

    fn local(&self, oid: &Oid) -> Result<u64> {
        match oid.key() {
            OidKey::Num(n) => Ok(*n),
            OidKey::Text(_) => Err(StorageError::Corrupt(format!(
                "non-numeric oid {oid} on a SQL storage"
            ))),
        }
    }

    fn enc(&self, value: &Value) -> String {
        escape(&self.codec.encode(&self.id, value))
    }

    fn dec(&self, encoded: &str) -> Result<Value> {
        Ok(self.codec.decode(&self.id, encoded)?)
    }

    /// Physical `idx` of the row at logical position `index`, which may
    /// differ when deletions have left gaps.
    fn physical_index(&self, cid: &Oid, index: u64) -> Result<u64> {
        let id = self.local(cid)?;
        let row = self.query_single(&format!(
            "select idx from lists where id = {id} order by idx limit 1 offset {index}"
        ))?;
        match row {
            Some(idx) => idx
                .parse::<u64>()
                .map_err(|_| StorageError::Corrupt(format!("bad list index '{idx}'"))),
            None => Err(StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index,
                size: self.list_size(cid)?,
            }),
        }
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let n = self
            .query_single(sql)?
            .unwrap_or_else(|| "0".to_string());
        n.parse::<u64>()
            .map_err(|_| StorageError::Corrupt(format!("bad count '{n}'")))
    }
}

/// Doubles single quotes so arbitrary encoded values can be inlined in
/// SQL string literals.
fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

impl<D: SqlDriver> Storage for SqlStorage<D> {
    fn id(&self) -> &StorageId {
        &self.id
    }

    fn create_object(&self, class: &str) -> Result<Oid> {
        let id = self.driver.next_val(OID_SEQUENCE)?;
        self.driver.execute(&format!(
            "insert into classes (id, classid) values ({id}, '{}')",
            escape(class)
        ))?;
        Ok(Oid::numeric(self.id.clone(), id))
    }

    fn delete_object(&self, oid: &Oid) -> Result<()> {
        let id = self.local(oid)?;
        self.driver
            .execute(&format!("delete from objects where id = {id}"))?;
        self.driver
            .execute(&format!("delete from roots where id = {id}"))?;
        self.driver
            .execute(&format!("delete from classes where id = {id}"))?;
        Ok(())
    }

    fn class_of(&self, oid: &Oid) -> Result<String> {
        let id = self.local(oid)?;
        self.query_single(&format!("select classid from classes where id = {id}"))?
            .ok_or_else(|| StorageError::NoSuchOid(oid.clone()))
    }

    fn set_field(&self, oid: &Oid, field: &str, value: &Value) -> Result<()> {
        let id = self.local(oid)?;
        self.driver.execute(&format!(
            "insert into objects (id, fieldid, value) values ({id}, '{}', '{}')",
            escape(field),
            self.enc(value)
        ))?;
        Ok(())
    }

    fn update_field(&self, oid: &Oid, field: &str, value: &Value) -> Result<()> {
        let id = self.local(oid)?;
        let updated = self.driver.execute(&format!(
            "update objects set value = '{}' where id = {id} and fieldid = '{}'",
            self.enc(value),
            escape(field)
        ))?;
        if updated == 0 {
            self.set_field(oid, field, value)?;
        }
        Ok(())
    }

    fn get_field(&self, oid: &Oid, field: &str) -> Result<Option<Value>> {
        let id = self.local(oid)?;
        let row = self.query_single(&format!(
            "select value from objects where id = {id} and fieldid = '{}'",
            escape(field)
        ))?;
        row.map(|v| self.dec(&v)).transpose()
    }

    fn get_fields(&self, oid: &Oid, fields: &[&FieldDescriptor]) -> Result<Vec<Option<Value>>> {
        let id = self.local(oid)?;
        let rows = self.driver.query(&format!(
            "select fieldid, value from objects where id = {id}"
        ))?;
        let mut stored: BTreeMap<String, String> = BTreeMap::new();
        for row in rows {
            let mut cells = row.into_iter();
            if let (Some(Some(field)), Some(Some(value))) = (cells.next(), cells.next()) {
                stored.insert(field, value);
            }
        }
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if !field.persisted() {
                out.push(None);
                continue;
            }
            match stored.get(&field.name) {
                Some(encoded) => out.push(Some(self.dec(encoded)?)),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn remove_field(&self, oid: &Oid, field: &str) -> Result<()> {
        let id = self.local(oid)?;
        self.driver.execute(&format!(
            "delete from objects where id = {id} and fieldid = '{}'",
            escape(field)
        ))?;
        Ok(())
    }

    fn fields_of(&self, oid: &Oid) -> Result<Vec<(String, Value)>> {
        let id = self.local(oid)?;
        let rows = self.driver.query(&format!(
            "select fieldid, value from objects where id = {id} order by fieldid"
        ))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = row.into_iter();
            if let (Some(Some(field)), Some(Some(value))) = (cells.next(), cells.next()) {
                out.push((field, self.dec(&value)?));
            }
        }
        Ok(out)
    }

    fn add_to_list(&self, cid: &Oid, value: &Value) -> Result<()> {
        let id = self.local(cid)?;
        self.driver.execute(&format!(
            "insert into lists (id, idx, value) \
             select {id}, coalesce(max(idx) + 1, 0), '{}' from lists where id = {id}",
            self.enc(value)
        ))?;
        Ok(())
    }

    fn insert_into_list(&self, cid: &Oid, index: u64, value: &Value) -> Result<()> {
        let id = self.local(cid)?;
        let size = self.list_size(cid)?;
        if index > size {
            return Err(StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index,
                size,
            });
        }
        if index == size {
            return self.add_to_list(cid, value);
        }
        let at = self.physical_index(cid, index)?;
        self.driver.execute(&format!(
            "update lists set idx = idx + 1 where id = {id} and idx >= {at}"
        ))?;
        self.driver.execute(&format!(
            "insert into lists (id, idx, value) values ({id}, {at}, '{}')",
            self.enc(value)
        ))?;
        Ok(())
    }

    fn get_list(&self, cid: &Oid) -> Result<Vec<Value>> {
        let id = self.local(cid)?;
        let rows = self.driver.query(&format!(
            "select value from lists where id = {id} order by idx"
        ))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(Some(encoded)) = row.into_iter().next() {
                out.push(self.dec(&encoded)?);
            }
        }
        Ok(out)
    }

    fn get_list_item(&self, cid: &Oid, index: u64) -> Result<Value> {
        let id = self.local(cid)?;
        let row = self.query_single(&format!(
            "select value from lists where id = {id} order by idx limit 1 offset {index}"
        ))?;
        match row {
            Some(encoded) => self.dec(&encoded),
            None => Err(StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index,
                size: self.list_size(cid)?,
            }),
        }
    }

    fn set_list_item(&self, cid: &Oid, index: u64, value: &Value) -> Result<()> {
        let id = self.local(cid)?;
        let at = self.physical_index(cid, index)?;
        self.driver.execute(&format!(
            "update lists set value = '{}' where id = {id} and idx = {at}",
            self.enc(value)
        ))?;
        Ok(())
    }

    fn remove_list_index(&self, cid: &Oid, index: u64) -> Result<()> {
        let id = self.local(cid)?;
        let at = self.physical_index(cid, index)?;
        self.driver
            .execute(&format!("delete from lists where id = {id} and idx = {at}"))?;
        Ok(())
    }

    fn remove_list_value(&self, cid: &Oid, value: &Value) -> Result<()> {
        let id = self.local(cid)?;
        let first = self.query_single(&format!(
            "select min(idx) from lists where id = {id} and value = '{}'",
            self.enc(value)
        ))?;
        if let Some(at) = first {
            self.driver
                .execute(&format!("delete from lists where id = {id} and idx = {at}"))?;
        }
        Ok(())
    }

    fn list_index_of(&self, cid: &Oid, value: &Value) -> Result<i64> {
        let id = self.local(cid)?;
        let first = self.query_single(&format!(
            "select min(idx) from lists where id = {id} and value = '{}'",
            self.enc(value)
        ))?;
        match first {
            Some(at) => Ok(self.count(&format!(
                "select count(*) from lists where id = {id} and idx < {at}"
            ))? as i64),
            None => Ok(-1),
        }
    }

    fn list_last_index_of(&self, cid: &Oid, value: &Value) -> Result<i64> {
        let id = self.local(cid)?;
        let last = self.query_single(&format!(
            "select max(idx) from lists where id = {id} and value = '{}'",
            self.enc(value)
        ))?;
        match last {
            Some(at) => Ok(self.count(&format!(
                "select count(*) from lists where id = {id} and idx < {at}"
            ))? as i64),
            None => Ok(-1),
        }
    }

    fn list_contains(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let id = self.local(cid)?;
        Ok(self.count(&format!(
            "select count(*) from lists where id = {id} and value = '{}'",
            self.enc(value)
        ))? > 0)
    }

    fn list_size(&self, cid: &Oid) -> Result<u64> {
        let id = self.local(cid)?;
        self.count(&format!("select count(*) from lists where id = {id}"))
    }

    fn clear_list(&self, cid: &Oid) -> Result<()> {
        let id = self.local(cid)?;
        self.driver
            .execute(&format!("delete from lists where id = {id}"))?;
        Ok(())
    }

    fn add_to_set(&self, cid: &Oid, value: &Value) -> Result<bool> {
        if self.set_contains(cid, value)? {
            return Ok(false);
        }
        let id = self.local(cid)?;
        self.driver.execute(&format!(
            "insert into sets (id, value) values ({id}, '{}')",
            self.enc(value)
        ))?;
        Ok(true)
    }

    fn remove_from_set(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let id = self.local(cid)?;
        let removed = self.driver.execute(&format!(
            "delete from sets where id = {id} and value = '{}'",
            self.enc(value)
        ))?;
        Ok(removed > 0)
    }

    fn get_set(&self, cid: &Oid) -> Result<Vec<Value>> {
        let id = self.local(cid)?;
        let rows = self
            .driver
            .query(&format!("select value from sets where id = {id}"))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(Some(encoded)) = row.into_iter().next() {
                out.push(self.dec(&encoded)?);
            }
        }
        Ok(out)
    }

    fn set_contains(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let id = self.local(cid)?;
        Ok(self.count(&format!(
            "select count(*) from sets where id = {id} and value = '{}'",
            self.enc(value)
        ))? > 0)
    }

    fn set_size(&self, cid: &Oid) -> Result<u64> {
        let id = self.local(cid)?;
        self.count(&format!("select count(*) from sets where id = {id}"))
    }

    fn clear_set(&self, cid: &Oid) -> Result<()> {
        let id = self.local(cid)?;
        self.driver
            .execute(&format!("delete from sets where id = {id}"))?;
        Ok(())
    }

    fn put_in_map(&self, cid: &Oid, key: &Value, value: &Value) -> Result<Option<Value>> {
        let id = self.local(cid)?;
        let previous = self.get_from_map(cid, key)?;
        if previous.is_some() {
            self.driver.execute(&format!(
                "update maps set value = '{}' where id = {id} and key = '{}'",
                self.enc(value),
                self.enc(key)
            ))?;
        } else {
            self.driver.execute(&format!(
                "insert into maps (id, key, value) values ({id}, '{}', '{}')",
                self.enc(key),
                self.enc(value)
            ))?;
        }
        Ok(previous)
    }

    fn get_from_map(&self, cid: &Oid, key: &Value) -> Result<Option<Value>> {
        let id = self.local(cid)?;
        let row = self.query_single(&format!(
            "select value from maps where id = {id} and key = '{}'",
            self.enc(key)
        ))?;
        row.map(|v| self.dec(&v)).transpose()
    }

    fn get_map(&self, cid: &Oid) -> Result<Vec<(Value, Value)>> {
        let id = self.local(cid)?;
        let rows = self
            .driver
            .query(&format!("select key, value from maps where id = {id}"))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = row.into_iter();
            if let (Some(Some(key)), Some(Some(value))) = (cells.next(), cells.next()) {
                out.push((self.dec(&key)?, self.dec(&value)?));
            }
        }
        Ok(out)
    }

    fn map_contains_key(&self, cid: &Oid, key: &Value) -> Result<bool> {
        let id = self.local(cid)?;
        Ok(self.count(&format!(
            "select count(*) from maps where id = {id} and key = '{}'",
            self.enc(key)
        ))? > 0)
    }

    fn map_contains_value(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let id = self.local(cid)?;
        Ok(self.count(&format!(
            "select count(*) from maps where id = {id} and value = '{}'",
            self.enc(value)
        ))? > 0)
    }

    fn remove_from_map(&self, cid: &Oid, key: &Value) -> Result<Option<Value>> {
        let id = self.local(cid)?;
        let previous = self.get_from_map(cid, key)?;
        if previous.is_some() {
            self.driver.execute(&format!(
                "delete from maps where id = {id} and key = '{}'",
                self.enc(key)
            ))?;
        }
        Ok(previous)
    }

    fn map_size(&self, cid: &Oid) -> Result<u64> {
        let id = self.local(cid)?;
        self.count(&format!("select count(*) from maps where id = {id}"))
    }

    fn clear_map(&self, cid: &Oid) -> Result<()> {
        let id = self.local(cid)?;
        self.driver
            .execute(&format!("delete from maps where id = {id}"))?;
        Ok(())
    }

    fn new_name(&self, class: &str) -> Result<String> {
        let prefix = short_class_name(class).to_lowercase();
        let sequence = format!("{NAME_SEQUENCE_PREFIX}{prefix}");
        let counter = self.driver.next_val(&sequence)? - 1;
        Ok(format_name(class, counter))
    }

    fn get_oid_from_name(&self, name: &str) -> Result<Option<Oid>> {
        let row = self.query_single(&format!(
            "select id from roots where name = '{}'",
            escape(name)
        ))?;
        match row {
            Some(id) => {
                let id = id
                    .parse::<u64>()
                    .map_err(|_| StorageError::Corrupt(format!("bad root id '{id}'")))?;
                Ok(Some(Oid::numeric(self.id.clone(), id)))
            }
            None => Ok(None),
        }
    }

    fn get_name_from_oid(&self, oid: &Oid) -> Result<Option<String>> {
        let id = self.local(oid)?;
        self.query_single(&format!("select name from roots where id = {id}"))
    }

    fn bind_oid_to_name(&self, oid: &Oid, name: &str) -> Result<()> {
        let id = self.local(oid)?;
        self.driver.execute(&format!(
            "delete from roots where name = '{}'",
            escape(name)
        ))?;
        self.driver.execute(&format!(
            "insert into roots (id, name) values ({id}, '{}')",
            escape(name)
        ))?;
        Ok(())
    }

    fn delete_name(&self, name: &str) -> Result<()> {
        self.driver.execute(&format!(
            "delete from roots where name = '{}'",
            escape(name)
        ))?;
        Ok(())
    }

    fn name_counters(&self) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        for sequence in self.driver.sequences()? {
            if let Some(prefix) = sequence.strip_prefix(NAME_SEQUENCE_PREFIX) {
                out.insert(prefix.to_string(), self.driver.current_val(&sequence)?);
            }
        }
        Ok(out)
    }

    fn update_name_counters(&self, counters: &BTreeMap<String, u64>) -> Result<()> {
        for (prefix, n) in counters {
            let sequence = format!("{NAME_SEQUENCE_PREFIX}{prefix}");
            if self.driver.current_val(&sequence)? < *n {
                self.driver.set_val(&sequence, *n)?;
            }
        }
        Ok(())
    }

    fn objects_of_classes(&self, classes: &[String]) -> Result<Vec<Oid>> {
        if classes.is_empty() {
            return Ok(Vec::new());
        }
        let list = classes
            .iter()
            .map(|c| format!("'{}'", escape(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self.driver.query(&format!(
            "select id from classes where classid in ({list}) order by id"
        ))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(Some(id)) = row.into_iter().next() {
                let id = id
                    .parse::<u64>()
                    .map_err(|_| StorageError::Corrupt(format!("bad object id '{id}'")))?;
                out.push(Oid::numeric(self.id.clone(), id));
            }
        }
        Ok(out)
    }

    fn root_objects(&self) -> Result<Vec<(String, Oid)>> {
        let rows = self
            .driver
            .query("select name, id from roots order by name")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = row.into_iter();
            if let (Some(Some(name)), Some(Some(id))) = (cells.next(), cells.next()) {
                let id = id
                    .parse::<u64>()
                    .map_err(|_| StorageError::Corrupt(format!("bad root id '{id}'")))?;
                out.push((name, Oid::numeric(self.id.clone(), id)));
            }
        }
        Ok(out)
    }

    fn close(&self) -> Result<()> {
        self.driver.close()
    }

    fn start_transaction(&self) -> Result<()> {
        self.driver.begin()
    }

    fn commit(&self) -> Result<()> {
        self.driver.commit()
    }

    fn rollback(&self) -> Result<()> {
        self.driver.rollback()
    }
}

/// [`SqlDriver`] over an embedded SQLite database.
///
/// SQLite has no native sequences; they are emulated with a
/// `sequences (name, value)` table updated atomically via upsert.
pub struct SqliteDriver {
    conn: Mutex<Option<Connection>>,
}

impl SqliteDriver {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "create table if not exists sequences (
                 name text primary key,
                 value integer not null
             )",
        )
        .map_err(sql_err)?;
        Ok(SqliteDriver {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap()
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let guard = self.conn();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        f(conn).map_err(sql_err)
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Sql(e.to_string())
}

impl SqlDriver for SqliteDriver {
    fn execute(&self, sql: &str) -> Result<usize> {
        self.with_conn(|conn| conn.execute(sql, []))
    }

    fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns = stmt.column_count();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut cells = Vec::with_capacity(columns);
                for i in 0..columns {
                    let cell = match row.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => None,
                        rusqlite::types::ValueRef::Integer(n) => Some(n.to_string()),
                        rusqlite::types::ValueRef::Real(x) => Some(x.to_string()),
                        rusqlite::types::ValueRef::Text(t) => {
                            Some(String::from_utf8_lossy(t).into_owned())
                        }
                        rusqlite::types::ValueRef::Blob(b) => {
                            Some(String::from_utf8_lossy(b).into_owned())
                        }
                    };
                    cells.push(cell);
                }
                out.push(cells);
            }
            Ok(out)
        })
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("select 1 from sqlite_master where type = 'table' and name = ?1")?;
            stmt.exists([name])
        })
    }

    fn has_sequence(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("select 1 from sequences where name = ?1")?;
            stmt.exists([name])
        })
    }

    fn rename_sequence(&self, from: &str, to: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("update sequences set name = ?2 where name = ?1", [from, to])
                .map(|_| ())
        })
    }

    fn next_val(&self, name: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.execute(
                "insert into sequences (name, value) values (?1, 1)
                 on conflict (name) do update set value = value + 1",
                [name],
            )?;
            conn.query_row("select value from sequences where name = ?1", [name], |r| {
                r.get::<_, i64>(0)
            })
            .map(|n| n as u64)
        })
    }

    fn current_val(&self, name: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("select value from sequences where name = ?1")?;
            let mut rows = stmt.query([name])?;
            match rows.next()? {
                Some(row) => row.get::<_, i64>(0).map(|n| n as u64),
                None => Ok(0),
            }
        })
    }

    fn set_val(&self, name: &str, value: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "insert into sequences (name, value) values (?1, ?2)
                 on conflict (name) do update set value = excluded.value",
                rusqlite::params![name, value as i64],
            )
            .map(|_| ())
        })
    }

    fn sequences(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("select name from sequences order by name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    fn begin(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("begin"))
    }

    fn commit(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("commit"))
    }

    fn rollback(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("rollback"))
    }

    fn close(&self) -> Result<()> {
        // Dropping the connection closes the database.
        self.conn().take();
        Ok(())
    }
}
