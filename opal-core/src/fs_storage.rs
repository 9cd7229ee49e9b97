//! Flat-file storage backend.
//!
//! Layout under the base directory:
//!
//! - `oids`          name bindings, one `<localId> <name>` per line
//! - `classes`       class tags, one `<localId> <class>` per line
//! - `nameCounters`  per-class name counters, `<prefix> <n>` per line
//! - `<localId>`     per-object field file (`field=value` lines) or
//!                   per-collection element file (one element per
//!                   line; map entries are `<key> <value>` pairs)
//!
//! Tokens are escaped so that newlines, spaces and `=` never break the
//! line format. Index files are rewritten atomically (temp file +
//! rename) and all mutation goes through a single gate, so concurrent
//! callers never observe a half-written index.
//!
//! On open, the index files are replayed and repaired: duplicate names
//! get a fresh generated name, counters that lag behind existing names
//! are advanced, and pre-`#` legacy names (`person123`) are migrated
//! to the current `person#123` form.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::oid::{Oid, OidKey, StorageId};
use crate::schema::FieldDescriptor;
use crate::storage::{format_name, name_counter_suffix, short_class_name};
use crate::storage::{Result, Storage, StorageError};
use crate::value::Value;

const OIDS_FILE: &str = "oids";
const CLASSES_FILE: &str = "classes";
const COUNTERS_FILE: &str = "nameCounters";

#[derive(Default)]
struct FsState {
    names: HashMap<String, Oid>,
    oid_names: HashMap<Oid, String>,
    classes: HashMap<Oid, String>,
    counters: BTreeMap<String, u64>,
    last_oid: u64,
}

/// File-backed [`Storage`].
pub struct FsStorage {
    id: StorageId,
    base_dir: PathBuf,
    codec: Codec,
    // Single write gate; index maps and files mutate together.
    state: Mutex<FsState>,
}

impl FsStorage {
    pub fn open(id: StorageId, base_dir: impl Into<PathBuf>, codec: Codec) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        let storage = FsStorage {
            id,
            base_dir,
            codec,
            state: Mutex::new(FsState::default()),
        };
        storage.load_and_repair()?;
        Ok(storage)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn state(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap()
    }

    fn path(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }

    fn object_path(&self, oid: &Oid) -> PathBuf {
        self.base_dir.join(oid.local_id())
    }

    fn load_and_repair(&self) -> Result<()> {
        let mut state = self.state();

        for (local, class) in self.read_index(CLASSES_FILE)? {
            let oid = parse_local_id(self.id.clone(), &local);
            if let OidKey::Num(n) = oid.key() {
                state.last_oid = state.last_oid.max(*n);
            }
            state.classes.insert(oid, class);
        }

        for (prefix, counter) in self.read_index(COUNTERS_FILE)? {
            if let Ok(n) = counter.parse::<u64>() {
                state.counters.insert(prefix, n);
            }
        }

        let mut repaired = false;
        for (local, name) in self.read_index(OIDS_FILE)? {
            let oid = parse_local_id(self.id.clone(), &local);
            let mut name = name;
            if let Some(migrated) = self.migrate_legacy_name(&state, &oid, &name) {
                info!(storage = %self.id, old = %name, new = %migrated,
                      "migrated legacy generated name");
                name = migrated;
                repaired = true;
            }
            if state.names.contains_key(&name) {
                let class = state.classes.get(&oid).cloned().unwrap_or_default();
                let fresh = next_unique_name(&mut state, &class);
                warn!(storage = %self.id, oid = %oid, duplicate = %name, renamed = %fresh,
                      "duplicate name binding repaired");
                name = fresh;
                repaired = true;
            }
            state.names.insert(name.clone(), oid.clone());
            state.oid_names.insert(oid, name);
        }

        // Counters must stay ahead of every generated name already in
        // use; the repair takes the highest suffix per prefix, whatever
        // order the names are visited in.
        let mut advanced: BTreeMap<String, u64> = BTreeMap::new();
        for name in state.names.keys() {
            if let Some((prefix, n)) = name_counter_suffix(name) {
                let current = state.counters.get(prefix).copied().unwrap_or(0);
                if n >= current {
                    let next = advanced.entry(prefix.to_string()).or_insert(n + 1);
                    *next = (*next).max(n + 1);
                }
            }
        }
        for (prefix, n) in advanced {
            warn!(storage = %self.id, class = %prefix, counter = n,
                  "name counter lagged behind existing names, advanced");
            state.counters.insert(prefix, n);
            repaired = true;
        }

        if repaired {
            self.save_names(&state)?;
            self.save_counters(&state)?;
        }
        Ok(())
    }

    /// `person123` was the generated-name form of older deployments.
    /// Detects it by matching the short class prefix of the object's
    /// own class tag, so explicitly bound names ending in digits are
    /// left alone.
    fn migrate_legacy_name(&self, state: &FsState, oid: &Oid, name: &str) -> Option<String> {
        if name.contains('#') {
            return None;
        }
        let class = state.classes.get(oid)?;
        let prefix = short_class_name(class).to_lowercase();
        let digits = name.strip_prefix(prefix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(format!("{prefix}#{digits}"))
    }

    // --- index file I/O ---

    fn read_index(&self, file: &str) -> Result<Vec<(String, String)>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let mut out = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match split_tokens(line) {
                Some((a, b)) => out.push((a, b)),
                None => {
                    return Err(StorageError::Corrupt(format!(
                        "bad line in {file}: '{line}'"
                    )))
                }
            }
        }
        Ok(out)
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(content.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn save_names(&self, state: &FsState) -> Result<()> {
        let mut lines: Vec<String> = state
            .oid_names
            .iter()
            .map(|(oid, name)| format!("{} {}", escape_token(&oid.local_id()), escape_token(name)))
            .collect();
        lines.sort();
        self.write_atomic(&self.path(OIDS_FILE), &join_lines(&lines))
    }

    fn save_classes(&self, state: &FsState) -> Result<()> {
        let mut lines: Vec<String> = state
            .classes
            .iter()
            .map(|(oid, class)| {
                format!("{} {}", escape_token(&oid.local_id()), escape_token(class))
            })
            .collect();
        lines.sort();
        self.write_atomic(&self.path(CLASSES_FILE), &join_lines(&lines))
    }

    fn save_counters(&self, state: &FsState) -> Result<()> {
        let lines: Vec<String> = state
            .counters
            .iter()
            .map(|(prefix, n)| format!("{} {}", escape_token(prefix), n))
            .collect();
        self.write_atomic(&self.path(COUNTERS_FILE), &join_lines(&lines))
    }

    // --- object field files ---

    fn read_fields(&self, oid: &Oid) -> Result<HashMap<String, String>> {
        let path = self.object_path(oid);
        let mut out = HashMap::new();
        if !path.exists() {
            return Ok(out);
        }
        let content = fs::read_to_string(&path)?;
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match split_once_unescaped(line, '=') {
                Some((field, value)) => {
                    out.insert(unescape_token(field), unescape_token(value));
                }
                None => {
                    return Err(StorageError::Corrupt(format!(
                        "bad field line for {oid}: '{line}'"
                    )))
                }
            }
        }
        Ok(out)
    }

    fn write_fields(&self, oid: &Oid, fields: &HashMap<String, String>) -> Result<()> {
        let path = self.object_path(oid);
        if fields.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }
        let mut lines: Vec<String> = fields
            .iter()
            .map(|(field, value)| format!("{}={}", escape_token(field), escape_token(value)))
            .collect();
        lines.sort();
        self.write_atomic(&path, &join_lines(&lines))
    }

    // --- collection files ---

    fn read_lines(&self, cid: &Oid) -> Result<Vec<String>> {
        let path = self.object_path(cid);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    fn write_lines(&self, cid: &Oid, lines: &[String]) -> Result<()> {
        let path = self.object_path(cid);
        if lines.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }
        self.write_atomic(&path, &join_lines(lines))
    }

    fn read_elements(&self, cid: &Oid) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for line in self.read_lines(cid)? {
            let encoded = unescape_token(&line);
            match self.codec.decode(&self.id, &encoded) {
                Ok(value) => out.push(value),
                Err(err) => {
                    error!(storage = %self.id, collection = %cid, element = %encoded, %err,
                           "skipping undecodable collection element");
                }
            }
        }
        Ok(out)
    }

    fn write_elements(&self, cid: &Oid, elements: &[Value]) -> Result<()> {
        let lines: Vec<String> = elements
            .iter()
            .map(|v| escape_token(&self.codec.encode(&self.id, v)))
            .collect();
        self.write_lines(cid, &lines)
    }

    fn read_entries(&self, cid: &Oid) -> Result<Vec<(Value, Value)>> {
        let mut out = Vec::new();
        for line in self.read_lines(cid)? {
            let Some((key, value)) = split_tokens(&line) else {
                return Err(StorageError::Corrupt(format!(
                    "bad map line for {cid}: '{line}'"
                )));
            };
            let key = match self.codec.decode(&self.id, &key) {
                Ok(v) => v,
                Err(err) => {
                    error!(storage = %self.id, collection = %cid, %err,
                           "skipping map entry with undecodable key");
                    continue;
                }
            };
            let value = match self.codec.decode(&self.id, &value) {
                Ok(v) => v,
                Err(err) => {
                    error!(storage = %self.id, collection = %cid, %err,
                           "skipping map entry with undecodable value");
                    continue;
                }
            };
            out.push((key, value));
        }
        Ok(out)
    }

    fn write_entries(&self, cid: &Oid, entries: &[(Value, Value)]) -> Result<()> {
        let lines: Vec<String> = entries
            .iter()
            .map(|(k, v)| {
                format!(
                    "{} {}",
                    escape_token(&self.codec.encode(&self.id, k)),
                    escape_token(&self.codec.encode(&self.id, v))
                )
            })
            .collect();
        self.write_lines(cid, &lines)
    }
}

fn parse_local_id(storage: StorageId, local: &str) -> Oid {
    match local.parse::<u64>() {
        Ok(n) => Oid::numeric(storage, n),
        Err(_) => Oid::text(storage, local),
    }
}

fn next_unique_name(state: &mut FsState, class: &str) -> String {
    let prefix = short_class_name(class).to_lowercase();
    let mut counter = state.counters.get(&prefix).copied().unwrap_or(0);
    let mut name = format_name(class, counter);
    while state.names.contains_key(&name) {
        counter += 1;
        name = format_name(class, counter);
    }
    state.counters.insert(prefix, counter + 1);
    name
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn escape_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ' ' => out.push_str("\\s"),
            '=' => out.push_str("\\="),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('s') => out.push(' '),
            Some('=') => out.push('='),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Splits a line at the first unescaped space and unescapes both sides.
fn split_tokens(line: &str) -> Option<(String, String)> {
    let (a, b) = split_once_unescaped(line, ' ')?;
    Some((unescape_token(a), unescape_token(b)))
}

fn split_once_unescaped(line: &str, sep: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((&line[..i], &line[i + c.len_utf8()..]));
        }
    }
    None
}

impl Storage for FsStorage {
    fn id(&self) -> &StorageId {
        &self.id
    }

    fn create_object(&self, class: &str) -> Result<Oid> {
        let mut state = self.state();
        state.last_oid += 1;
        let oid = Oid::numeric(self.id.clone(), state.last_oid);
        state.classes.insert(oid.clone(), class.to_string());
        self.save_classes(&state)?;
        Ok(oid)
    }

    fn delete_object(&self, oid: &Oid) -> Result<()> {
        let mut state = self.state();
        state.classes.remove(oid);
        self.save_classes(&state)?;
        if let Some(name) = state.oid_names.remove(oid) {
            state.names.remove(&name);
            self.save_names(&state)?;
        }
        let path = self.object_path(oid);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn class_of(&self, oid: &Oid) -> Result<String> {
        self.state()
            .classes
            .get(oid)
            .cloned()
            .ok_or_else(|| StorageError::NoSuchOid(oid.clone()))
    }

    fn set_field(&self, oid: &Oid, field: &str, value: &Value) -> Result<()> {
        let _state = self.state();
        let mut fields = self.read_fields(oid)?;
        fields.insert(field.to_string(), self.codec.encode(&self.id, value));
        self.write_fields(oid, &fields)
    }

    fn update_field(&self, oid: &Oid, field: &str, value: &Value) -> Result<()> {
        // Same file write either way on this backend.
        self.set_field(oid, field, value)
    }

    fn get_field(&self, oid: &Oid, field: &str) -> Result<Option<Value>> {
        let _state = self.state();
        let fields = self.read_fields(oid)?;
        match fields.get(field) {
            Some(encoded) => Ok(Some(self.codec.decode(&self.id, encoded)?)),
            None => Ok(None),
        }
    }

    fn get_fields(&self, oid: &Oid, fields: &[&FieldDescriptor]) -> Result<Vec<Option<Value>>> {
        let _state = self.state();
        let stored = self.read_fields(oid)?;
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            if !field.persisted() {
                out.push(None);
                continue;
            }
            match stored.get(&field.name) {
                Some(encoded) => out.push(Some(self.codec.decode(&self.id, encoded)?)),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn remove_field(&self, oid: &Oid, field: &str) -> Result<()> {
        let _state = self.state();
        let mut fields = self.read_fields(oid)?;
        fields.remove(field);
        self.write_fields(oid, &fields)
    }

    fn fields_of(&self, oid: &Oid) -> Result<Vec<(String, Value)>> {
        let _state = self.state();
        let mut out = Vec::new();
        for (field, encoded) in self.read_fields(oid)? {
            out.push((field, self.codec.decode(&self.id, &encoded)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn add_to_list(&self, cid: &Oid, value: &Value) -> Result<()> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        elements.push(value.clone());
        self.write_elements(cid, &elements)
    }

    fn insert_into_list(&self, cid: &Oid, index: u64, value: &Value) -> Result<()> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        let index = index as usize;
        if index > elements.len() {
            return Err(StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index: index as u64,
                size: elements.len() as u64,
            });
        }
        elements.insert(index, value.clone());
        self.write_elements(cid, &elements)
    }

    fn get_list(&self, cid: &Oid) -> Result<Vec<Value>> {
        let _state = self.state();
        self.read_elements(cid)
    }

    fn get_list_item(&self, cid: &Oid, index: u64) -> Result<Value> {
        let _state = self.state();
        let elements = self.read_elements(cid)?;
        elements
            .get(index as usize)
            .cloned()
            .ok_or_else(|| StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index,
                size: elements.len() as u64,
            })
    }

    fn set_list_item(&self, cid: &Oid, index: u64, value: &Value) -> Result<()> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        let size = elements.len() as u64;
        match elements.get_mut(index as usize) {
            Some(slot) => {
                *slot = value.clone();
                self.write_elements(cid, &elements)
            }
            None => Err(StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index,
                size,
            }),
        }
    }

    fn remove_list_index(&self, cid: &Oid, index: u64) -> Result<()> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        if index as usize >= elements.len() {
            return Err(StorageError::IndexOutOfBounds {
                cid: cid.clone(),
                index,
                size: elements.len() as u64,
            });
        }
        elements.remove(index as usize);
        self.write_elements(cid, &elements)
    }

    fn remove_list_value(&self, cid: &Oid, value: &Value) -> Result<()> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        if let Some(pos) = elements.iter().position(|v| v == value) {
            elements.remove(pos);
            self.write_elements(cid, &elements)?;
        }
        Ok(())
    }

    fn list_index_of(&self, cid: &Oid, value: &Value) -> Result<i64> {
        let _state = self.state();
        let elements = self.read_elements(cid)?;
        Ok(elements
            .iter()
            .position(|v| v == value)
            .map(|i| i as i64)
            .unwrap_or(-1))
    }

    fn list_last_index_of(&self, cid: &Oid, value: &Value) -> Result<i64> {
        let _state = self.state();
        let elements = self.read_elements(cid)?;
        Ok(elements
            .iter()
            .rposition(|v| v == value)
            .map(|i| i as i64)
            .unwrap_or(-1))
    }

    fn list_contains(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let _state = self.state();
        Ok(self.read_elements(cid)?.contains(value))
    }

    fn list_size(&self, cid: &Oid) -> Result<u64> {
        let _state = self.state();
        Ok(self.read_lines(cid)?.len() as u64)
    }

    fn clear_list(&self, cid: &Oid) -> Result<()> {
        let _state = self.state();
        self.write_lines(cid, &[])
    }

    fn add_to_set(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        if elements.contains(value) {
            return Ok(false);
        }
        elements.push(value.clone());
        self.write_elements(cid, &elements)?;
        Ok(true)
    }

    fn remove_from_set(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let _state = self.state();
        let mut elements = self.read_elements(cid)?;
        match elements.iter().position(|v| v == value) {
            Some(pos) => {
                elements.remove(pos);
                self.write_elements(cid, &elements)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_set(&self, cid: &Oid) -> Result<Vec<Value>> {
        let _state = self.state();
        self.read_elements(cid)
    }

    fn set_contains(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let _state = self.state();
        Ok(self.read_elements(cid)?.contains(value))
    }

    fn set_size(&self, cid: &Oid) -> Result<u64> {
        let _state = self.state();
        Ok(self.read_lines(cid)?.len() as u64)
    }

    fn clear_set(&self, cid: &Oid) -> Result<()> {
        let _state = self.state();
        self.write_lines(cid, &[])
    }

    fn put_in_map(&self, cid: &Oid, key: &Value, value: &Value) -> Result<Option<Value>> {
        let _state = self.state();
        let mut entries = self.read_entries(cid)?;
        let previous = match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value.clone())),
            None => {
                entries.push((key.clone(), value.clone()));
                None
            }
        };
        self.write_entries(cid, &entries)?;
        Ok(previous)
    }

    fn get_from_map(&self, cid: &Oid, key: &Value) -> Result<Option<Value>> {
        let _state = self.state();
        Ok(self
            .read_entries(cid)?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    fn get_map(&self, cid: &Oid) -> Result<Vec<(Value, Value)>> {
        let _state = self.state();
        self.read_entries(cid)
    }

    fn map_contains_key(&self, cid: &Oid, key: &Value) -> Result<bool> {
        let _state = self.state();
        Ok(self.read_entries(cid)?.iter().any(|(k, _)| k == key))
    }

    fn map_contains_value(&self, cid: &Oid, value: &Value) -> Result<bool> {
        let _state = self.state();
        Ok(self.read_entries(cid)?.iter().any(|(_, v)| v == value))
    }

    fn remove_from_map(&self, cid: &Oid, key: &Value) -> Result<Option<Value>> {
        let _state = self.state();
        let mut entries = self.read_entries(cid)?;
        match entries.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                let (_, value) = entries.remove(pos);
                self.write_entries(cid, &entries)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn map_size(&self, cid: &Oid) -> Result<u64> {
        let _state = self.state();
        Ok(self.read_lines(cid)?.len() as u64)
    }

    fn clear_map(&self, cid: &Oid) -> Result<()> {
        let _state = self.state();
        self.write_lines(cid, &[])
    }

    fn new_name(&self, class: &str) -> Result<String> {
        let mut state = self.state();
        let name = next_unique_name(&mut state, class);
        self.save_counters(&state)?;
        Ok(name)
    }

    fn get_oid_from_name(&self, name: &str) -> Result<Option<Oid>> {
        Ok(self.state().names.get(name).cloned())
    }

    fn get_name_from_oid(&self, oid: &Oid) -> Result<Option<String>> {
        Ok(self.state().oid_names.get(oid).cloned())
    }

    fn bind_oid_to_name(&self, oid: &Oid, name: &str) -> Result<()> {
        let mut state = self.state();
        // A name binds one object and an object holds one name, so
        // rebinding evicts the previous holder on both sides.
        if let Some(old_oid) = state.names.insert(name.to_string(), oid.clone()) {
            if &old_oid != oid {
                state.oid_names.remove(&old_oid);
            }
        }
        if let Some(old_name) = state.oid_names.insert(oid.clone(), name.to_string()) {
            if old_name != name {
                state.names.remove(&old_name);
            }
        }
        self.save_names(&state)
    }

    fn delete_name(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(oid) = state.names.remove(name) {
            state.oid_names.remove(&oid);
            self.save_names(&state)?;
        }
        Ok(())
    }

    fn name_counters(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.state().counters.clone())
    }

    fn update_name_counters(&self, counters: &BTreeMap<String, u64>) -> Result<()> {
        let mut state = self.state();
        for (prefix, n) in counters {
            let current = state.counters.get(prefix).copied().unwrap_or(0);
            if *n > current {
                state.counters.insert(prefix.clone(), *n);
            }
        }
        self.save_counters(&state)
    }

    fn objects_of_classes(&self, classes: &[String]) -> Result<Vec<Oid>> {
        let state = self.state();
        let mut out: Vec<Oid> = state
            .classes
            .iter()
            .filter(|(_, class)| classes.iter().any(|c| c == *class))
            .map(|(oid, _)| oid.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    fn root_objects(&self) -> Result<Vec<(String, Oid)>> {
        let state = self.state();
        let mut out: Vec<(String, Oid)> = state
            .names
            .iter()
            .map(|(name, oid)| (name.clone(), oid.clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    // The file backend applies every write immediately; transactions
    // are accepted for interface compatibility.
    fn start_transaction(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StorageRegistry;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FsStorage {
        let codec = Codec::new(StorageRegistry::new());
        FsStorage::open(StorageId::new("fs0"), dir.path(), codec).unwrap()
    }

    #[test]
    fn test_escape_round_trip() {
        for s in ["plain", "a b", "k=v", "line\nbreak", "back\\slash", ""] {
            assert_eq!(unescape_token(&escape_token(s)), s);
        }
        assert!(!escape_token("a b=c").contains(' '));
        assert!(!escape_token("a b=c").contains('='));
    }

    #[test]
    fn test_fields_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let oid = {
            let storage = open(&dir);
            let oid = storage.create_object("crm::Person").unwrap();
            storage
                .set_field(&oid, "name", &Value::from("Ann"))
                .unwrap();
            storage.set_field(&oid, "age", &Value::from(33i64)).unwrap();
            storage.close().unwrap();
            oid
        };
        let storage = open(&dir);
        assert_eq!(storage.class_of(&oid).unwrap(), "crm::Person");
        assert_eq!(
            storage.get_field(&oid, "name").unwrap(),
            Some(Value::from("Ann"))
        );
        assert_eq!(
            storage.get_field(&oid, "age").unwrap(),
            Some(Value::from(33i64))
        );
        assert_eq!(storage.get_field(&oid, "missing").unwrap(), None);
    }

    #[test]
    fn test_list_operations() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let cid = storage.create_object("list").unwrap();

        storage.add_to_list(&cid, &Value::from("x")).unwrap();
        storage
            .insert_into_list(&cid, 0, &Value::from("y"))
            .unwrap();
        assert_eq!(
            storage.get_list(&cid).unwrap(),
            vec![Value::from("y"), Value::from("x")]
        );
        assert_eq!(storage.list_index_of(&cid, &Value::from("x")).unwrap(), 1);
        assert_eq!(storage.list_index_of(&cid, &Value::from("z")).unwrap(), -1);

        storage.remove_list_value(&cid, &Value::from("y")).unwrap();
        assert_eq!(storage.get_list(&cid).unwrap(), vec![Value::from("x")]);
        assert_eq!(storage.list_size(&cid).unwrap(), 1);

        assert!(matches!(
            storage.get_list_item(&cid, 5),
            Err(StorageError::IndexOutOfBounds { .. })
        ));

        storage.clear_list(&cid).unwrap();
        assert_eq!(storage.list_size(&cid).unwrap(), 0);
        // Empty collections leave no file behind.
        assert!(!dir.path().join(cid.local_id()).exists());
    }

    #[test]
    fn test_set_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let cid = storage.create_object("set").unwrap();
        assert!(storage.add_to_set(&cid, &Value::from(1i64)).unwrap());
        assert!(!storage.add_to_set(&cid, &Value::from(1i64)).unwrap());
        assert_eq!(storage.set_size(&cid).unwrap(), 1);
        assert!(storage.remove_from_set(&cid, &Value::from(1i64)).unwrap());
        assert!(!storage.remove_from_set(&cid, &Value::from(1i64)).unwrap());
    }

    #[test]
    fn test_map_put_returns_previous() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let cid = storage.create_object("map").unwrap();
        assert_eq!(
            storage
                .put_in_map(&cid, &Value::from("k"), &Value::from(1i64))
                .unwrap(),
            None
        );
        assert_eq!(
            storage
                .put_in_map(&cid, &Value::from("k"), &Value::from(2i64))
                .unwrap(),
            Some(Value::from(1i64))
        );
        assert_eq!(
            storage.get_from_map(&cid, &Value::from("k")).unwrap(),
            Some(Value::from(2i64))
        );
        assert_eq!(
            storage.remove_from_map(&cid, &Value::from("k")).unwrap(),
            Some(Value::from(2i64))
        );
        assert_eq!(storage.map_size(&cid).unwrap(), 0);
    }

    #[test]
    fn test_generated_names_and_counter_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open(&dir);
            assert_eq!(storage.new_name("crm::Person").unwrap(), "person#0");
            assert_eq!(storage.new_name("crm::Person").unwrap(), "person#1");
            assert_eq!(storage.new_name("Invoice").unwrap(), "invoice#0");
        }
        // Counters survive restart; no name is handed out twice.
        let storage = open(&dir);
        assert_eq!(storage.new_name("crm::Person").unwrap(), "person#2");
    }

    #[test]
    fn test_stale_counter_repaired_on_open() {
        let dir = TempDir::new().unwrap();
        let oid = {
            let storage = open(&dir);
            let oid = storage.create_object("crm::Person").unwrap();
            let name = storage.new_name("crm::Person").unwrap();
            storage.bind_oid_to_name(&oid, &name).unwrap();
            oid
        };
        // Simulate a crash that lost the counter file.
        fs::remove_file(dir.path().join(COUNTERS_FILE)).unwrap();
        let storage = open(&dir);
        let fresh = storage.new_name("crm::Person").unwrap();
        assert_ne!(fresh, "person#0");
        assert_eq!(storage.get_oid_from_name("person#0").unwrap(), Some(oid));
    }

    #[test]
    fn test_counter_repair_takes_highest_suffix() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open(&dir);
            for i in 0..20u64 {
                let oid = storage.create_object("crm::Person").unwrap();
                storage
                    .bind_oid_to_name(&oid, &format!("person#{i}"))
                    .unwrap();
            }
        }
        fs::remove_file(dir.path().join(COUNTERS_FILE)).unwrap();
        // The repaired counter must clear every suffix, not just the
        // last one visited.
        let storage = open(&dir);
        assert_eq!(
            storage.name_counters().unwrap().get("person").copied(),
            Some(20)
        );
        assert_eq!(storage.new_name("crm::Person").unwrap(), "person#20");
    }

    #[test]
    fn test_rebinding_name_evicts_previous_holder() {
        let dir = TempDir::new().unwrap();
        let (a, b) = {
            let storage = open(&dir);
            let a = storage.create_object("crm::Person").unwrap();
            let b = storage.create_object("crm::Person").unwrap();
            storage.bind_oid_to_name(&a, "boss").unwrap();
            storage.bind_oid_to_name(&b, "boss").unwrap();
            assert_eq!(storage.get_oid_from_name("boss").unwrap(), Some(b.clone()));
            assert_eq!(storage.get_name_from_oid(&a).unwrap(), None);
            assert_eq!(
                storage.root_objects().unwrap(),
                vec![("boss".to_string(), b.clone())]
            );
            (a, b)
        };
        // The persisted index carries a single row for the name.
        let storage = open(&dir);
        assert_eq!(
            storage.root_objects().unwrap(),
            vec![("boss".to_string(), b.clone())]
        );
        // Renaming an object frees its old name.
        storage.bind_oid_to_name(&b, "chief").unwrap();
        assert_eq!(storage.get_oid_from_name("boss").unwrap(), None);
        assert_eq!(
            storage.get_name_from_oid(&b).unwrap(),
            Some("chief".to_string())
        );
        assert_eq!(storage.get_name_from_oid(&a).unwrap(), None);
    }

    #[test]
    fn test_legacy_name_migration() {
        let dir = TempDir::new().unwrap();
        let oid = {
            let storage = open(&dir);
            let oid = storage.create_object("crm::Person").unwrap();
            storage.bind_oid_to_name(&oid, "person12").unwrap();
            oid
        };
        let storage = open(&dir);
        assert_eq!(storage.get_oid_from_name("person12").unwrap(), None);
        assert_eq!(
            storage.get_oid_from_name("person#12").unwrap(),
            Some(oid.clone())
        );
        // Counter must now be past the migrated name.
        assert_eq!(storage.new_name("crm::Person").unwrap(), "person#13");
        // Explicit names ending in digits are not touched.
        storage.bind_oid_to_name(&oid, "area51").unwrap();
        let storage = open(&dir);
        assert!(storage.get_oid_from_name("area51").unwrap().is_some());
    }

    #[test]
    fn test_delete_object_drops_index_entries() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let oid = storage.create_object("crm::Person").unwrap();
        storage.set_field(&oid, "name", &Value::from("Bo")).unwrap();
        storage.bind_oid_to_name(&oid, "bo").unwrap();

        storage.delete_object(&oid).unwrap();
        assert!(matches!(
            storage.class_of(&oid),
            Err(StorageError::NoSuchOid(_))
        ));
        assert_eq!(storage.get_oid_from_name("bo").unwrap(), None);
        assert_eq!(storage.get_field(&oid, "name").unwrap(), None);
    }

    #[test]
    fn test_roots_and_class_queries() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let a = storage.create_object("A").unwrap();
        let b = storage.create_object("B").unwrap();
        storage.bind_oid_to_name(&a, "rootA").unwrap();

        assert_eq!(
            storage.objects_of_classes(&["A".to_string()]).unwrap(),
            vec![a.clone()]
        );
        let both = storage
            .objects_of_classes(&["A".to_string(), "B".to_string()])
            .unwrap();
        assert_eq!(both.len(), 2);
        assert!(both.contains(&b));

        assert_eq!(
            storage.root_objects().unwrap(),
            vec![("rootA".to_string(), a)]
        );
    }
}
