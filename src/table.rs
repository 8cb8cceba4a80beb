//! Table wrapper
//!
//! [`TableObject`] is a reference-counted handle over a native [`Table`] with a
//! dictionary-like contract. Keys may repeat: a lookup that matches several
//! entries returns all of their values.
//!
//! Ordering is insertion order everywhere: `keys`, `values`, `items`, the
//! lazy iterators and the list returned for a repeated key.
//!
//! A table created by a script owns a private pool and destroys it when the
//! last handle goes away. A table reached through a request, connection or
//! server borrows the native table; its pool belongs to the native side.

use crate::error::{BridgeError, BridgeResult};
use native_host::{Pool, PoolRef, Table, TableEntry};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Who is responsible for the memory behind a wrapper
pub enum Ownership {
    /// The wrapper destroys this pool when its last reference drops
    Owned(Pool),
    /// The native side owns the memory; dropping the wrapper leaves it alone
    Borrowed,
}

impl fmt::Debug for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::Owned(pool) => f.debug_tuple("Owned").field(pool).finish(),
            Ownership::Borrowed => f.write_str("Borrowed"),
        }
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if let Ownership::Owned(pool) = self {
            debug!(pool = %pool.tag(), "releasing owned pool");
            pool.destroy();
        }
    }
}

/// Result of a table lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableValue {
    One(String),
    /// Every value of a repeated key, first inserted first
    Many(Vec<String>),
}

impl TableValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TableValue::One(v) => Some(v),
            TableValue::Many(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            TableValue::One(v) => vec![v],
            TableValue::Many(vs) => vs,
        }
    }
}

impl PartialEq<&str> for TableValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl PartialEq<Vec<&str>> for TableValue {
    fn eq(&self, other: &Vec<&str>) -> bool {
        match self {
            TableValue::Many(vs) => vs.iter().map(String::as_str).eq(other.iter().copied()),
            TableValue::One(_) => false,
        }
    }
}

/// Input accepted by [`TableObject::update`]
#[derive(Debug, Clone)]
pub enum UpdateSource {
    Mapping(serde_json::Map<String, Value>),
    Pairs(Vec<(Value, Value)>),
}

impl TryFrom<Value> for UpdateSource {
    type Error = BridgeError;

    fn try_from(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Object(map) => Ok(UpdateSource::Mapping(map)),
            Value::Array(items) => {
                let mut pairs = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(mut pair) if pair.len() == 2 => {
                            let val = pair.pop().unwrap_or(Value::Null);
                            let key = pair.pop().unwrap_or(Value::Null);
                            pairs.push((key, val));
                        }
                        other => {
                            return Err(BridgeError::type_error(format!(
                                "update sequence elements must be pairs, not {}",
                                type_name(&other)
                            )));
                        }
                    }
                }
                Ok(UpdateSource::Pairs(pairs))
            }
            other => Err(BridgeError::type_error(format!(
                "update expects a mapping or a sequence of pairs, not {}",
                type_name(&other)
            ))),
        }
    }
}

impl<K: Into<Value>, V: Into<Value>> From<Vec<(K, V)>> for UpdateSource {
    fn from(pairs: Vec<(K, V)>) -> Self {
        UpdateSource::Pairs(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn expect_key(key: Value) -> BridgeResult<String> {
    match key {
        Value::String(s) => Ok(s),
        other => Err(BridgeError::type_error(format!(
            "table keys must be strings, not {}",
            type_name(&other)
        ))),
    }
}

/// String form used when merging foreign values into a table
fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

struct TableInner {
    table: PoolRef<Table>,
    // Dropped after `table`; the handle above is weak and never dangles.
    ownership: Ownership,
}

/// Reference-counted table handle
#[derive(Clone)]
pub struct TableObject {
    inner: Arc<TableInner>,
}

impl TableObject {
    /// Empty table in a pool of its own
    pub fn new() -> BridgeResult<Self> {
        Self::owned(Table::new())
    }

    /// Wrap `table`, moving it into a pool owned by the wrapper
    pub fn owned(table: Table) -> BridgeResult<Self> {
        let pool = Pool::new("table");
        let table = pool.alloc(Mutex::new(table))?;
        Ok(Self {
            inner: Arc::new(TableInner {
                table,
                ownership: Ownership::Owned(pool),
            }),
        })
    }

    /// Wrap a native table whose pool belongs to someone else
    pub fn borrowed(table: PoolRef<Table>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                table,
                ownership: Ownership::Borrowed,
            }),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.inner.ownership, Ownership::Owned(_))
    }

    /// Whether both handles are the same wrapper instance
    pub fn ptr_eq(&self, other: &TableObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether both handles wrap the same native table
    pub fn same_table(&self, other: &TableObject) -> bool {
        self.inner.table.ptr_eq(&other.inner.table)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Table) -> R) -> BridgeResult<R> {
        let table = self.inner.table.get()?;
        let mut table = table.lock();
        Ok(f(&mut table))
    }

    /// Value(s) stored under `key`; `NotFound` when there are none
    pub fn get(&self, key: impl Into<Value>) -> BridgeResult<TableValue> {
        let key = expect_key(key.into())?;
        self.lookup(&key)?.ok_or_else(|| BridgeError::not_found(key))
    }

    /// Like [`get`](Self::get) but yields `None` for a missing key
    pub fn find(&self, key: impl Into<Value>) -> BridgeResult<Option<TableValue>> {
        let key = expect_key(key.into())?;
        self.lookup(&key)
    }

    fn lookup(&self, key: &str) -> BridgeResult<Option<TableValue>> {
        self.with(|t| {
            let mut values: Vec<String> = t.get_all(key).into_iter().map(str::to_owned).collect();
            match values.len() {
                0 => None,
                1 => values.pop().map(TableValue::One),
                _ => Some(TableValue::Many(values)),
            }
        })
    }

    pub fn has_key(&self, key: impl Into<Value>) -> BridgeResult<bool> {
        let key = expect_key(key.into())?;
        self.with(|t| t.contains_key(&key))
    }

    /// Replace every entry under `key`; a `null` value removes them instead
    pub fn set(&self, key: impl Into<Value>, val: impl Into<Value>) -> BridgeResult<()> {
        let key = expect_key(key.into())?;
        match val.into() {
            Value::Null => self.with(|t| t.unset(&key)),
            Value::String(v) => self.with(|t| t.set(&key, &v)),
            other => Err(BridgeError::type_error(format!(
                "table values must be strings, not {}",
                type_name(&other)
            ))),
        }
    }

    /// Append an entry, keeping existing entries under the same key
    pub fn add(&self, key: impl Into<Value>, val: impl Into<Value>) -> BridgeResult<()> {
        let key = expect_key(key.into())?;
        match val.into() {
            Value::String(v) => self.with(|t| t.add(&key, &v)),
            other => Err(BridgeError::type_error(format!(
                "table values must be strings, not {}",
                type_name(&other)
            ))),
        }
    }

    pub fn unset(&self, key: impl Into<Value>) -> BridgeResult<()> {
        let key = expect_key(key.into())?;
        self.with(|t| t.unset(&key))
    }

    /// First value under `key`, storing `default` first when there is none
    pub fn setdefault(&self, key: impl Into<Value>, default: &str) -> BridgeResult<String> {
        let key = expect_key(key.into())?;
        self.with(|t| match t.get(&key) {
            Some(v) => v.to_owned(),
            None => {
                t.add(&key, default);
                default.to_owned()
            }
        })
    }

    /// Merge foreign pairs in, stringifying non-string keys and values.
    /// Each pair replaces existing entries under its key.
    pub fn update(&self, source: impl Into<UpdateSource>) -> BridgeResult<()> {
        let pairs: Vec<(String, String)> = match source.into() {
            UpdateSource::Mapping(map) => map.into_iter().map(|(k, v)| (k, stringify(v))).collect(),
            UpdateSource::Pairs(pairs) => pairs
                .into_iter()
                .map(|(k, v)| (stringify(k), stringify(v)))
                .collect(),
        };
        self.with(|t| {
            for (k, v) in &pairs {
                t.set(k, v);
            }
        })
    }

    /// Replace entries with those of `other`, keeping its duplicates
    pub fn merge_from(&self, other: &TableObject) -> BridgeResult<()> {
        if self.same_table(other) {
            return Ok(());
        }
        let snapshot = other.snapshot()?;
        self.with(|t| t.overlay(&snapshot))
    }

    /// Independent copy in a pool of its own
    pub fn copy(&self) -> BridgeResult<TableObject> {
        TableObject::owned(self.snapshot()?)
    }

    /// Clone of the native table
    pub fn snapshot(&self) -> BridgeResult<Table> {
        self.with(|t| t.clone())
    }

    pub fn clear(&self) -> BridgeResult<()> {
        self.with(Table::clear)
    }

    pub fn len(&self) -> BridgeResult<usize> {
        self.with(|t| t.len())
    }

    pub fn is_empty(&self) -> BridgeResult<bool> {
        self.with(|t| t.is_empty())
    }

    pub fn keys(&self) -> BridgeResult<Vec<String>> {
        self.with(|t| t.iter().map(|(k, _)| k.to_owned()).collect())
    }

    pub fn values(&self) -> BridgeResult<Vec<String>> {
        self.with(|t| t.iter().map(|(_, v)| v.to_owned()).collect())
    }

    pub fn items(&self) -> BridgeResult<Vec<(String, String)>> {
        self.with(|t| t.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect())
    }

    pub fn iter_keys(&self) -> TableIter<String> {
        TableIter::new(self, |e| e.key.clone())
    }

    pub fn iter_values(&self) -> TableIter<String> {
        TableIter::new(self, |e| e.val.clone())
    }

    pub fn iter_items(&self) -> TableIter<(String, String)> {
        TableIter::new(self, |e| (e.key.clone(), e.val.clone()))
    }
}

impl fmt::Debug for TableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableObject")
            .field("ownership", &self.inner.ownership)
            .field("alive", &self.inner.table.is_alive())
            .finish()
    }
}

impl fmt::Display for TableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(items) = self.items() else {
            return f.write_str("<table (pool destroyed)>");
        };
        f.write_str("{")?;
        for (i, (k, v)) in items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {:?}", k, v)?;
        }
        f.write_str("}")
    }
}

impl<'a> IntoIterator for &'a TableObject {
    type Item = BridgeResult<String>;
    type IntoIter = TableIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_keys()
    }
}

/// Lazy walk over a table.
///
/// The element count is captured when the iterator is created. If it differs
/// at any later step the iterator yields `ConcurrentModification` once and
/// then ends.
pub struct TableIter<T> {
    table: TableObject,
    expected_len: Option<usize>,
    pos: usize,
    finished: bool,
    project: fn(&TableEntry) -> T,
}

impl<T> TableIter<T> {
    fn new(table: &TableObject, project: fn(&TableEntry) -> T) -> Self {
        Self {
            table: table.clone(),
            expected_len: table.len().ok(),
            pos: 0,
            finished: false,
            project,
        }
    }

    fn fail(&mut self, err: BridgeError) -> Option<BridgeResult<T>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<T> Iterator for TableIter<T> {
    type Item = BridgeResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let native = match self.table.inner.table.get() {
            Ok(native) => native,
            Err(e) => return self.fail(e.into()),
        };
        let table = native.lock();
        if Some(table.len()) != self.expected_len {
            drop(table);
            return self.fail(BridgeError::ConcurrentModification);
        }
        match table.entry(self.pos) {
            Some(entry) => {
                self.pos += 1;
                Some(Ok((self.project)(entry)))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Standalone table for scripts
pub fn make_table() -> BridgeResult<TableObject> {
    TableObject::new()
}
