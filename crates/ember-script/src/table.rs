//! Script tables
//!
//! Hash tables keyed by integers or strings. A table created with weak
//! values does not keep its values alive across a collection: after the
//! mark phase, entries whose value is an unmarked heap reference are
//! pruned. Keys are plain data (never heap references), so key liveness is
//! not a concern.

use rustc_hash::FxHashMap;

use crate::value::Value;

/// Table key: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    /// Integer key
    Int(i64),
    /// String key (owned copy, independent of the heap)
    Str(Box<str>),
}

impl TableKey {
    /// String key from a borrowed str.
    pub fn str(s: &str) -> Self {
        TableKey::Str(s.into())
    }
}

/// Hash table value container.
#[derive(Debug, Default)]
pub struct Table {
    map: FxHashMap<TableKey, Value>,
    weak_values: bool,
}

impl Table {
    /// Create a table; `weak_values` marks entries collectable when the
    /// value is otherwise unreachable.
    pub fn new(weak_values: bool) -> Self {
        Self {
            map: FxHashMap::default(),
            weak_values,
        }
    }

    /// True if values are weakly held.
    pub fn has_weak_values(&self) -> bool {
        self.weak_values
    }

    /// Raw read; absent keys read as null.
    pub fn raw_get(&self, key: &TableKey) -> Value {
        self.map.get(key).copied().unwrap_or_default()
    }

    /// Raw write; writing null removes the entry.
    pub fn raw_set(&mut self, key: TableKey, value: Value) {
        if value.is_null() {
            self.map.remove(&key);
        } else {
            self.map.insert(key, value);
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate entries.
    pub fn iter(&self) -> impl Iterator<Item = (&TableKey, Value)> + '_ {
        self.map.iter().map(|(k, v)| (k, *v))
    }

    /// Drop entries for which `dead` reports the value unreachable.
    /// Called by the collector on weak-valued tables after marking.
    pub(crate) fn prune_dead_values(&mut self, mut dead: impl FnMut(Value) -> bool) {
        self.map.retain(|_, v| !dead(*v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_get_set() {
        let mut t = Table::new(false);
        assert!(t.raw_get(&TableKey::Int(1)).is_null());
        t.raw_set(TableKey::Int(1), Value::int(10));
        t.raw_set(TableKey::str("x"), Value::bool(true));
        assert_eq!(t.raw_get(&TableKey::Int(1)).as_int(), Some(10));
        assert_eq!(t.raw_get(&TableKey::str("x")).as_bool(), Some(true));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_null_write_removes() {
        let mut t = Table::new(false);
        t.raw_set(TableKey::Int(5), Value::int(1));
        t.raw_set(TableKey::Int(5), Value::null());
        assert!(t.is_empty());
    }

    #[test]
    fn test_prune_dead_values() {
        let mut t = Table::new(true);
        t.raw_set(TableKey::Int(1), Value::int(10));
        t.raw_set(TableKey::Int(2), Value::int(20));
        t.prune_dead_values(|v| v.as_int() == Some(20));
        assert_eq!(t.len(), 1);
        assert_eq!(t.raw_get(&TableKey::Int(1)).as_int(), Some(10));
    }
}
