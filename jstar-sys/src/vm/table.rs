use fxhash::FxBuildHasher;
use indexmap::IndexMap;

use crate::vm::heap::ObjRef;
use crate::vm::value::{TableKey, Value};

/// A map from interned-string keys to values: module globals, class method
/// tables and instance fields. Keys hash by handle, which coincides with
/// content hashing by the interner invariant. Iteration follows insertion
/// order, which keeps `import *` and trace output deterministic.
#[derive(Clone, Debug, Default)]
pub struct Table {
    entries: IndexMap<ObjRef, Value, FxBuildHasher>,
}

impl Table {
    pub fn new() -> Table {
        Table { entries: IndexMap::default() }
    }

    pub fn get(&self, name: ObjRef) -> Option<Value> {
        self.entries.get(&name).copied()
    }

    pub fn contains(&self, name: ObjRef) -> bool {
        self.entries.contains_key(&name)
    }

    /// Inserts, returning `true` if the name was not already present.
    pub fn put(&mut self, name: ObjRef, value: Value) -> bool {
        self.entries.insert(name, value).is_none()
    }

    /// Copies every entry of `other` into this table, overwriting existing
    /// names. Used to merge superclass methods at class creation.
    pub fn merge_from(&mut self, other: &Table) {
        for (&name, &value) in &other.entries {
            self.entries.insert(name, value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }
}

/// A map from arbitrary hashable values to values, backing user `Table`
/// objects. Key semantics live in [`TableKey`].
#[derive(Clone, Debug, Default)]
pub struct ValueMap {
    entries: IndexMap<TableKey, Value, FxBuildHasher>,
}

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap { entries: IndexMap::default() }
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        self.entries.get(&TableKey(key)).copied()
    }

    pub fn put(&mut self, key: Value, value: Value) {
        self.entries.insert(TableKey(key), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k.0, v))
    }
}


#[cfg(test)]
mod test {
    use crate::vm::heap::ObjRef;
    use crate::vm::table::{Table, ValueMap};
    use crate::vm::value::Value;

    #[test]
    fn test_put_is_new() {
        let mut t = Table::new();
        assert!(t.put(ObjRef::from_index(1), Value::Num(1.0)));
        assert!(!t.put(ObjRef::from_index(1), Value::Num(2.0)));
        assert_eq!(Some(Value::Num(2.0)), t.get(ObjRef::from_index(1)));
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = Table::new();
        base.put(ObjRef::from_index(1), Value::Num(1.0));
        base.put(ObjRef::from_index(2), Value::Num(2.0));

        let mut t = Table::new();
        t.put(ObjRef::from_index(2), Value::Num(20.0));
        t.merge_from(&base);

        assert_eq!(Some(Value::Num(1.0)), t.get(ObjRef::from_index(1)));
        assert_eq!(Some(Value::Num(2.0)), t.get(ObjRef::from_index(2)));
    }

    #[test]
    fn test_value_map_num_keys() {
        let mut m = ValueMap::new();
        m.put(Value::Num(1.0), Value::Bool(true));
        m.put(Value::Num(-0.0), Value::Bool(false));
        assert_eq!(Some(Value::Bool(true)), m.get(Value::Num(1.0)));
        assert_eq!(Some(Value::Bool(false)), m.get(Value::Num(0.0)));
        assert_eq!(None, m.get(Value::Null));
    }
}
