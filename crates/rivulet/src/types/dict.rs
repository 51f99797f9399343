//! Insertion-ordered dict and set keyed by [`DictKey`].

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    builtins::Builtins,
    exception::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId, Trace},
    resource::ResourceTracker,
    value::Value,
};

type Map<K, V> = IndexMap<K, V, ahash::RandomState>;

/// The hashable identity of a value.
///
/// Numbers that compare equal map to the same key (`1`, `1.0` and `True`), strings and
/// tuples hash structurally, and every other heap value hashes by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DictKey {
    None,
    Int(i64),
    /// Bit pattern of a non-integral float.
    Float(u64),
    Str(Arc<str>),
    Tuple(Vec<DictKey>),
    Ellipsis,
    Builtin(Builtins),
    ExcType(ExcType),
    /// Address of a shared code object.
    Code(usize),
    Id(HeapId),
}

impl DictKey {
    pub fn new(value: &Value, heap: &Heap<impl ResourceTracker>) -> RunResult<Self> {
        let key = match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Int(i64::from(*b)),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => Self::Str(s.clone()),
            Value::Ellipsis => Self::Ellipsis,
            Value::Builtin(b) => Self::Builtin(*b),
            Value::ExcType(t) => Self::ExcType(*t),
            Value::Code(code) => Self::Code(Arc::as_ptr(code) as usize),
            Value::Unwind(_) => return Err(ExcType::type_error_unhashable("unwinder")),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Tuple(items) => {
                    let keys = items.iter().map(|item| Self::new(item, heap)).collect::<RunResult<_>>()?;
                    Self::Tuple(keys)
                }
                data @ (HeapData::List(_) | HeapData::Dict(_) | HeapData::Set(_)) => {
                    return Err(ExcType::type_error_unhashable(data.type_name()));
                }
                _ => Self::Id(*id),
            },
        };
        Ok(key)
    }

    pub fn str(name: &str) -> Self {
        Self::Str(Arc::from(name))
    }
}

fn float_key(f: f64) -> DictKey {
    if f.fract() == 0.0 && f.abs() < 9.2e18 {
        DictKey::Int(f as i64)
    } else {
        DictKey::Float(f.to_bits())
    }
}

/// An insertion-ordered mapping. Each entry keeps the original key value next to
/// the stored value so iteration yields real objects.
#[derive(Debug, Default)]
pub(crate) struct Dict {
    map: Map<DictKey, (Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &DictKey) -> Option<&Value> {
        self.map.get(key).map(|(_, value)| value)
    }

    /// Looks up a string key without building a `DictKey` first.
    pub fn get_str(&self, name: &str) -> Option<&Value> {
        self.get(&DictKey::str(name))
    }

    pub fn contains(&self, key: &DictKey) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or overwrites; an existing entry keeps its position and original key.
    pub fn insert(&mut self, key: DictKey, key_value: Value, value: Value) -> Option<Value> {
        if let Some(entry) = self.map.get_mut(&key) {
            return Some(std::mem::replace(&mut entry.1, value));
        }
        self.map.insert(key, (key_value, value));
        None
    }

    pub fn insert_str(&mut self, name: &str, value: Value) -> Option<Value> {
        let key: Arc<str> = Arc::from(name);
        self.insert(DictKey::Str(key.clone()), Value::Str(key), value)
    }

    pub fn remove(&mut self, key: &DictKey) -> Option<(Value, Value)> {
        self.map.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.map.values().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.map.values().map(|(_, value)| value)
    }

    pub fn items(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.map.values().map(|(key, value)| (key, value))
    }

    /// Entries together with their hash keys, for copying into another dict.
    pub fn entries(&self) -> impl Iterator<Item = (&DictKey, &Value, &Value)> {
        self.map.iter().map(|(hash, (key, value))| (hash, key, value))
    }
}

impl Trace for Dict {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        for (key, value) in self.map.values() {
            key.mark_children(work_list);
            value.mark_children(work_list);
        }
    }
}

/// An insertion-ordered set.
#[derive(Debug, Default)]
pub(crate) struct Set {
    map: Map<DictKey, Value>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &DictKey) -> bool {
        self.map.contains_key(key)
    }

    /// Returns false when the element was already present.
    pub fn add(&mut self, key: DictKey, value: Value) -> bool {
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key, value);
        true
    }

    pub fn remove(&mut self, key: &DictKey) -> bool {
        self.map.shift_remove(key).is_some()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.map.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&DictKey, &Value)> {
        self.map.iter()
    }
}

impl Trace for Set {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        for value in self.map.values() {
            value.mark_children(work_list);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn equal_numbers_share_a_key() {
        let heap = Heap::new(NoLimitTracker::default());
        let one = DictKey::new(&Value::Int(1), &heap).unwrap();
        assert_eq!(DictKey::new(&Value::Bool(true), &heap).unwrap(), one);
        assert_eq!(DictKey::new(&Value::Float(1.0), &heap).unwrap(), one);
        assert_ne!(DictKey::new(&Value::Float(1.5), &heap).unwrap(), one);
    }

    #[test]
    fn lists_are_unhashable() {
        let mut heap = Heap::new(NoLimitTracker::default());
        let list = heap.allocate(HeapData::List(vec![])).unwrap();
        assert!(DictKey::new(&Value::Ref(list), &heap).is_err());
        let tuple = heap.allocate(HeapData::Tuple(vec![Value::Ref(list)])).unwrap();
        assert!(DictKey::new(&Value::Ref(tuple), &heap).is_err());
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut dict = Dict::new();
        dict.insert_str("a", Value::Int(1));
        dict.insert_str("b", Value::Int(2));
        assert!(matches!(dict.insert_str("a", Value::Int(3)), Some(Value::Int(1))));
        let keys: Vec<_> = dict
            .keys()
            .map(|k| match k {
                Value::Str(s) => s.to_string(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(keys, ["a", "b"]);
        assert!(matches!(dict.get_str("a"), Some(Value::Int(3))));
    }

    #[test]
    fn set_add_reports_duplicates() {
        let mut set = Set::new();
        assert!(set.add(DictKey::Int(1), Value::Int(1)));
        assert!(!set.add(DictKey::Int(1), Value::Bool(true)));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&DictKey::Int(1)));
        assert!(set.is_empty());
    }
}
