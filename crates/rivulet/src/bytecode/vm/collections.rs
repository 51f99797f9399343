//! Container helpers for the VM: subscripts, construction, iteration and unpacking.

use super::VM;
use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{DictKey, IterState, Set},
    value::{Value, normalize_index},
};

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// `container[index]`
    pub(crate) fn getitem(&mut self, container: &Value, index: &Value) -> RunResult<Value> {
        let id = match container {
            Value::Str(text) => {
                let i = index.as_index(self.heap)?;
                let len = text.chars().count();
                return normalize_index(i, len)
                    .and_then(|i| text.chars().nth(i))
                    .map(|c| Value::from(c.to_string()))
                    .ok_or_else(|| ExcType::index_error("string"));
            }
            Value::Ref(id) => *id,
            other => return Err(not_subscriptable(&other.type_name(self.heap))),
        };
        match self.heap.get(id) {
            data @ (HeapData::List(items) | HeapData::Tuple(items)) => {
                let i = index.as_index(self.heap)?;
                normalize_index(i, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| ExcType::index_error(data.type_name()))
            }
            HeapData::Dict(dict) => {
                let key = DictKey::new(index, self.heap)?;
                dict.get(&key).cloned().ok_or_else(|| ExcType::key_error(index.clone()))
            }
            HeapData::Range(range) => {
                let i = index.as_index(self.heap)?;
                normalize_index(i, range.len())
                    .and_then(|i| range.get(i))
                    .map(Value::Int)
                    .ok_or_else(|| ExcType::index_error("range object"))
            }
            HeapData::Instance(_) => match self.call_dunder(container, "__getitem__", vec![index.clone()])? {
                Some(value) => Ok(value),
                None => Err(not_subscriptable(&container.type_name(self.heap))),
            },
            other => Err(not_subscriptable(other.type_name())),
        }
    }

    /// `container[index] = value`
    pub(crate) fn setitem(&mut self, container: &Value, index: Value, value: Value) -> RunResult<()> {
        let Some(id) = container.ref_id() else {
            return Err(no_item_assignment(&container.type_name(self.heap)));
        };
        match self.heap.get(id) {
            HeapData::List(items) => {
                let i = index.as_index(self.heap)?;
                let slot = normalize_index(i, items.len())
                    .ok_or_else(|| ExcType::index_error("list assignment"))?;
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items[slot] = value;
                }
                Ok(())
            }
            HeapData::Dict(_) => self.dict_insert(container, index, value),
            HeapData::Instance(_) => match self.call_dunder(container, "__setitem__", vec![index, value])? {
                Some(_) => Ok(()),
                None => Err(no_item_assignment(&container.type_name(self.heap))),
            },
            other => Err(no_item_assignment(other.type_name())),
        }
    }

    /// `del container[index]`
    pub(crate) fn delitem(&mut self, container: &Value, index: &Value) -> RunResult<()> {
        let Some(id) = container.ref_id() else {
            return Err(no_item_deletion(&container.type_name(self.heap)));
        };
        match self.heap.get(id) {
            HeapData::List(items) => {
                let i = index.as_index(self.heap)?;
                let slot = normalize_index(i, items.len())
                    .ok_or_else(|| ExcType::index_error("list assignment"))?;
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.remove(slot);
                }
                Ok(())
            }
            HeapData::Dict(_) => {
                let key = DictKey::new(index, self.heap)?;
                let removed = match self.heap.get_mut(id) {
                    HeapData::Dict(dict) => dict.remove(&key).is_some(),
                    _ => false,
                };
                if removed {
                    Ok(())
                } else {
                    Err(ExcType::key_error(index.clone()))
                }
            }
            HeapData::Instance(_) => match self.call_dunder(container, "__delitem__", vec![index.clone()])? {
                Some(_) => Ok(()),
                None => Err(no_item_deletion(&container.type_name(self.heap))),
            },
            other => Err(no_item_deletion(other.type_name())),
        }
    }

    pub(crate) fn dict_insert(&mut self, dict: &Value, key: Value, value: Value) -> RunResult<()> {
        let hash = DictKey::new(&key, self.heap)?;
        match dict.ref_id().map(|id| self.heap.get_mut(id)) {
            Some(HeapData::Dict(dict)) => {
                dict.insert(hash, key, value);
                Ok(())
            }
            _ => Err(RunError::internal("dict_insert target is not a dict")),
        }
    }

    pub(crate) fn set_add(&mut self, set: &Value, value: Value) -> RunResult<()> {
        let hash = DictKey::new(&value, self.heap)?;
        match set.ref_id().map(|id| self.heap.get_mut(id)) {
            Some(HeapData::Set(set)) => {
                set.add(hash, value);
                Ok(())
            }
            _ => Err(RunError::internal("set_add target is not a set")),
        }
    }

    pub(crate) fn new_set(&mut self, items: Vec<Value>) -> RunResult<Value> {
        let mut set = Set::new();
        for item in items {
            let hash = DictKey::new(&item, self.heap)?;
            set.add(hash, item);
        }
        Ok(Value::Ref(self.heap.allocate(HeapData::Set(set))?))
    }

    /// `len(value)`
    pub(crate) fn len(&mut self, value: &Value) -> RunResult<usize> {
        let len = match value {
            Value::Str(text) => Some(text.chars().count()),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(items) | HeapData::Tuple(items) => Some(items.len()),
                HeapData::Dict(dict) => Some(dict.len()),
                HeapData::Set(set) => Some(set.len()),
                HeapData::Range(range) => Some(range.len()),
                HeapData::Instance(_) => match self.call_dunder(value, "__len__", Vec::new())? {
                    Some(len) => match len.as_int() {
                        Some(n) => Some(usize::try_from(n).map_err(|_| ExcType::value_error("__len__() should return >= 0"))?),
                        None => {
                            return Err(ExcType::type_error(format!(
                                "'{}' object cannot be interpreted as an integer",
                                len.type_name(self.heap)
                            )));
                        }
                    },
                    None => None,
                },
                _ => None,
            },
            _ => None,
        };
        len.ok_or_else(|| {
            ExcType::type_error(format!("object of type '{}' has no len()", value.type_name(self.heap)))
        })
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// `iter(value)`
    pub(crate) fn get_iter(&mut self, value: Value) -> RunResult<Value> {
        let state = match &value {
            Value::Str(text) => IterState::Str {
                text: text.clone(),
                pos: 0,
            },
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(_) | HeapData::Tuple(_) => IterState::Seq { seq: *id, index: 0 },
                HeapData::Range(range) => IterState::Range {
                    next: range.start,
                    remaining: range.len(),
                    step: range.step,
                },
                HeapData::Dict(dict) => IterState::Values {
                    items: dict.keys().cloned().collect(),
                    index: 0,
                },
                HeapData::Set(set) => IterState::Values {
                    items: set.values().cloned().collect(),
                    index: 0,
                },
                HeapData::Iter(_) | HeapData::Generator(_) => return Ok(value),
                HeapData::Instance(_) => {
                    return match self.call_dunder(&value, "__iter__", Vec::new())? {
                        Some(iter) => Ok(iter),
                        None => Err(ExcType::type_error_not_iterable(&value.type_name(self.heap))),
                    };
                }
                other => return Err(ExcType::type_error_not_iterable(other.type_name())),
            },
            other => return Err(ExcType::type_error_not_iterable(&other.type_name(self.heap))),
        };
        Ok(Value::Ref(self.heap.allocate(HeapData::Iter(state))?))
    }

    /// Advances an iterator: `Some(item)` when one was produced, `None` when exhausted.
    pub(crate) fn iter_next(&mut self, iter: &Value) -> RunResult<Option<Value>> {
        let Some(id) = iter.ref_id() else {
            return Err(not_an_iterator(&iter.type_name(self.heap)));
        };
        match self.heap.get(id) {
            HeapData::Iter(_) => self.advance_builtin(id),
            HeapData::Generator(_) => self.generator_send(id, Value::None),
            HeapData::Instance(_) => match self.call_dunder(iter, "__next__", Vec::new()) {
                Ok(Some(item)) => Ok(Some(item)),
                Ok(None) => Err(not_an_iterator(&iter.type_name(self.heap))),
                Err(err) if self.error_is(&err, ExcType::StopIteration) => Ok(None),
                Err(err) => Err(err),
            },
            other => Err(not_an_iterator(other.type_name())),
        }
    }

    fn advance_builtin(&mut self, id: HeapId) -> RunResult<Option<Value>> {
        // Wrapping iterators advance their inner iterators first, outside the heap borrow.
        let wrapped = match self.heap.get(id) {
            HeapData::Iter(IterState::Enumerate { inner, count }) => Some((vec![inner.clone()], Some(*count))),
            HeapData::Iter(IterState::Zip { inners }) => Some((inners.clone(), None)),
            _ => None,
        };
        if let Some((inners, count)) = wrapped {
            let mut items = Vec::with_capacity(inners.len() + 1);
            if let Some(count) = count {
                items.push(Value::Int(count));
                if let HeapData::Iter(IterState::Enumerate { count, .. }) = self.heap.get_mut(id) {
                    *count += 1;
                }
            }
            for inner in &inners {
                match self.iter_next(inner)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            if inners.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Value::Ref(self.heap.allocate(HeapData::Tuple(items))?)));
        }

        // Live sequence views read the list each step, so appends during iteration show up.
        let seq = match self.heap.get(id) {
            HeapData::Iter(IterState::Seq { seq, index }) => Some((*seq, *index)),
            _ => None,
        };
        if let Some((seq, index)) = seq {
            let item = match self.heap.get(seq) {
                HeapData::List(items) | HeapData::Tuple(items) => items.get(index).cloned(),
                _ => None,
            };
            if item.is_some()
                && let HeapData::Iter(IterState::Seq { index, .. }) = self.heap.get_mut(id)
            {
                *index += 1;
            }
            return Ok(item);
        }

        let HeapData::Iter(state) = self.heap.get_mut(id) else {
            return Err(RunError::internal("advance_builtin: not an iterator"));
        };
        let item = match state {
            IterState::Str { text, pos } => text[*pos..].chars().next().map(|c| {
                *pos += c.len_utf8();
                Value::from(c.to_string())
            }),
            IterState::Range { next, remaining, step } => {
                if *remaining == 0 {
                    None
                } else {
                    let value = *next;
                    *remaining -= 1;
                    if *remaining > 0 {
                        *next += *step;
                    }
                    Some(Value::Int(value))
                }
            }
            IterState::Values { items, index } => {
                let item = items.get(*index).cloned();
                if item.is_some() {
                    *index += 1;
                }
                item
            }
            IterState::Seq { .. } | IterState::Enumerate { .. } | IterState::Zip { .. } => None,
        };
        Ok(item)
    }

    /// Drains any iterable into a vector.
    pub(crate) fn collect_iterable(&mut self, iterable: Value) -> RunResult<Vec<Value>> {
        if let Value::Ref(id) = &iterable
            && let HeapData::List(items) | HeapData::Tuple(items) = self.heap.get(*id)
        {
            return Ok(items.clone());
        }
        let iter = self.get_iter(iterable)?;
        let mut items = Vec::new();
        while let Some(item) = self.iter_next(&iter)? {
            items.push(item);
        }
        Ok(items)
    }

    /// `UNPACK_SEQUENCE n`: exactly `n` items, in order.
    pub(crate) fn unpack(&mut self, sequence: Value, n: usize) -> RunResult<Vec<Value>> {
        let items = self.collect_iterable(sequence)?;
        match items.len() {
            len if len == n => Ok(items),
            len if len < n => Err(ExcType::value_error(format!(
                "not enough values to unpack (expected {n}, got {len})"
            ))),
            _ => Err(ExcType::value_error(format!("too many values to unpack (expected {n})"))),
        }
    }
}

fn not_subscriptable(type_name: &str) -> RunError {
    ExcType::type_error(format!("'{type_name}' object is not subscriptable"))
}

fn no_item_assignment(type_name: &str) -> RunError {
    ExcType::type_error(format!("'{type_name}' object does not support item assignment"))
}

fn no_item_deletion(type_name: &str) -> RunError {
    ExcType::type_error(format!("'{type_name}' object doesn't support item deletion"))
}

fn not_an_iterator(type_name: &str) -> RunError {
    ExcType::type_error(format!("'{type_name}' object is not an iterator"))
}
