//! Comparison helpers for the VM: equality, ordering, membership and the fallible
//! stable sort behind `sorted` and `list.sort`.

use std::cmp::Ordering;

use super::VM;
use crate::{
    args::ArgValues,
    bytecode::CompareKind,
    exception::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{DictKey, Set},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// `COMPARE_OP`
    pub(super) fn compare_op(&mut self, kind: CompareKind, lhs: Value, rhs: Value) -> RunResult<Value> {
        let result = match kind {
            CompareKind::Eq => self.values_equal(&lhs, &rhs)?,
            CompareKind::Ne => match self.call_dunder(&lhs, "__ne__", vec![rhs.clone()])? {
                Some(result) => self.truthy(&result)?,
                None => !self.values_equal(&lhs, &rhs)?,
            },
            CompareKind::Lt | CompareKind::Le | CompareKind::Gt | CompareKind::Ge => {
                self.compare_order(kind, &lhs, &rhs)?
            }
            CompareKind::In => self.contains(&rhs, &lhs)?,
            CompareKind::NotIn => !self.contains(&rhs, &lhs)?,
            CompareKind::Is => lhs.is_identical(&rhs),
            CompareKind::IsNot => !lhs.is_identical(&rhs),
            CompareKind::ExcMatch => self.exception_matches(&lhs, &rhs)?,
        };
        Ok(Value::Bool(result))
    }

    /// `==`: structural for builtin containers, `__eq__` on user instances, identity
    /// otherwise.
    pub(crate) fn values_equal(&mut self, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
            return Ok(a == b);
        }
        if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
            return Ok(a == b);
        }
        let (a, b) = match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => return Ok(a == b),
            (Value::Ref(a), Value::Ref(b)) => (*a, *b),
            (Value::Ref(_), _) | (_, Value::Ref(_)) => return self.dunder_eq(lhs, rhs).map(|eq| eq.unwrap_or(false)),
            _ => return Ok(lhs.is_identical(rhs)),
        };
        if a == b {
            return Ok(true);
        }
        if let Some(eq) = self.dunder_eq(lhs, rhs)? {
            return Ok(eq);
        }
        self.heap_equal(a, b)
    }

    /// `__eq__` from either side, `None` when neither operand defines it.
    fn dunder_eq(&mut self, lhs: &Value, rhs: &Value) -> RunResult<Option<bool>> {
        let result = match self.call_dunder(lhs, "__eq__", vec![rhs.clone()])? {
            Some(result) => result,
            None => match self.call_dunder(rhs, "__eq__", vec![lhs.clone()])? {
                Some(result) => result,
                None => return Ok(None),
            },
        };
        self.truthy(&result).map(Some)
    }

    fn heap_equal(&mut self, a: HeapId, b: HeapId) -> RunResult<bool> {
        match (self.heap.get(a), self.heap.get(b)) {
            (HeapData::List(x), HeapData::List(y)) | (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                let (x, y) = (x.clone(), y.clone());
                for (left, right) in x.iter().zip(&y) {
                    if !left.is_identical(right) && !self.values_equal(left, right)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (HeapData::Dict(x), HeapData::Dict(y)) => {
                if x.len() != y.len() {
                    return Ok(false);
                }
                let mut pairs = Vec::with_capacity(x.len());
                for (hash, _, value) in x.entries() {
                    match y.get(hash) {
                        Some(other) => pairs.push((value.clone(), other.clone())),
                        None => return Ok(false),
                    }
                }
                for (left, right) in pairs {
                    if !left.is_identical(&right) && !self.values_equal(&left, &right)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (HeapData::Set(x), HeapData::Set(y)) => {
                Ok(x.len() == y.len() && x.entries().all(|(hash, _)| y.contains(hash)))
            }
            (HeapData::Range(x), HeapData::Range(y)) => {
                let len = x.len();
                Ok(len == y.len() && (len == 0 || (x.start == y.start && (len == 1 || x.step == y.step))))
            }
            _ => Ok(false),
        }
    }

    /// `<`, `<=`, `>` and `>=`.
    pub(crate) fn compare_order(&mut self, kind: CompareKind, lhs: &Value, rhs: &Value) -> RunResult<bool> {
        if let Some(ordering) = self.builtin_ordering(lhs, rhs)? {
            return Ok(match ordering {
                Some(ordering) => match kind {
                    CompareKind::Lt => ordering == Ordering::Less,
                    CompareKind::Le => ordering != Ordering::Greater,
                    CompareKind::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                // NaN compares false every way.
                None => false,
            });
        }
        if let Some(result) = self.set_ordering(kind, lhs, rhs) {
            return Ok(result);
        }

        let (method, reflected) = match kind {
            CompareKind::Lt => ("__lt__", "__gt__"),
            CompareKind::Le => ("__le__", "__ge__"),
            CompareKind::Gt => ("__gt__", "__lt__"),
            _ => ("__ge__", "__le__"),
        };
        let result = match self.call_dunder(lhs, method, vec![rhs.clone()])? {
            Some(result) => result,
            None => match self.call_dunder(rhs, reflected, vec![lhs.clone()])? {
                Some(result) => result,
                None => {
                    return Err(ExcType::type_error(format!(
                        "'{kind}' not supported between instances of '{}' and '{}'",
                        lhs.type_name(self.heap),
                        rhs.type_name(self.heap)
                    )));
                }
            },
        };
        self.truthy(&result)
    }

    /// Ordering of numbers, strings and same-typed sequences. The outer `None` means
    /// the operands are not builtin-comparable; the inner `None` is an unordered float.
    fn builtin_ordering(&mut self, lhs: &Value, rhs: &Value) -> RunResult<Option<Option<Ordering>>> {
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
            return Ok(Some(Some(a.cmp(&b))));
        }
        if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
            return Ok(Some(a.partial_cmp(&b)));
        }
        let (a, b) = match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => return Ok(Some(Some(a.cmp(b)))),
            (Value::Ref(a), Value::Ref(b)) => (*a, *b),
            _ => return Ok(None),
        };
        let (x, y) = match (self.heap.get(a), self.heap.get(b)) {
            (HeapData::List(x), HeapData::List(y)) | (HeapData::Tuple(x), HeapData::Tuple(y)) => (x.clone(), y.clone()),
            _ => return Ok(None),
        };
        for (left, right) in x.iter().zip(&y) {
            if left.is_identical(right) || self.values_equal(left, right)? {
                continue;
            }
            let less = self.compare_order(CompareKind::Lt, left, right)?;
            return Ok(Some(Some(if less { Ordering::Less } else { Ordering::Greater })));
        }
        Ok(Some(Some(x.len().cmp(&y.len()))))
    }

    /// Subset comparisons between two sets.
    fn set_ordering(&self, kind: CompareKind, lhs: &Value, rhs: &Value) -> Option<bool> {
        let (HeapData::Set(x), HeapData::Set(y)) = (self.heap.get(lhs.ref_id()?), self.heap.get(rhs.ref_id()?)) else {
            return None;
        };
        let subset = |a: &Set, b: &Set| a.entries().all(|(hash, _)| b.contains(hash));
        Some(match kind {
            CompareKind::Lt => x.len() < y.len() && subset(x, y),
            CompareKind::Le => subset(x, y),
            CompareKind::Gt => x.len() > y.len() && subset(y, x),
            _ => subset(y, x),
        })
    }

    /// `item in container`
    pub(crate) fn contains(&mut self, container: &Value, item: &Value) -> RunResult<bool> {
        let id = match container {
            Value::Str(text) => {
                return match item {
                    Value::Str(needle) => Ok(text.contains(&**needle)),
                    other => Err(ExcType::type_error(format!(
                        "'in <string>' requires string as left operand, not {}",
                        other.type_name(self.heap)
                    ))),
                };
            }
            Value::Ref(id) => *id,
            other => {
                return Err(ExcType::type_error(format!(
                    "argument of type '{}' is not iterable",
                    other.type_name(self.heap)
                )));
            }
        };
        match self.heap.get(id) {
            HeapData::List(items) | HeapData::Tuple(items) => {
                let items = items.clone();
                self.any_equal(&items, item)
            }
            HeapData::Dict(dict) => {
                let key = DictKey::new(item, self.heap)?;
                Ok(dict.contains(&key))
            }
            HeapData::Set(set) => {
                let key = DictKey::new(item, self.heap)?;
                Ok(set.contains(&key))
            }
            HeapData::Range(range) => Ok(match item {
                Value::Float(f) if f.fract() == 0.0 => range.contains(*f as i64),
                other => other.as_int().is_some_and(|n| range.contains(n)),
            }),
            HeapData::Instance(_) => {
                if let Some(result) = self.call_dunder(container, "__contains__", vec![item.clone()])? {
                    return self.truthy(&result);
                }
                let items = self.collect_iterable(container.clone())?;
                self.any_equal(&items, item)
            }
            HeapData::Iter(_) | HeapData::Generator(_) => {
                let items = self.collect_iterable(container.clone())?;
                self.any_equal(&items, item)
            }
            other => Err(ExcType::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    fn any_equal(&mut self, items: &[Value], item: &Value) -> RunResult<bool> {
        for candidate in items {
            if candidate.is_identical(item) || self.values_equal(candidate, item)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stable sort by `key(item)` (or the items themselves) using `<`.
    ///
    /// A merge sort, so a failing or inconsistent comparison surfaces as an error
    /// instead of a scrambled order.
    pub(crate) fn sort_values(&mut self, items: Vec<Value>, key: Option<Value>, reverse: bool) -> RunResult<Vec<Value>> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let sort_key = match &key {
                Some(func) => self.call_sync(func.clone(), ArgValues::positional(vec![item.clone()]))?,
                None => item.clone(),
            };
            keyed.push((sort_key, item));
        }
        let sorted = self.merge_sort(keyed, reverse)?;
        Ok(sorted.into_iter().map(|(_, item)| item).collect())
    }

    fn merge_sort(&mut self, mut items: Vec<(Value, Value)>, reverse: bool) -> RunResult<Vec<(Value, Value)>> {
        if items.len() <= 1 {
            return Ok(items);
        }
        let right = items.split_off(items.len() / 2);
        let left = self.merge_sort(items, reverse)?;
        let right = self.merge_sort(right, reverse)?;

        let mut merged = Vec::with_capacity(left.len() + right.len());
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
            // Take from the right only when strictly before the left; ties keep input order.
            let right_first = if reverse {
                self.compare_order(CompareKind::Lt, &l.0, &r.0)?
            } else {
                self.compare_order(CompareKind::Lt, &r.0, &l.0)?
            };
            let next = if right_first { right.next() } else { left.next() };
            merged.extend(next);
        }
        merged.extend(left);
        merged.extend(right);
        Ok(merged)
    }
}
