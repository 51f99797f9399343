use std::sync::Arc;

use crate::{
    heap::{HeapId, Trace},
    value::Value,
};

/// State of a builtin iterator object.
///
/// Advancing lives on the VM, since `enumerate` and `zip` may wrap user iterators.
#[derive(Debug)]
pub(crate) enum IterState {
    /// Live view of a list or tuple: items appended during iteration are produced too.
    Seq { seq: HeapId, index: usize },
    /// Byte position into a string, advanced one character at a time.
    Str { text: Arc<str>, pos: usize },
    Range { next: i64, remaining: usize, step: i64 },
    /// A snapshot, used for dicts, sets and `reversed`.
    Values { items: Vec<Value>, index: usize },
    Enumerate { inner: Value, count: i64 },
    Zip { inners: Vec<Value> },
}

impl IterState {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Seq { .. } => "list_iterator",
            Self::Str { .. } => "str_iterator",
            Self::Range { .. } => "range_iterator",
            Self::Values { .. } => "iterator",
            Self::Enumerate { .. } => "enumerate",
            Self::Zip { .. } => "zip",
        }
    }
}

impl Trace for IterState {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        match self {
            Self::Seq { seq, .. } => work_list.push(*seq),
            Self::Values { items, .. } => items.mark_children(work_list),
            Self::Enumerate { inner, .. } => inner.mark_children(work_list),
            Self::Zip { inners } => inners.mark_children(work_list),
            Self::Str { .. } | Self::Range { .. } => {}
        }
    }
}
