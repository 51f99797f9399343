//! Arena for every runtime value that needs identity or shared mutation, plus the
//! mark-sweep collector that reclaims unreachable entries.

use std::{fmt, mem::size_of};

use crate::{
    bytecode::vm::Generator,
    exception::{RunError, RunResult},
    resource::{ResourceError, ResourceTracker},
    types::{BoundMethod, BuiltinMethod, Class, Dict, ExceptionObject, Function, Instance, IterState, Range, Set, SuperProxy},
    value::Value,
};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Enumerates the heap references an entity owns.
///
/// Implemented by everything the collector can reach: heap entries, frames (live or
/// parked inside a generator) and code objects.
pub trait Trace {
    /// Pushes the id of every directly owned heap reference onto `work_list`.
    fn mark_children(&self, work_list: &mut Vec<HeapId>);
}

impl Trace for Value {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        match self {
            Self::Ref(id) => work_list.push(*id),
            Self::Unwind(why) => why.mark_children(work_list),
            _ => {}
        }
    }
}

impl<T: Trace> Trace for [T] {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        for item in self {
            item.mark_children(work_list);
        }
    }
}

impl<T: Trace> Trace for Option<T> {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        if let Some(item) = self {
            item.mark_children(work_list);
        }
    }
}

/// Every runtime value that lives in the arena.
#[derive(Debug)]
pub(crate) enum HeapData {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Dict),
    Set(Set),
    /// A boxed variable shared between a defining frame and the closures that capture it.
    /// `None` while unbound.
    Cell(Option<Value>),
    Function(Function),
    BoundMethod(BoundMethod),
    /// A method of a built-in type bound to its receiver, e.g. `xs.append`.
    BuiltinMethod(BuiltinMethod),
    Class(Class),
    Instance(Instance),
    Super(SuperProxy),
    Exception(ExceptionObject),
    Range(Range),
    Iter(IterState),
    Generator(Generator),
}

impl HeapData {
    /// Python type name, as used in error messages and `repr`.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Cell(_) => "cell",
            Self::Function(_) => "function",
            Self::BoundMethod(_) => "method",
            Self::BuiltinMethod(_) => "builtin_function_or_method",
            Self::Class(_) => "type",
            Self::Instance(_) => "object",
            Self::Super(_) => "super",
            Self::Exception(_) => "exception",
            Self::Range(_) => "range",
            Self::Iter(iter) => iter.type_name(),
            Self::Generator(_) => "generator",
        }
    }

    /// Rough byte size charged to the tracker's memory limit.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let values = match self {
            Self::List(items) | Self::Tuple(items) => items.len(),
            Self::Dict(dict) => dict.len() * 2,
            Self::Set(set) => set.len(),
            Self::Function(func) => func.defaults.len() + func.kwdefaults.len() + func.closure.len(),
            Self::Instance(instance) => instance.attrs.len(),
            Self::Exception(exc) => exc.args.len() + exc.attrs.len(),
            Self::Iter(IterState::Values { items, .. }) => items.len(),
            _ => 0,
        };
        size_of::<Self>() + values * size_of::<Value>()
    }
}

impl Trace for HeapData {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        match self {
            Self::List(items) | Self::Tuple(items) => items.mark_children(work_list),
            Self::Dict(dict) => dict.mark_children(work_list),
            Self::Set(set) => set.mark_children(work_list),
            Self::Cell(value) => value.mark_children(work_list),
            Self::Function(func) => func.mark_children(work_list),
            Self::BoundMethod(method) => {
                method.func.mark_children(work_list);
                method.receiver.mark_children(work_list);
            }
            Self::BuiltinMethod(method) => method.receiver.mark_children(work_list),
            Self::Class(class) => class.mark_children(work_list),
            Self::Instance(instance) => instance.mark_children(work_list),
            Self::Super(proxy) => {
                work_list.push(proxy.class);
                proxy.receiver.mark_children(work_list);
            }
            Self::Exception(exc) => exc.mark_children(work_list),
            Self::Range(_) => {}
            Self::Iter(iter) => iter.mark_children(work_list),
            Self::Generator(generator) => generator.mark_children(work_list),
        }
    }
}

/// The arena itself.
///
/// Entries are never moved: a `HeapId` stays valid until the collector proves it
/// unreachable. Freed slots are recycled through `free_list`.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapData>>,
    /// Freed slots available for reuse by `allocate`.
    free_list: Vec<HeapId>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    pub fn into_tracker(self) -> T {
        self.tracker
    }

    /// Number of live entries.
    pub fn live(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    /// Allocates a new entry, charging the tracker first.
    ///
    /// Every call is a potential safepoint from the tracker's point of view, but the
    /// collector itself only runs between instructions.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(|| data.estimate_size())?;
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(data);
            id
        } else {
            self.entries.push(Some(data));
            HeapId(self.entries.len() - 1)
        };
        Ok(id)
    }

    /// # Panics
    /// Panics if `id` was freed: the collector only frees unreachable entries, so a
    /// dangling id means a root was missed.
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("Heap::get: object already freed")
    }

    /// # Panics
    /// See [`Heap::get`].
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("Heap::get_mut: object already freed")
    }

    /// Rebinds a cell; a non-cell id means compiler and engine disagree on the cell layout.
    pub fn set_cell(&mut self, id: HeapId, value: Option<Value>) -> RunResult<()> {
        match self.get_mut(id) {
            HeapData::Cell(slot) => {
                *slot = value;
                Ok(())
            }
            other => Err(RunError::internal(format!("{} used as a cell", other.type_name()))),
        }
    }

    /// Whether the tracker has scheduled a collection.
    #[inline]
    pub fn should_gc(&self) -> bool {
        self.tracker.should_gc()
    }

    /// Mark-sweep collection. Returns the number of entries freed.
    ///
    /// `roots` must contain every reference held outside the heap: frame stacks, slots,
    /// cells, block-saved exceptions and namespaces.
    pub fn collect_garbage(&mut self, roots: Vec<HeapId>) -> usize {
        let mut reachable = vec![false; self.entries.len()];
        let mut work_list = roots;

        while let Some(id) = work_list.pop() {
            let idx = id.index();
            if idx >= reachable.len() || reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            if let Some(Some(data)) = self.entries.get(idx) {
                data.mark_children(&mut work_list);
            }
        }

        let mut freed = 0;
        for (idx, slot) in self.entries.iter_mut().enumerate() {
            if reachable[idx] {
                continue;
            }
            if let Some(data) = slot.take() {
                self.tracker.on_free(|| data.estimate_size());
                self.free_list.push(HeapId(idx));
                freed += 1;
            }
        }
        self.tracker.on_gc_complete();
        tracing::debug!(freed, live = self.live(), "garbage collection finished");
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn list(items: Vec<Value>) -> HeapData {
        HeapData::List(items)
    }

    #[test]
    fn unreachable_cycle_is_collected() {
        let mut heap = Heap::new(NoLimitTracker::default());
        let a = heap.allocate(list(vec![])).unwrap();
        let b = heap.allocate(list(vec![Value::Ref(a)])).unwrap();
        if let HeapData::List(items) = heap.get_mut(a) {
            items.push(Value::Ref(b));
        }
        let kept = heap.allocate(list(vec![Value::Int(1)])).unwrap();

        assert_eq!(heap.collect_garbage(vec![kept]), 2);
        assert_eq!(heap.live(), 1);
        assert!(matches!(heap.get(kept), HeapData::List(items) if items.len() == 1));
    }

    #[test]
    fn children_of_roots_survive() {
        let mut heap = Heap::new(NoLimitTracker::default());
        let cell = heap.allocate(HeapData::Cell(Some(Value::Int(7)))).unwrap();
        let outer = heap.allocate(HeapData::Tuple(vec![Value::Ref(cell)])).unwrap();
        assert_eq!(heap.collect_garbage(vec![outer]), 0);
        assert!(matches!(heap.get(cell), HeapData::Cell(Some(Value::Int(7)))));
    }

    #[test]
    fn set_cell_rejects_non_cells() {
        let mut heap = Heap::new(NoLimitTracker::default());
        let cell = heap.allocate(HeapData::Cell(None)).unwrap();
        heap.set_cell(cell, Some(Value::Int(3))).unwrap();
        assert!(matches!(heap.get(cell), HeapData::Cell(Some(Value::Int(3)))));

        let not_a_cell = heap.allocate(list(vec![])).unwrap();
        let err = heap.set_cell(not_a_cell, None).unwrap_err();
        assert!(matches!(err, RunError::Internal(msg) if msg == "list used as a cell"));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new(NoLimitTracker::default());
        let dead = heap.allocate(list(vec![])).unwrap();
        heap.collect_garbage(vec![]);
        let fresh = heap.allocate(list(vec![])).unwrap();
        assert_eq!(dead, fresh);
        assert_eq!(heap.live(), 1);
    }
}
