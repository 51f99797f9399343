use std::sync::Arc;

use crate::{
    builtins::Builtins,
    exception::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId, Trace},
    resource::ResourceTracker,
    types::Dict,
    value::Value,
};

/// A class created by `__build_class__`.
#[derive(Debug)]
pub(crate) struct Class {
    pub name: Arc<str>,
    pub qualname: Arc<str>,
    pub bases: Vec<Value>,
    /// User classes searched for attributes, this class first, depth-first over bases.
    pub mro: Vec<HeapId>,
    /// The builtin exception class this class derives from, if any.
    pub exc_base: Option<ExcType>,
    /// Namespace dict returned by the class body.
    pub namespace: HeapId,
}

impl Class {
    /// Computes the lookup order contributed by `bases` and the exception base they
    /// share, rejecting bases that cannot be subclassed.
    pub fn linearize(bases: &[Value], heap: &Heap<impl ResourceTracker>) -> RunResult<(Vec<HeapId>, Option<ExcType>)> {
        let mut mro: Vec<HeapId> = Vec::new();
        let mut exc_base = None;
        for base in bases {
            match base {
                Value::Ref(id) => match heap.get(*id) {
                    HeapData::Class(class) => {
                        for ancestor in &class.mro {
                            if !mro.contains(ancestor) {
                                mro.push(*ancestor);
                            }
                        }
                        exc_base = exc_base.or(class.exc_base);
                    }
                    other => return Err(bad_base(other.type_name())),
                },
                Value::ExcType(t) => exc_base = exc_base.or(Some(*t)),
                Value::Builtin(Builtins::Object) => {}
                other => return Err(bad_base(&other.type_name(heap))),
            }
        }
        Ok((mro, exc_base))
    }

    /// Whether `other` appears in this class's lookup order.
    pub fn derives_from(&self, other: HeapId) -> bool {
        self.mro.contains(&other)
    }
}

fn bad_base(type_name: &str) -> crate::exception::RunError {
    ExcType::type_error(format!("cannot inherit from '{type_name}' object"))
}

impl Trace for Class {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        self.bases.mark_children(work_list);
        work_list.extend_from_slice(&self.mro);
        work_list.push(self.namespace);
    }
}

/// An instance of a user class that does not derive from an exception.
#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub attrs: Dict,
}

impl Trace for Instance {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        work_list.push(self.class);
        self.attrs.mark_children(work_list);
    }
}

/// Result of `super(class, receiver)`: attribute lookup starts after `class` in the
/// receiver's lookup order.
#[derive(Debug)]
pub(crate) struct SuperProxy {
    pub class: HeapId,
    pub receiver: Value,
}
