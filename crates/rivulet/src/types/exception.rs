use crate::{
    exception::{ExcType, StackFrame},
    heap::{Heap, HeapData, HeapId, Trace},
    resource::ResourceTracker,
    types::Dict,
    value::Value,
};

/// The class of an exception instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExcClass {
    Builtin(ExcType),
    /// A user class deriving from a builtin exception.
    User(HeapId),
}

impl ExcClass {
    pub fn to_value(self) -> Value {
        match self {
            Self::Builtin(t) => Value::ExcType(t),
            Self::User(id) => Value::Ref(id),
        }
    }

    /// The builtin exception type at the root of this class's hierarchy.
    pub fn builtin_base(self, heap: &Heap<impl ResourceTracker>) -> ExcType {
        match self {
            Self::Builtin(t) => t,
            Self::User(id) => match heap.get(id) {
                HeapData::Class(class) => class.exc_base.unwrap_or(ExcType::Exception),
                _ => ExcType::Exception,
            },
        }
    }

    /// Whether an `except` clause naming `target` catches this class.
    pub fn is_subclass_of(self, target: &Value, heap: &Heap<impl ResourceTracker>) -> bool {
        match target {
            Value::ExcType(t) => self.builtin_base(heap).is_subclass_of(*t),
            Value::Ref(target_id) => match (self, heap.get(*target_id)) {
                (Self::User(id), HeapData::Class(_)) => match heap.get(id) {
                    HeapData::Class(class) => class.derives_from(*target_id),
                    _ => false,
                },
                _ => false,
            },
            _ => false,
        }
    }

    pub fn name(self, heap: &Heap<impl ResourceTracker>) -> String {
        match self {
            Self::Builtin(t) => t.to_string(),
            Self::User(id) => match heap.get(id) {
                HeapData::Class(class) => class.name.to_string(),
                other => other.type_name().to_owned(),
            },
        }
    }
}

/// An exception instance.
#[derive(Debug)]
pub(crate) struct ExceptionObject {
    pub class: ExcClass,
    pub args: Vec<Value>,
    /// Attributes set by user `__init__` methods or handlers.
    pub attrs: Dict,
    /// Outermost frame first; filled in as the exception leaves each frame.
    pub traceback: Vec<StackFrame>,
}

impl ExceptionObject {
    pub fn new(class: ExcClass, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            attrs: Dict::new(),
            traceback: Vec::new(),
        }
    }

    pub fn class_name(&self, heap: &Heap<impl ResourceTracker>) -> String {
        self.class.name(heap)
    }
}

impl Trace for ExceptionObject {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        if let ExcClass::User(id) = self.class {
            work_list.push(id);
        }
        self.args.mark_children(work_list);
        self.attrs.mark_children(work_list);
    }
}
