use std::sync::Arc;

use strum::IntoStaticStr;

use crate::{
    bytecode::Code,
    heap::{HeapId, Trace},
    value::Value,
};

/// A user-defined function: code plus everything captured when `MAKE_FUNCTION` ran.
#[derive(Debug)]
pub(crate) struct Function {
    pub code: Arc<Code>,
    pub qualname: Arc<str>,
    /// Module namespace the function resolves globals in.
    pub globals: HeapId,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Value>,
    pub kwdefaults: Vec<(Arc<str>, Value)>,
    /// Cells for the code's freevars, in order.
    pub closure: Vec<HeapId>,
}

impl Trace for Function {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        work_list.push(self.globals);
        self.defaults.mark_children(work_list);
        for (_, value) in &self.kwdefaults {
            value.mark_children(work_list);
        }
        work_list.extend_from_slice(&self.closure);
    }
}

/// A function bound to the instance it was looked up on.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub func: Value,
    pub receiver: Value,
}

/// A builtin type's method bound to its receiver.
#[derive(Debug)]
pub(crate) struct BuiltinMethod {
    pub receiver: Value,
    pub method: Method,
}

/// Methods of builtin types. The static string is the attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum Method {
    #[strum(serialize = "append")]
    ListAppend,
    #[strum(serialize = "extend")]
    ListExtend,
    #[strum(serialize = "insert")]
    ListInsert,
    #[strum(serialize = "pop")]
    ListPop,
    #[strum(serialize = "remove")]
    ListRemove,
    #[strum(serialize = "index")]
    ListIndex,
    #[strum(serialize = "count")]
    ListCount,
    #[strum(serialize = "reverse")]
    ListReverse,
    #[strum(serialize = "sort")]
    ListSort,
    #[strum(serialize = "clear")]
    ListClear,
    #[strum(serialize = "copy")]
    ListCopy,

    #[strum(serialize = "keys")]
    DictKeys,
    #[strum(serialize = "values")]
    DictValues,
    #[strum(serialize = "items")]
    DictItems,
    #[strum(serialize = "get")]
    DictGet,
    #[strum(serialize = "pop")]
    DictPop,
    #[strum(serialize = "setdefault")]
    DictSetdefault,
    #[strum(serialize = "update")]
    DictUpdate,
    #[strum(serialize = "clear")]
    DictClear,
    #[strum(serialize = "copy")]
    DictCopy,

    #[strum(serialize = "add")]
    SetAdd,
    #[strum(serialize = "discard")]
    SetDiscard,
    #[strum(serialize = "remove")]
    SetRemove,
    #[strum(serialize = "clear")]
    SetClear,

    #[strum(serialize = "join")]
    StrJoin,
    #[strum(serialize = "split")]
    StrSplit,
    #[strum(serialize = "upper")]
    StrUpper,
    #[strum(serialize = "lower")]
    StrLower,
    #[strum(serialize = "strip")]
    StrStrip,
    #[strum(serialize = "startswith")]
    StrStartswith,
    #[strum(serialize = "endswith")]
    StrEndswith,
    #[strum(serialize = "replace")]
    StrReplace,
    #[strum(serialize = "find")]
    StrFind,

    #[strum(serialize = "send")]
    GeneratorSend,
    #[strum(serialize = "__next__")]
    GeneratorNext,

    /// `object.__init__` / `BaseException.__init__`, reached through `super()`.
    #[strum(serialize = "__init__")]
    ObjectInit,
}

/// Which builtin type a method table applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MethodTable {
    List,
    Dict,
    Set,
    Str,
    Generator,
}

impl Method {
    pub fn name(self) -> &'static str {
        self.into()
    }

    #[allow(clippy::enum_glob_use)]
    pub fn lookup(table: MethodTable, name: &str) -> Option<Self> {
        use Method::*;
        let candidates: &[Self] = match table {
            MethodTable::List => &[
                ListAppend,
                ListExtend,
                ListInsert,
                ListPop,
                ListRemove,
                ListIndex,
                ListCount,
                ListReverse,
                ListSort,
                ListClear,
                ListCopy,
            ],
            MethodTable::Dict => &[
                DictKeys,
                DictValues,
                DictItems,
                DictGet,
                DictPop,
                DictSetdefault,
                DictUpdate,
                DictClear,
                DictCopy,
            ],
            MethodTable::Set => &[SetAdd, SetDiscard, SetRemove, SetClear],
            MethodTable::Str => &[
                StrJoin,
                StrSplit,
                StrUpper,
                StrLower,
                StrStrip,
                StrStartswith,
                StrEndswith,
                StrReplace,
                StrFind,
            ],
            MethodTable::Generator => &[GeneratorSend, GeneratorNext],
        };
        candidates.iter().copied().find(|method| method.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_per_type() {
        assert_eq!(Method::lookup(MethodTable::List, "pop"), Some(Method::ListPop));
        assert_eq!(Method::lookup(MethodTable::Dict, "pop"), Some(Method::DictPop));
        assert_eq!(Method::lookup(MethodTable::Set, "append"), None);
        assert_eq!(Method::GeneratorNext.name(), "__next__");
    }
}
