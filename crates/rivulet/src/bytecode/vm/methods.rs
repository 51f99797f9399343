//! Methods of builtin types: `list.append`, `dict.get`, `str.join` and friends.

use super::{CallResult, VM};
use crate::{
    args::ArgValues,
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Dict, DictKey, ExceptionObject, Method, Set},
    value::{Value, normalize_index},
};

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// Calls a builtin method on its receiver.
    pub(super) fn call_method(&mut self, receiver: Value, method: Method, args: ArgValues) -> RunResult<CallResult> {
        let value = match (&receiver, method) {
            (Value::Str(text), _) => self.str_method(text, method, args)?,
            (_, Method::ObjectInit) => self.object_init(&receiver, args)?,
            (Value::Ref(id), _) => match method {
                Method::ListAppend
                | Method::ListExtend
                | Method::ListInsert
                | Method::ListPop
                | Method::ListRemove
                | Method::ListIndex
                | Method::ListCount
                | Method::ListReverse
                | Method::ListSort
                | Method::ListClear
                | Method::ListCopy => self.list_method(*id, method, args)?,
                Method::SetAdd | Method::SetDiscard | Method::SetRemove | Method::SetClear => {
                    self.set_method(&receiver, method, args)?
                }
                Method::GeneratorSend => {
                    let sent = args.get_one_arg("send")?;
                    self.generator_step(*id, sent)?
                }
                Method::GeneratorNext => {
                    args.check_zero_args("__next__")?;
                    self.generator_step(*id, Value::None)?
                }
                _ => self.dict_method(&receiver, *id, method, args)?,
            },
            _ => return Err(RunError::internal("builtin method bound to an immediate")),
        };
        Ok(CallResult::Value(value))
    }

    /// One step of a generator from native code; exhaustion raises `StopIteration`.
    fn generator_step(&mut self, gen_id: HeapId, sent: Value) -> RunResult<Value> {
        self.generator_send(gen_id, sent)?.ok_or_else(ExcType::stop_iteration)
    }

    /// `object.__init__` and `BaseException.__init__` reached through `super()`.
    fn object_init(&mut self, receiver: &Value, args: ArgValues) -> RunResult<Value> {
        args.check_no_kwargs("__init__")?;
        let Some(id) = receiver.ref_id() else {
            return Err(RunError::internal("__init__ receiver is not a heap object"));
        };
        match self.heap.get_mut(id) {
            HeapData::Exception(ExceptionObject { args: exc_args, .. }) => {
                *exc_args = args.positional;
                Ok(Value::None)
            }
            _ if args.positional.is_empty() => Ok(Value::None),
            _ => Err(ExcType::type_error(
                "object.__init__() takes exactly one argument (the instance to initialize)",
            )),
        }
    }

    fn list_items(&self, id: HeapId) -> RunResult<&Vec<Value>> {
        match self.heap.get(id) {
            HeapData::List(items) => Ok(items),
            _ => Err(RunError::internal("list method bound to a non-list")),
        }
    }

    fn list_items_mut(&mut self, id: HeapId) -> RunResult<&mut Vec<Value>> {
        match self.heap.get_mut(id) {
            HeapData::List(items) => Ok(items),
            _ => Err(RunError::internal("list method bound to a non-list")),
        }
    }

    fn list_method(&mut self, id: HeapId, method: Method, mut args: ArgValues) -> RunResult<Value> {
        match method {
            Method::ListAppend => {
                let item = args.get_one_arg("append")?;
                self.list_items_mut(id)?.push(item);
            }
            Method::ListExtend => {
                let iterable = args.get_one_arg("extend")?;
                let items = self.collect_iterable(iterable)?;
                self.list_items_mut(id)?.extend(items);
            }
            Method::ListInsert => {
                let (index, item) = args.get_two_args("insert")?;
                let index = index.as_index(self.heap)?;
                let items = self.list_items_mut(id)?;
                let len = i64::try_from(items.len()).map_err(|_| ExcType::overflow())?;
                let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
                items.insert(usize::try_from(at).unwrap_or(0), item);
            }
            Method::ListPop => {
                let index = match args.get_at_most("pop", 1)?.pop() {
                    Some(index) => index.as_index(self.heap)?,
                    None => -1,
                };
                let items = self.list_items_mut(id)?;
                if items.is_empty() {
                    return Err(SimpleException::new_msg(ExcType::IndexError, "pop from empty list").into());
                }
                let slot = normalize_index(index, items.len()).ok_or_else(|| ExcType::index_error("pop"))?;
                return Ok(items.remove(slot));
            }
            Method::ListRemove => {
                let item = args.get_one_arg("remove")?;
                match self.position_in_list(id, &item)? {
                    Some(slot) => {
                        self.list_items_mut(id)?.remove(slot);
                    }
                    None => return Err(ExcType::value_error("list.remove(x): x not in list")),
                }
            }
            Method::ListIndex => {
                let item = args.get_one_arg("index")?;
                return match self.position_in_list(id, &item)? {
                    Some(slot) => Ok(Value::Int(i64::try_from(slot).map_err(|_| ExcType::overflow())?)),
                    None => Err(ExcType::value_error(format!("{} is not in list", self.repr(&item)?))),
                };
            }
            Method::ListCount => {
                let item = args.get_one_arg("count")?;
                let items = self.list_items(id)?.clone();
                let mut count = 0;
                for candidate in &items {
                    if candidate.is_identical(&item) || self.values_equal(candidate, &item)? {
                        count += 1;
                    }
                }
                return Ok(Value::Int(count));
            }
            Method::ListReverse => {
                args.check_zero_args("reverse")?;
                self.list_items_mut(id)?.reverse();
            }
            Method::ListSort => {
                let key = args.take_kwarg("key").filter(|key| !key.is_none());
                let reverse = match args.take_kwarg("reverse") {
                    Some(flag) => self.truthy(&flag)?,
                    None => false,
                };
                args.check_zero_args("sort")?;
                // The list reads as empty while user key functions run.
                let items = std::mem::take(self.list_items_mut(id)?);
                match self.sort_values(items.clone(), key, reverse) {
                    Ok(sorted) => *self.list_items_mut(id)? = sorted,
                    Err(err) => {
                        *self.list_items_mut(id)? = items;
                        return Err(err);
                    }
                }
            }
            Method::ListClear => {
                args.check_zero_args("clear")?;
                self.list_items_mut(id)?.clear();
            }
            Method::ListCopy => {
                args.check_zero_args("copy")?;
                let items = self.list_items(id)?.clone();
                return Ok(Value::Ref(self.heap.allocate(HeapData::List(items))?));
            }
            _ => return Err(RunError::internal("not a list method")),
        }
        Ok(Value::None)
    }

    fn position_in_list(&mut self, id: HeapId, item: &Value) -> RunResult<Option<usize>> {
        let items = self.list_items(id)?.clone();
        for (slot, candidate) in items.iter().enumerate() {
            if candidate.is_identical(item) || self.values_equal(candidate, item)? {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn dict_method(&mut self, receiver: &Value, id: HeapId, method: Method, mut args: ArgValues) -> RunResult<Value> {
        let HeapData::Dict(dict) = self.heap.get(id) else {
            return Err(RunError::internal("dict method bound to a non-dict"));
        };
        match method {
            Method::DictKeys | Method::DictValues | Method::DictItems => {
                args.check_zero_args(method.name())?;
                let snapshot: Vec<(Value, Value)> = dict.items().map(|(k, v)| (k.clone(), v.clone())).collect();
                let mut items = Vec::with_capacity(snapshot.len());
                for (key, value) in snapshot {
                    items.push(match method {
                        Method::DictKeys => key,
                        Method::DictValues => value,
                        _ => Value::Ref(self.heap.allocate(HeapData::Tuple(vec![key, value]))?),
                    });
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::List(items))?))
            }
            Method::DictGet => {
                let (key, default) = args.get_one_two_args("get")?;
                let hash = DictKey::new(&key, self.heap)?;
                Ok(self.dict_lookup(id, &hash).unwrap_or(default.unwrap_or(Value::None)))
            }
            Method::DictPop => {
                let (key, default) = args.get_one_two_args("pop")?;
                let hash = DictKey::new(&key, self.heap)?;
                let removed = match self.heap.get_mut(id) {
                    HeapData::Dict(dict) => dict.remove(&hash).map(|(_, value)| value),
                    _ => None,
                };
                removed.or(default).ok_or_else(|| ExcType::key_error(key))
            }
            Method::DictSetdefault => {
                let (key, default) = args.get_one_two_args("setdefault")?;
                let hash = DictKey::new(&key, self.heap)?;
                if let Some(existing) = self.dict_lookup(id, &hash) {
                    return Ok(existing);
                }
                let value = default.unwrap_or(Value::None);
                self.dict_insert(receiver, key, value.clone())?;
                Ok(value)
            }
            Method::DictUpdate => {
                let kwargs = std::mem::take(&mut args.kwargs);
                if let Some(other) = args.get_at_most("update", 1)?.pop() {
                    self.dict_update(receiver, other)?;
                }
                for (name, value) in kwargs {
                    self.dict_insert(receiver, Value::Str(name), value)?;
                }
                Ok(Value::None)
            }
            Method::DictClear => {
                args.check_zero_args("clear")?;
                if let HeapData::Dict(dict) = self.heap.get_mut(id) {
                    *dict = Dict::new();
                }
                Ok(Value::None)
            }
            Method::DictCopy => {
                args.check_zero_args("copy")?;
                let mut copy = Dict::new();
                for (hash, key, value) in dict.entries() {
                    copy.insert(hash.clone(), key.clone(), value.clone());
                }
                Ok(Value::Ref(self.heap.allocate(HeapData::Dict(copy))?))
            }
            _ => Err(RunError::internal("not a dict method")),
        }
    }

    fn dict_lookup(&self, id: HeapId, hash: &DictKey) -> Option<Value> {
        match self.heap.get(id) {
            HeapData::Dict(dict) => dict.get(hash).cloned(),
            _ => None,
        }
    }

    /// Merges a dict, or an iterable of key/value pairs, into `target`.
    pub(crate) fn dict_update(&mut self, target: &Value, other: Value) -> RunResult<()> {
        if let Some(HeapData::Dict(source)) = other.ref_id().map(|id| self.heap.get(id)) {
            let pairs: Vec<(Value, Value)> = source.items().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (key, value) in pairs {
                self.dict_insert(target, key, value)?;
            }
            return Ok(());
        }
        let items = self.collect_iterable(other)?;
        for (index, item) in items.into_iter().enumerate() {
            let pair = self.collect_iterable(item)?;
            let [key, value]: [Value; 2] = pair.try_into().map_err(|pair: Vec<Value>| {
                ExcType::value_error(format!(
                    "dictionary update sequence element #{index} has length {}; 2 is required",
                    pair.len()
                ))
            })?;
            self.dict_insert(target, key, value)?;
        }
        Ok(())
    }

    fn set_method(&mut self, receiver: &Value, method: Method, args: ArgValues) -> RunResult<Value> {
        let id = receiver.ref_id().ok_or_else(|| RunError::internal("set method bound to an immediate"))?;
        match method {
            Method::SetAdd => {
                let item = args.get_one_arg("add")?;
                self.set_add(receiver, item)?;
            }
            Method::SetDiscard | Method::SetRemove => {
                let item = args.get_one_arg(method.name())?;
                let hash = DictKey::new(&item, self.heap)?;
                let removed = match self.heap.get_mut(id) {
                    HeapData::Set(set) => set.remove(&hash),
                    _ => return Err(RunError::internal("set method bound to a non-set")),
                };
                if !removed && method == Method::SetRemove {
                    return Err(ExcType::key_error(item));
                }
            }
            Method::SetClear => {
                args.check_zero_args("clear")?;
                if let HeapData::Set(set) = self.heap.get_mut(id) {
                    *set = Set::new();
                }
            }
            _ => return Err(RunError::internal("not a set method")),
        }
        Ok(Value::None)
    }

    fn str_method(&mut self, text: &str, method: Method, args: ArgValues) -> RunResult<Value> {
        let value = match method {
            Method::StrUpper => {
                args.check_zero_args("upper")?;
                Value::from(text.to_uppercase())
            }
            Method::StrLower => {
                args.check_zero_args("lower")?;
                Value::from(text.to_lowercase())
            }
            Method::StrStrip => match args.get_at_most("strip", 1)?.pop() {
                None | Some(Value::None) => Value::from(text.trim()),
                Some(Value::Str(chars)) => Value::from(text.trim_matches(|c: char| chars.contains(c))),
                Some(other) => return Err(str_arg_error("strip", &other, self)),
            },
            Method::StrStartswith | Method::StrEndswith => {
                let affix = args.get_one_arg(method.name())?;
                let Value::Str(affix) = &affix else {
                    return Err(str_arg_error(method.name(), &affix, self));
                };
                Value::Bool(if method == Method::StrStartswith {
                    text.starts_with(&**affix)
                } else {
                    text.ends_with(&**affix)
                })
            }
            Method::StrFind => {
                let needle = args.get_one_arg("find")?;
                let Value::Str(needle) = &needle else {
                    return Err(str_arg_error("find", &needle, self));
                };
                let index = text
                    .find(&**needle)
                    .map_or(-1, |byte| text[..byte].chars().count() as i64);
                Value::Int(index)
            }
            Method::StrReplace => {
                let (old, new) = args.get_two_args("replace")?;
                match (&old, &new) {
                    (Value::Str(old), Value::Str(new)) => Value::from(text.replace(&**old, new)),
                    (Value::Str(_), other) | (other, _) => return Err(str_arg_error("replace", other, self)),
                }
            }
            Method::StrSplit => {
                let parts: Vec<Value> = match args.get_at_most("split", 1)?.pop() {
                    None | Some(Value::None) => text.split_whitespace().map(Value::from).collect(),
                    Some(Value::Str(sep)) if sep.is_empty() => return Err(ExcType::value_error("empty separator")),
                    Some(Value::Str(sep)) => text.split(&*sep).map(Value::from).collect(),
                    Some(other) => return Err(str_arg_error("split", &other, self)),
                };
                Value::Ref(self.heap.allocate(HeapData::List(parts))?)
            }
            Method::StrJoin => {
                let iterable = args.get_one_arg("join")?;
                let items = self.collect_iterable(iterable)?;
                let mut joined = String::new();
                for (index, item) in items.iter().enumerate() {
                    let Value::Str(part) = item else {
                        return Err(ExcType::type_error(format!(
                            "sequence item {index}: expected str instance, {} found",
                            item.type_name(self.heap)
                        )));
                    };
                    if index > 0 {
                        joined.push_str(text);
                    }
                    joined.push_str(part);
                }
                Value::from(joined)
            }
            _ => return Err(ExcType::attribute_error("str", method.name())),
        };
        Ok(value)
    }
}

fn str_arg_error(method: &str, arg: &Value, vm: &VM<'_, impl ResourceTracker, impl PrintWriter>) -> RunError {
    ExcType::type_error(format!(
        "{method}() argument must be str, not {}",
        arg.type_name(vm.heap)
    ))
}
