//! Attribute access: instance dicts, class lookup order, `super` proxies and the
//! method tables of builtin types.

use super::VM;
use crate::{
    args::ArgValues,
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{BoundMethod, BuiltinMethod, DictKey, ExcClass, Method, MethodTable},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// `obj.name`
    pub(crate) fn get_attr(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        if name == "__class__" {
            return Ok(obj.class_of(self.heap));
        }
        let id = match obj {
            Value::Ref(id) => *id,
            Value::Str(_) => return self.builtin_method(obj, MethodTable::Str, name),
            Value::Builtin(b) if name == "__name__" => return Ok(Value::from(b.name())),
            Value::ExcType(t) if name == "__name__" => return Ok(Value::from(<&str>::from(*t))),
            other => return Err(ExcType::attribute_error(&other.type_name(self.heap), name)),
        };

        let class = match self.heap.get(id) {
            HeapData::Instance(instance) => {
                if let Some(value) = instance.attrs.get_str(name) {
                    return Ok(value.clone());
                }
                Some(instance.class)
            }
            HeapData::Exception(exc) => {
                if let Some(value) = exc.attrs.get_str(name) {
                    return Ok(value.clone());
                }
                if name == "args" {
                    let args = exc.args.clone();
                    return Ok(Value::Ref(self.heap.allocate(HeapData::Tuple(args))?));
                }
                match exc.class {
                    ExcClass::User(class) => Some(class),
                    ExcClass::Builtin(_) => None,
                }
            }
            HeapData::Class(class) => {
                let found = match name {
                    "__name__" => Some(Value::Str(class.name.clone())),
                    "__qualname__" => Some(Value::Str(class.qualname.clone())),
                    _ => self.class_lookup(id, name),
                };
                return found.ok_or_else(|| {
                    RunError::from(SimpleException::new_msg(
                        ExcType::AttributeError,
                        format!("type object '{}' has no attribute '{name}'", class.name),
                    ))
                });
            }
            HeapData::Function(func) => {
                return match name {
                    "__name__" => Ok(Value::from(func.code.name())),
                    "__qualname__" => Ok(Value::Str(func.qualname.clone())),
                    _ => Err(ExcType::attribute_error("function", name)),
                };
            }
            HeapData::Super(proxy) => {
                let (class, receiver) = (proxy.class, proxy.receiver.clone());
                return self.super_attr(class, receiver, name);
            }
            HeapData::List(_) => return self.builtin_method(obj, MethodTable::List, name),
            HeapData::Dict(_) => return self.builtin_method(obj, MethodTable::Dict, name),
            HeapData::Set(_) => return self.builtin_method(obj, MethodTable::Set, name),
            HeapData::Generator(_) => return self.builtin_method(obj, MethodTable::Generator, name),
            other => return Err(ExcType::attribute_error(other.type_name(), name)),
        };

        match class.and_then(|class| self.class_lookup(class, name)) {
            Some(attr) => self.bind(attr, obj.clone()),
            None => Err(ExcType::attribute_error(&obj.type_name(self.heap), name)),
        }
    }

    /// `obj.name = value`
    pub(crate) fn set_attr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        if let Value::Ref(id) = obj {
            match self.heap.get_mut(*id) {
                HeapData::Instance(instance) => {
                    instance.attrs.insert_str(name, value);
                    return Ok(());
                }
                HeapData::Exception(exc) => {
                    exc.attrs.insert_str(name, value);
                    return Ok(());
                }
                HeapData::Class(class) => {
                    let namespace = class.namespace;
                    return self.dict_set_str(namespace, name, value);
                }
                _ => {}
            }
        }
        Err(ExcType::attribute_error(&obj.type_name(self.heap), name))
    }

    /// `del obj.name`
    pub(crate) fn del_attr(&mut self, obj: &Value, name: &str) -> RunResult<()> {
        let removed = match obj {
            Value::Ref(id) => match self.heap.get_mut(*id) {
                HeapData::Instance(instance) => instance.attrs.remove(&DictKey::str(name)).is_some(),
                HeapData::Exception(exc) => exc.attrs.remove(&DictKey::str(name)).is_some(),
                HeapData::Class(class) => {
                    let namespace = class.namespace;
                    self.dict_del_str(namespace, name)?
                }
                _ => false,
            },
            _ => false,
        };
        if removed {
            Ok(())
        } else {
            Err(ExcType::attribute_error(&obj.type_name(self.heap), name))
        }
    }

    /// Finds `name` along a class's lookup order, unbound.
    pub(crate) fn class_lookup(&self, class: HeapId, name: &str) -> Option<Value> {
        let HeapData::Class(class) = self.heap.get(class) else {
            return None;
        };
        class.mro.iter().find_map(|ancestor| match self.heap.get(*ancestor) {
            HeapData::Class(ancestor) => self.dict_get_str(ancestor.namespace, name),
            _ => None,
        })
    }

    /// The user class of an instance, if it has one.
    pub(crate) fn user_class(&self, value: &Value) -> Option<HeapId> {
        match self.heap.get(value.ref_id()?) {
            HeapData::Instance(instance) => Some(instance.class),
            HeapData::Exception(exc) => match exc.class {
                ExcClass::User(class) => Some(class),
                ExcClass::Builtin(_) => None,
            },
            _ => None,
        }
    }

    /// Looks a special method up on the value's class, skipping the instance dict.
    pub(crate) fn lookup_special(&self, value: &Value, name: &str) -> Option<Value> {
        self.class_lookup(self.user_class(value)?, name)
    }

    /// Calls `value.name(*args)` when the value's user class defines `name`;
    /// `None` when it does not.
    pub(crate) fn call_dunder(&mut self, value: &Value, name: &str, args: Vec<Value>) -> RunResult<Option<Value>> {
        match self.lookup_special(value, name) {
            Some(func) => {
                let args = ArgValues::positional(args).with_receiver(value.clone());
                self.call_sync(func, args).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Binds plain functions found on a class to the instance they were looked up on.
    fn bind(&mut self, attr: Value, receiver: Value) -> RunResult<Value> {
        match attr {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Function(_)) => {
                let bound = self.heap.allocate(HeapData::BoundMethod(BoundMethod { func: attr, receiver }))?;
                Ok(Value::Ref(bound))
            }
            other => Ok(other),
        }
    }

    /// Lookup through `super(class, receiver)`: the receiver's lookup order, starting
    /// after `class`.
    fn super_attr(&mut self, class: HeapId, receiver: Value, name: &str) -> RunResult<Value> {
        let mro = match self.user_class(&receiver).map(|id| self.heap.get(id)) {
            Some(HeapData::Class(receiver_class)) => receiver_class.mro.clone(),
            _ => Vec::new(),
        };
        let found = mro
            .iter()
            .skip_while(|ancestor| **ancestor != class)
            .skip(1)
            .find_map(|ancestor| match self.heap.get(*ancestor) {
                HeapData::Class(ancestor) => self.dict_get_str(ancestor.namespace, name),
                _ => None,
            });
        match found {
            Some(attr) => self.bind(attr, receiver),
            None if name == "__init__" => {
                let method = self.heap.allocate(HeapData::BuiltinMethod(BuiltinMethod {
                    receiver,
                    method: Method::ObjectInit,
                }))?;
                Ok(Value::Ref(method))
            }
            None => Err(ExcType::attribute_error("super", name)),
        }
    }

    fn builtin_method(&mut self, receiver: &Value, table: MethodTable, name: &str) -> RunResult<Value> {
        match Method::lookup(table, name) {
            Some(method) => {
                let bound = self.heap.allocate(HeapData::BuiltinMethod(BuiltinMethod {
                    receiver: receiver.clone(),
                    method,
                }))?;
                Ok(Value::Ref(bound))
            }
            None => Err(ExcType::attribute_error(&receiver.type_name(self.heap), name)),
        }
    }
}
