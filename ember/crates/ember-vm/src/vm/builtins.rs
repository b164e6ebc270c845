//! Built-in methods on primitive objects, dispatched by `INVOKE` when
//! the receiver is not an instance or map.
//!
//! These are the primitives the VM itself needs (§ string concat and
//! substring, map insert/get/delete/clear, set algebra) plus the
//! iteration protocol every collection shares: `iter()` snapshots the
//! elements into an iterator object with `next()`/`done()`.

use crate::exception::ExceptionKind;
use crate::value::{IteratorObject, Object, Value};
use crate::vm::Vm;

impl Vm {
    /// Invokes a built-in method: pops the receiver and arguments,
    /// pushes the result.
    pub(crate) fn invoke_builtin(
        &mut self,
        receiver: Value,
        name: &str,
        argc: u8,
    ) -> Result<(), Value> {
        let exec = self.exec();
        let receiver_index = exec.stack.len() - argc as usize - 1;
        let args: Vec<Value> = exec.stack.drain(receiver_index + 1..).collect();
        exec.stack.pop();

        let result = self.builtin_dispatch(&receiver, name, &args)?;
        self.pushv(result)
    }

    fn builtin_dispatch(
        &mut self,
        receiver: &Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Value> {
        let Some(r) = receiver.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("{} has no methods", self.type_of(receiver)),
            ));
        };
        let kind = self.heap.get(r).kind_name();
        match self.heap.get(r) {
            Object::Str(_) => self.string_builtin(r, name, args),
            Object::Array(_) => self.array_builtin(r, name, args),
            Object::Map(_) => unreachable!("maps dispatch through INVOKE directly"),
            Object::Set(_) => self.set_builtin(r, name, args),
            Object::Generator(_) => match name {
                "next" => {
                    let sent = args.first().cloned().unwrap_or(Value::Nil);
                    self.generator_next(r, sent)
                }
                "done" => match self.heap.get(r) {
                    Object::Generator(object) => Ok(Value::Bool(
                        object.state == crate::value::GeneratorState::Done,
                    )),
                    _ => Ok(Value::Bool(true)),
                },
                _ => self.unknown_method(kind, name),
            },
            Object::Iterator(_) => match name {
                "next" => {
                    let value = match self.heap.get_mut(r) {
                        Object::Iterator(iterator) => {
                            let value = iterator.items.get(iterator.cursor).cloned();
                            if value.is_some() {
                                iterator.cursor += 1;
                            }
                            value
                        }
                        _ => None,
                    };
                    Ok(value.unwrap_or(Value::Nil))
                }
                "done" => match self.heap.get(r) {
                    Object::Iterator(iterator) => {
                        Ok(Value::Bool(iterator.cursor >= iterator.items.len()))
                    }
                    _ => Ok(Value::Bool(true)),
                },
                _ => self.unknown_method(kind, name),
            },
            Object::Exception(exception) => match name {
                "message" => {
                    let message = exception.message.clone();
                    Ok(self.heap.string_value(&message))
                }
                "trace" => {
                    let rendered = exception.render_trace();
                    Ok(self.heap.string_value(&rendered))
                }
                _ => self.unknown_method(kind, name),
            },
            _ => self.unknown_method(kind, name),
        }
    }

    fn unknown_method(&mut self, kind: &str, name: &str) -> Result<Value, Value> {
        Err(self.make_error(
            ExceptionKind::Type,
            format!("{kind} has no method '{name}'"),
        ))
    }

    // =========================================================================
    // STRINGS
    // =========================================================================

    fn string_builtin(
        &mut self,
        r: crate::value::ObjRef,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Value> {
        let text = match self.heap.get(r) {
            Object::Str(s) => s.chars.clone(),
            _ => String::new(),
        };
        match name {
            "len" => Ok(Value::Number(text.chars().count() as f64)),
            "substring" => {
                let count = text.chars().count();
                let start = self.arg_index(args.first(), count)?;
                let end = match args.get(1) {
                    Some(value) => self.arg_index(Some(value), count)?,
                    None => count,
                };
                let taken: String = text
                    .chars()
                    .skip(start)
                    .take(end.saturating_sub(start))
                    .collect();
                Ok(self.heap.string_value(&taken))
            }
            "contains" => {
                let needle = self.builtin_string_arg(args.first(), "contains")?;
                Ok(Value::Bool(text.contains(&needle)))
            }
            "upper" => {
                let upper = text.to_uppercase();
                Ok(self.heap.string_value(&upper))
            }
            "lower" => {
                let lower = text.to_lowercase();
                Ok(self.heap.string_value(&lower))
            }
            "trim" => {
                let trimmed = text.trim().to_string();
                Ok(self.heap.string_value(&trimmed))
            }
            "split" => {
                let separator = self.builtin_string_arg(args.first(), "split")?;
                let parts: Vec<String> = if separator.is_empty() {
                    text.chars().map(String::from).collect()
                } else {
                    text.split(&separator).map(String::from).collect()
                };
                let values: Vec<Value> = parts
                    .into_iter()
                    .map(|part| self.heap.string_value(&part))
                    .collect();
                Ok(Value::Obj(self.heap.alloc(Object::Array(values))))
            }
            "iter" => {
                let items: Vec<Value> = text
                    .chars()
                    .map(|c| self.heap.string_value(&c.to_string()))
                    .collect();
                Ok(self.make_iterator(Value::Obj(r), items))
            }
            _ => self.unknown_method("string", name),
        }
    }

    // =========================================================================
    // ARRAYS
    // =========================================================================

    fn array_builtin(
        &mut self,
        r: crate::value::ObjRef,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Value> {
        match name {
            "len" => match self.heap.get(r) {
                Object::Array(items) => Ok(Value::Number(items.len() as f64)),
                _ => Ok(Value::Number(0.0)),
            },
            "push" => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                match self.heap.get_mut(r) {
                    Object::Array(items) => {
                        items.push(value);
                        Ok(Value::Number(items.len() as f64))
                    }
                    _ => Ok(Value::Nil),
                }
            }
            "pop" => match self.heap.get_mut(r) {
                Object::Array(items) => Ok(items.pop().unwrap_or(Value::Nil)),
                _ => Ok(Value::Nil),
            },
            "contains" => {
                let needle = args.first().cloned().unwrap_or(Value::Nil);
                let items = match self.heap.get(r) {
                    Object::Array(items) => items.clone(),
                    _ => Vec::new(),
                };
                let found = items.iter().any(|item| self.heap.deep_equals(item, &needle));
                Ok(Value::Bool(found))
            }
            "join" => {
                let separator = self.builtin_string_arg(args.first(), "join")?;
                let items = match self.heap.get(r) {
                    Object::Array(items) => items.clone(),
                    _ => Vec::new(),
                };
                let joined = items
                    .iter()
                    .map(|item| self.heap.display_value(item))
                    .collect::<Vec<_>>()
                    .join(&separator);
                Ok(self.heap.string_value(&joined))
            }
            "iter" => {
                let items = match self.heap.get(r) {
                    Object::Array(items) => items.clone(),
                    _ => Vec::new(),
                };
                Ok(self.make_iterator(Value::Obj(r), items))
            }
            _ => self.unknown_method("array", name),
        }
    }

    // =========================================================================
    // SETS
    // =========================================================================

    fn set_builtin(
        &mut self,
        r: crate::value::ObjRef,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Value> {
        match name {
            "len" => match self.heap.get(r) {
                Object::Set(set) => Ok(Value::Number(set.len() as f64)),
                _ => Ok(Value::Number(0.0)),
            },
            "add" => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&value);
                match self.heap.get_mut(r) {
                    Object::Set(set) => Ok(Value::Bool(set.add(hash, value))),
                    _ => Ok(Value::Bool(false)),
                }
            }
            "has" => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&value);
                match self.heap.get(r) {
                    Object::Set(set) => Ok(Value::Bool(set.contains(hash, &value))),
                    _ => Ok(Value::Bool(false)),
                }
            }
            "delete" => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&value);
                match self.heap.get_mut(r) {
                    Object::Set(set) => Ok(Value::Bool(set.delete(hash, &value))),
                    _ => Ok(Value::Bool(false)),
                }
            }
            "clear" => {
                if let Object::Set(set) = self.heap.get_mut(r) {
                    set.clear();
                }
                Ok(Value::Nil)
            }
            "union" | "intersection" | "difference" => {
                let other = match args.first().and_then(Value::as_obj) {
                    Some(other_ref) if matches!(self.heap.get(other_ref), Object::Set(_)) => {
                        other_ref
                    }
                    _ => {
                        return Err(self.make_error(
                            ExceptionKind::Type,
                            format!("set.{name}() requires another set"),
                        ));
                    }
                };
                let (left, right) = match (self.heap.get(r), self.heap.get(other)) {
                    (Object::Set(a), Object::Set(b)) => (a.clone(), b.clone()),
                    _ => unreachable!("kinds checked above"),
                };
                let combined = match name {
                    "union" => left.union(&right),
                    "intersection" => left.intersection(&right),
                    _ => left.difference(&right),
                };
                Ok(Value::Obj(self.heap.alloc(Object::Set(combined))))
            }
            "values" | "iter" => {
                let items: Vec<Value> = match self.heap.get(r) {
                    Object::Set(set) => set.iter_hashed().map(|(_, v)| v.clone()).collect(),
                    _ => Vec::new(),
                };
                if name == "values" {
                    Ok(Value::Obj(self.heap.alloc(Object::Array(items))))
                } else {
                    Ok(self.make_iterator(Value::Obj(r), items))
                }
            }
            _ => self.unknown_method("set", name),
        }
    }

    // =========================================================================
    // MAP METHODS (reached via INVOKE on instances of Object::Map when
    // the named entry is absent would be a call error; the compiler
    // routes map methods here through `map_builtin`)
    // =========================================================================

    /// Map primitive operations, used by `INVOKE` when the map has no
    /// callable entry under the name.
    pub(crate) fn map_builtin(
        &mut self,
        r: crate::value::ObjRef,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Value> {
        match name {
            "len" => match self.heap.get(r) {
                Object::Map(map) => Ok(Value::Number(map.len() as f64)),
                _ => Ok(Value::Number(0.0)),
            },
            "get" => {
                let key = args.first().cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&key);
                let value = match self.heap.get(r) {
                    Object::Map(map) => map.get(hash, &key).cloned(),
                    _ => None,
                };
                Ok(value.unwrap_or(Value::Nil))
            }
            "set" => {
                let key = args.first().cloned().unwrap_or(Value::Nil);
                let value = args.get(1).cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&key);
                if let Object::Map(map) = self.heap.get_mut(r) {
                    map.insert(hash, key, value);
                }
                Ok(Value::Nil)
            }
            "has" => {
                let key = args.first().cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&key);
                let found = match self.heap.get(r) {
                    Object::Map(map) => map.contains(hash, &key),
                    _ => false,
                };
                Ok(Value::Bool(found))
            }
            "delete" => {
                let key = args.first().cloned().unwrap_or(Value::Nil);
                let hash = self.heap.hash_value(&key);
                let removed = match self.heap.get_mut(r) {
                    Object::Map(map) => map.delete(hash, &key).is_some(),
                    _ => false,
                };
                Ok(Value::Bool(removed))
            }
            "clear" => {
                if let Object::Map(map) = self.heap.get_mut(r) {
                    map.clear();
                }
                Ok(Value::Nil)
            }
            "keys" => {
                let keys: Vec<Value> = match self.heap.get(r) {
                    Object::Map(map) => map.iter().map(|(k, _)| k.clone()).collect(),
                    _ => Vec::new(),
                };
                Ok(Value::Obj(self.heap.alloc(Object::Array(keys))))
            }
            "values" => {
                let values: Vec<Value> = match self.heap.get(r) {
                    Object::Map(map) => map.iter().map(|(_, v)| v.clone()).collect(),
                    _ => Vec::new(),
                };
                Ok(Value::Obj(self.heap.alloc(Object::Array(values))))
            }
            "iter" => {
                let keys: Vec<Value> = match self.heap.get(r) {
                    Object::Map(map) => map.iter().map(|(k, _)| k.clone()).collect(),
                    _ => Vec::new(),
                };
                Ok(self.make_iterator(Value::Obj(r), keys))
            }
            _ => self.unknown_method("map", name),
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn make_iterator(&mut self, target: Value, items: Vec<Value>) -> Value {
        Value::Obj(self.heap.alloc(Object::Iterator(IteratorObject {
            target,
            items,
            cursor: 0,
        })))
    }

    fn builtin_string_arg(&mut self, value: Option<&Value>, method: &str) -> Result<String, Value> {
        match value.and_then(|v| self.heap.value_str(v)) {
            Some(s) => Ok(s.to_string()),
            None => Err(self.make_error(
                ExceptionKind::Type,
                format!("{method}() requires a string argument"),
            )),
        }
    }

    fn arg_index(&mut self, value: Option<&Value>, len: usize) -> Result<usize, Value> {
        let Some(n) = value.and_then(Value::as_number) else {
            return Err(self.make_error(ExceptionKind::Type, "index must be a number"));
        };
        let i = n as i64;
        if i < 0 {
            return Ok(0);
        }
        Ok((i as usize).min(len))
    }
}
