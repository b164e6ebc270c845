//! The dispatch loop and opcode semantics.
//!
//! One opcode per iteration, read from the current frame's chunk. Every
//! fallible operation funnels through `vm_try!`, which converts an
//! exception value into a `do_throw` - so a TypeError raised by `ADD`
//! unwinds exactly like a script-level `throw`.

use std::sync::Arc;

use ember_compile::{Constant, Function, FunctionKind, OpCode, NO_JUMP, NO_SLOT};

use crate::exception::ExceptionKind;
use crate::frame::{
    CallFrame, Completion, HandlerFrame, HandlerState, Outcome, FRAMES_MAX, STACK_MAX,
};
use crate::value::{
    BoundMethodObject, ClassObject, InstanceObject, Object, ObjRef, PromiseState, RegexObject,
    Value, ValueMap,
};
use crate::vm::Vm;

impl Vm {
    /// Runs the current execution until it halts, returns below `floor`
    /// frames, throws unhandled, or suspends.
    ///
    /// `inject` throws the given value at the resumption point before
    /// executing anything - how a host raises an exception into a
    /// suspended coroutine.
    pub(crate) fn execute(&mut self, floor: usize, inject: Option<Value>) -> Outcome {
        macro_rules! vm_try {
            ($expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(exception) => {
                        if let Some(outcome) = self.do_throw(exception) {
                            return outcome;
                        }
                        continue;
                    }
                }
            };
        }

        if let Some(exception) = inject {
            if let Some(outcome) = self.do_throw(exception) {
                return outcome;
            }
        }

        loop {
            // The safepoint: collection runs only here, never inside an
            // allocation, so values in flight on the stack are visible
            // as roots.
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let function = self.frame().function.clone();
            let chunk = &function.chunk;
            let ip = self.frame().ip;
            if ip >= chunk.len() {
                return Outcome::Halted;
            }

            let Some(op) = OpCode::decode(chunk.read_byte(ip)) else {
                let exception = self.make_error(
                    ExceptionKind::Runtime,
                    format!("invalid opcode {:#04x}", chunk.read_byte(ip)),
                );
                self.frame_mut().ip = ip + 1;
                if let Some(outcome) = self.do_throw(exception) {
                    return outcome;
                }
                continue;
            };

            match op {
                // === Constants and stack ===
                OpCode::PushConst => {
                    let index = chunk.read_byte(ip + 1) as usize;
                    let value = self.constant_to_value(&function, index);
                    self.frame_mut().ip = ip + 2;
                    vm_try!(self.pushv(value));
                }
                OpCode::Pop => {
                    self.frame_mut().ip = ip + 1;
                    self.popv();
                }

                // === Locals and globals ===
                OpCode::GetLocal => {
                    let slot = chunk.read_byte(ip + 1) as usize;
                    self.frame_mut().ip = ip + 2;
                    let base = self.frame().base;
                    let value = self
                        .exec_ref()
                        .stack
                        .get(base + slot)
                        .cloned()
                        .unwrap_or(Value::Nil);
                    vm_try!(self.pushv(value));
                }
                OpCode::SetLocal => {
                    let slot = chunk.read_byte(ip + 1) as usize;
                    self.frame_mut().ip = ip + 2;
                    let base = self.frame().base;
                    let value = self.peek(0).clone();
                    let exec = self.exec();
                    if base + slot < exec.stack.len() {
                        exec.stack[base + slot] = value;
                    }
                }
                OpCode::GetGlobal => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let value = match self.globals.get(&name) {
                        Some(value) => value.clone(),
                        None => {
                            let exception = self.make_error(
                                ExceptionKind::Reference,
                                format!("undefined variable '{name}'"),
                            );
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                            continue;
                        }
                    };
                    vm_try!(self.pushv(value));
                }
                OpCode::SetGlobal => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let value = self.peek(0).clone();
                    self.globals.insert(name, value);
                }

                // === Arithmetic and logic ===
                OpCode::Add => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_add());
                }
                OpCode::Sub => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_numeric(op, |a, b| a - b));
                }
                OpCode::Mul => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_numeric(op, |a, b| a * b));
                }
                OpCode::Div => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_numeric(op, |a, b| a / b));
                }
                OpCode::Mod => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_numeric(op, |a, b| a % b));
                }
                OpCode::Negate => {
                    self.frame_mut().ip = ip + 1;
                    let value = self.popv();
                    match value.as_number() {
                        Some(n) => vm_try!(self.pushv(Value::Number(-n))),
                        None => {
                            let exception = self.make_error(
                                ExceptionKind::Type,
                                format!("cannot negate {}", self.type_of(&value)),
                            );
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                        }
                    }
                }
                OpCode::Not => {
                    self.frame_mut().ip = ip + 1;
                    let value = self.popv();
                    vm_try!(self.pushv(Value::Bool(!value.is_truthy())));
                }
                OpCode::And => {
                    self.frame_mut().ip = ip + 1;
                    let b = self.popv();
                    let a = self.popv();
                    vm_try!(self.pushv(Value::Bool(a.is_truthy() && b.is_truthy())));
                }
                OpCode::Or => {
                    self.frame_mut().ip = ip + 1;
                    let b = self.popv();
                    let a = self.popv();
                    vm_try!(self.pushv(Value::Bool(a.is_truthy() || b.is_truthy())));
                }

                // === Comparison ===
                OpCode::Equal => {
                    self.frame_mut().ip = ip + 1;
                    let b = self.popv();
                    let a = self.popv();
                    let equal = self.heap.deep_equals(&a, &b);
                    vm_try!(self.pushv(Value::Bool(equal)));
                }
                OpCode::NotEqual => {
                    self.frame_mut().ip = ip + 1;
                    let b = self.popv();
                    let a = self.popv();
                    let equal = self.heap.deep_equals(&a, &b);
                    vm_try!(self.pushv(Value::Bool(!equal)));
                }
                OpCode::Less => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_compare(|ord| ord.is_lt()));
                }
                OpCode::LessEqual => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_compare(|ord| ord.is_le()));
                }
                OpCode::Greater => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_compare(|ord| ord.is_gt()));
                }
                OpCode::GreaterEqual => {
                    self.frame_mut().ip = ip + 1;
                    vm_try!(self.op_compare(|ord| ord.is_ge()));
                }

                // === Control flow ===
                OpCode::Jump | OpCode::Break => {
                    let distance = chunk.read_u16(ip + 1) as usize;
                    self.frame_mut().ip = ip + 3 + distance;
                }
                OpCode::JumpIfFalse => {
                    let distance = chunk.read_u16(ip + 1) as usize;
                    let condition = self.popv();
                    self.frame_mut().ip = if condition.is_truthy() {
                        ip + 3
                    } else {
                        ip + 3 + distance
                    };
                }
                OpCode::Loop | OpCode::Continue => {
                    let distance = chunk.read_u16(ip + 1) as usize;
                    self.frame_mut().ip = ip + 3 - distance;
                }
                OpCode::Halt => {
                    let exec = self.exec();
                    let frame = exec.frames.pop().expect("halt without frame");
                    let retained = if exec.stack.len() > frame.base + 1 {
                        exec.stack.pop()
                    } else {
                        None
                    };
                    exec.stack.truncate(frame.base);
                    if let Some(value) = retained {
                        exec.stack.push(value);
                    }
                    return Outcome::Halted;
                }
                OpCode::Return => {
                    self.frame_mut().ip = ip + 1;
                    let value = self.popv();
                    if let Some(outcome) = self.do_return(value, floor) {
                        return outcome;
                    }
                }
                OpCode::Call => {
                    let argc = chunk.read_byte(ip + 1);
                    self.frame_mut().ip = ip + 2;
                    vm_try!(self.call_value(argc));
                }

                // === Containers ===
                OpCode::ArrayNew => {
                    let count = chunk.read_byte(ip + 1) as usize;
                    self.frame_mut().ip = ip + 2;
                    let exec = self.exec();
                    let start = exec.stack.len() - count;
                    let items: Vec<Value> = exec.stack.drain(start..).collect();
                    let array = Value::Obj(self.heap.alloc(Object::Array(items)));
                    vm_try!(self.pushv(array));
                }
                OpCode::ArrayGet => {
                    self.frame_mut().ip = ip + 1;
                    let index = self.popv();
                    let target = self.popv();
                    let value = vm_try!(self.op_subscript_get(target, index));
                    vm_try!(self.pushv(value));
                }
                OpCode::ArraySet => {
                    self.frame_mut().ip = ip + 1;
                    let value = self.popv();
                    let index = self.popv();
                    let target = self.popv();
                    vm_try!(self.op_subscript_set(target, index, value.clone()));
                    vm_try!(self.pushv(value));
                }
                OpCode::HashMapNew => {
                    let pairs = chunk.read_byte(ip + 1) as usize;
                    self.frame_mut().ip = ip + 2;
                    let exec = self.exec();
                    let start = exec.stack.len() - pairs * 2;
                    let flat: Vec<Value> = exec.stack.drain(start..).collect();
                    let mut map = ValueMap::new();
                    for pair in flat.chunks(2) {
                        let hash = self.heap.hash_value(&pair[0]);
                        map.insert(hash, pair[0].clone(), pair[1].clone());
                    }
                    let value = Value::Obj(self.heap.alloc(Object::Map(map)));
                    vm_try!(self.pushv(value));
                }
                OpCode::HashMapGet => {
                    self.frame_mut().ip = ip + 1;
                    let key = self.popv();
                    let target = self.popv();
                    let value = match target.as_obj().map(|r| self.heap.get(r)) {
                        Some(Object::Map(map)) => {
                            let hash = self.heap.hash_value(&key);
                            map.get(hash, &key).cloned().unwrap_or(Value::Nil)
                        }
                        _ => {
                            let exception = self.make_error(
                                ExceptionKind::Type,
                                format!("expected a map, got {}", self.type_of(&target)),
                            );
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                            continue;
                        }
                    };
                    vm_try!(self.pushv(value));
                }

                // === Classes and instances ===
                OpCode::ClassDef => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let class = Value::Obj(self.heap.alloc(Object::Class(ClassObject {
                        name,
                        ..ClassObject::default()
                    })));
                    vm_try!(self.pushv(class));
                }
                OpCode::Inherit => {
                    self.frame_mut().ip = ip + 1;
                    let superclass = self.popv();
                    let class = self.peek(0).clone();
                    vm_try!(self.op_inherit(class, superclass));
                }
                OpCode::MethodDef => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let method = self.popv();
                    let class = self.peek(0).clone();
                    match class.as_obj().map(|r| self.heap.get_mut(r)) {
                        Some(Object::Class(object)) => {
                            object.methods.insert(name, method);
                        }
                        _ => {
                            let exception = self
                                .make_error(ExceptionKind::Type, "method defined outside a class");
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                        }
                    }
                }
                OpCode::InstanceNew => {
                    let argc = chunk.read_byte(ip + 1);
                    self.frame_mut().ip = ip + 2;
                    vm_try!(self.op_instance_new(argc));
                }
                OpCode::Invoke => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    let argc = chunk.read_byte(ip + 2);
                    self.frame_mut().ip = ip + 3;
                    vm_try!(self.op_invoke(&name, argc));
                }
                OpCode::GetProperty => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let target = self.popv();
                    let value = vm_try!(self.op_get_property(&target, &name));
                    vm_try!(self.pushv(value));
                }
                OpCode::SetProperty => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let value = self.popv();
                    let target = self.popv();
                    vm_try!(self.op_set_property(&target, &name, value.clone()));
                    vm_try!(self.pushv(value));
                }
                OpCode::GetSuper => {
                    let name = self.constant_name(&function, chunk.read_byte(ip + 1));
                    self.frame_mut().ip = ip + 2;
                    let receiver = self.popv();
                    let bound = vm_try!(self.op_get_super(receiver, &name));
                    vm_try!(self.pushv(bound));
                }

                // === Exceptions ===
                OpCode::TryBegin => {
                    let catch_at = chunk.read_u16(ip + 1);
                    let finally_at = chunk.read_u16(ip + 3);
                    self.frame_mut().ip = ip + 5;
                    let frame_index = self.exec_ref().frames.len() - 1;
                    let depth = self.exec_ref().stack.len();
                    self.exec().handlers.push(HandlerFrame {
                        frame_index,
                        catch_ip: (catch_at != NO_JUMP).then_some(catch_at as usize),
                        finally_ip: (finally_at != NO_JUMP).then_some(finally_at as usize),
                        stack_depth: depth,
                        state: HandlerState::Try,
                        completion: Completion::Normal,
                    });
                }
                OpCode::TryEnd => {
                    let distance = chunk.read_u16(ip + 1);
                    self.handler_block_end(ip, distance);
                }
                OpCode::CatchBegin => {
                    let slot = chunk.read_byte(ip + 1);
                    self.frame_mut().ip = ip + 2;
                    if slot == NO_SLOT {
                        self.popv();
                    }
                    // With a binding the exception already sits in the
                    // local's slot; nothing to move.
                }
                OpCode::CatchEnd => {
                    let distance = chunk.read_u16(ip + 1);
                    self.handler_block_end(ip, distance);
                }
                OpCode::FinallyBegin => {
                    self.frame_mut().ip = ip + 1;
                }
                OpCode::FinallyEnd => {
                    self.frame_mut().ip = ip + 1;
                    let handler = self
                        .exec()
                        .handlers
                        .pop()
                        .expect("FINALLY_END without handler");
                    match handler.completion {
                        Completion::Normal => {}
                        Completion::Throw(exception) => {
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                        }
                        Completion::Return(value) => {
                            if let Some(outcome) = self.do_return(value, floor) {
                                return outcome;
                            }
                        }
                    }
                }
                OpCode::Throw => {
                    self.frame_mut().ip = ip + 1;
                    let exception = self.popv();
                    if let Some(outcome) = self.do_throw(exception) {
                        return outcome;
                    }
                }

                // === Coroutines ===
                OpCode::Await => {
                    self.frame_mut().ip = ip + 1;
                    let awaited = self.popv();
                    match self.op_await(awaited) {
                        Ok(None) => {}
                        Ok(Some(pending)) => return Outcome::AwaitPending(pending),
                        Err(exception) => {
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                        }
                    }
                }
                OpCode::Yield => {
                    self.frame_mut().ip = ip + 1;
                    let value = self.popv();
                    if self.exec_ref().kind != crate::frame::ExecKind::Generator {
                        let exception = self.make_error(
                            ExceptionKind::Runtime,
                            "'yield' outside of a generator",
                        );
                        if let Some(outcome) = self.do_throw(exception) {
                            return outcome;
                        }
                        continue;
                    }
                    return Outcome::Yielded(value);
                }

                // === Regex ===
                OpCode::RegexNew => {
                    self.frame_mut().ip = ip + 1;
                    let flags = self.popv();
                    let pattern = self.popv();
                    let value = vm_try!(self.op_regex_new(pattern, flags));
                    vm_try!(self.pushv(value));
                }
                OpCode::RegexTest => {
                    self.frame_mut().ip = ip + 1;
                    let text = self.popv();
                    let regex = self.popv();
                    let value = vm_try!(self.op_regex_test(regex, text));
                    vm_try!(self.pushv(value));
                }
                OpCode::RegexMatch => {
                    self.frame_mut().ip = ip + 1;
                    let text = self.popv();
                    let regex = self.popv();
                    let value = vm_try!(self.op_regex_match(regex, text));
                    vm_try!(self.pushv(value));
                }
                OpCode::RegexReplace => {
                    self.frame_mut().ip = ip + 1;
                    let replacement = self.popv();
                    let text = self.popv();
                    let regex = self.popv();
                    let value = vm_try!(self.op_regex_replace(regex, text, replacement));
                    vm_try!(self.pushv(value));
                }
                OpCode::RegexSplit => {
                    self.frame_mut().ip = ip + 1;
                    let text = self.popv();
                    let regex = self.popv();
                    let value = vm_try!(self.op_regex_split(regex, text));
                    vm_try!(self.pushv(value));
                }

                // === Strings ===
                OpCode::StringInterpolate => {
                    let index = chunk.read_byte(ip + 1) as usize;
                    self.frame_mut().ip = ip + 2;
                    let raw = match &function.chunk.constants[index] {
                        Constant::InterpolatedStr(raw) | Constant::Str(raw) => raw.clone(),
                        other => {
                            let exception = self.make_error(
                                ExceptionKind::Runtime,
                                format!("STRING_INTERPOLATE on non-string constant {other:?}"),
                            );
                            if let Some(outcome) = self.do_throw(exception) {
                                return outcome;
                            }
                            continue;
                        }
                    };
                    let value = vm_try!(self.interpolate(&raw));
                    vm_try!(self.pushv(value));
                }

                // === Switch helpers ===
                OpCode::Case => {
                    let distance = chunk.read_u16(ip + 1) as usize;
                    let case_value = self.popv();
                    let switch_value = self.peek(0).clone();
                    if self.heap.deep_equals(&switch_value, &case_value) {
                        self.popv(); // consume the switch value
                        self.frame_mut().ip = ip + 3;
                    } else {
                        self.frame_mut().ip = ip + 3 + distance;
                    }
                }
                OpCode::Default => {
                    self.frame_mut().ip = ip + 1;
                    self.popv();
                }
            }
        }
    }

    // =========================================================================
    // STACK PRIMITIVES
    // =========================================================================

    pub(crate) fn pushv(&mut self, value: Value) -> Result<(), Value> {
        if self.exec_ref().stack.len() >= STACK_MAX {
            return Err(self.make_error(ExceptionKind::Memory, "operand stack overflow"));
        }
        self.exec().stack.push(value);
        Ok(())
    }

    pub(crate) fn popv(&mut self) -> Value {
        self.exec().stack.pop().unwrap_or(Value::Nil)
    }

    pub(crate) fn peek(&self, distance: usize) -> &Value {
        let stack = &self.exec_ref().stack;
        &stack[stack.len() - 1 - distance]
    }

    /// Converts a pool constant into a runtime value, interning strings.
    fn constant_to_value(&mut self, function: &Function, index: usize) -> Value {
        match &function.chunk.constants[index] {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Number(n) => Value::Number(*n),
            Constant::Str(s) | Constant::InterpolatedStr(s) => {
                let s = s.clone();
                self.heap.string_value(&s)
            }
            Constant::Function(f) => Value::Function(f.clone()),
        }
    }

    /// Reads a name constant (always `Constant::Str` for well-formed
    /// chunks).
    fn constant_name(&self, function: &Function, index: u8) -> String {
        match &function.chunk.constants[index as usize] {
            Constant::Str(s) => s.clone(),
            other => format!("{other:?}"),
        }
    }

    /// A descriptive type name, resolving heap objects.
    pub(crate) fn type_of(&self, value: &Value) -> String {
        match value {
            Value::Obj(r) => self.heap.get(*r).kind_name().to_string(),
            other => other.type_name().to_string(),
        }
    }

    // =========================================================================
    // ARITHMETIC AND COMPARISON
    // =========================================================================

    fn op_add(&mut self) -> Result<(), Value> {
        let b = self.popv();
        let a = self.popv();
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return self.pushv(Value::Number(x + y));
        }
        let a_is_str = self.heap.value_str(&a).is_some();
        let b_is_str = self.heap.value_str(&b).is_some();
        if a_is_str || b_is_str {
            // String concatenation; the non-string side is coerced to
            // its display form.
            let joined = format!(
                "{}{}",
                self.heap.display_value(&a),
                self.heap.display_value(&b)
            );
            let value = self.heap.string_value(&joined);
            return self.pushv(value);
        }
        Err(self.make_error(
            ExceptionKind::Type,
            format!(
                "cannot add {} and {}",
                self.type_of(&a),
                self.type_of(&b)
            ),
        ))
    }

    fn op_numeric(&mut self, op: OpCode, apply: fn(f64, f64) -> f64) -> Result<(), Value> {
        let b = self.popv();
        let a = self.popv();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.pushv(Value::Number(apply(x, y))),
            _ => Err(self.make_error(
                ExceptionKind::Type,
                format!(
                    "{} requires numbers, got {} and {}",
                    op.mnemonic(),
                    self.type_of(&a),
                    self.type_of(&b)
                ),
            )),
        }
    }

    fn op_compare(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<(), Value> {
        let b = self.popv();
        let a = self.popv();
        let ordering = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
            _ => match (self.heap.value_str(&a), self.heap.value_str(&b)) {
                (Some(x), Some(y)) => Some(x.cmp(y)),
                _ => None,
            },
        };
        match ordering {
            Some(ordering) => self.pushv(Value::Bool(accept(ordering))),
            None => Err(self.make_error(
                ExceptionKind::Type,
                format!(
                    "cannot compare {} with {}",
                    self.type_of(&a),
                    self.type_of(&b)
                ),
            )),
        }
    }

    // =========================================================================
    // SUBSCRIPTS
    // =========================================================================

    fn op_subscript_get(&mut self, target: Value, index: Value) -> Result<Value, Value> {
        let Some(r) = target.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("{} is not subscriptable", self.type_of(&target)),
            ));
        };
        // Snapshot what the bounds check needs before taking any
        // further borrows.
        enum Target {
            Array(usize),
            Str(usize),
            Map,
            Other(&'static str),
        }
        let shape = match self.heap.get(r) {
            Object::Array(items) => Target::Array(items.len()),
            Object::Str(s) => Target::Str(s.chars.chars().count()),
            Object::Map(_) => Target::Map,
            other => Target::Other(other.kind_name()),
        };
        match shape {
            Target::Array(len) => {
                let i = self.check_index(&index, len)?;
                match self.heap.get(r) {
                    Object::Array(items) => Ok(items[i].clone()),
                    _ => Ok(Value::Nil),
                }
            }
            Target::Str(count) => {
                let i = self.check_index(&index, count)?;
                let ch: String = match self.heap.get(r) {
                    Object::Str(s) => s.chars.chars().skip(i).take(1).collect(),
                    _ => String::new(),
                };
                Ok(self.heap.string_value(&ch))
            }
            Target::Map => {
                let hash = self.heap.hash_value(&index);
                let value = match self.heap.get(r) {
                    Object::Map(map) => map.get(hash, &index).cloned(),
                    _ => None,
                };
                Ok(value.unwrap_or(Value::Nil))
            }
            Target::Other(kind) => Err(self.make_error(
                ExceptionKind::Type,
                format!("{kind} is not subscriptable"),
            )),
        }
    }

    fn op_subscript_set(&mut self, target: Value, index: Value, value: Value) -> Result<(), Value> {
        let Some(r) = target.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("{} is not subscriptable", self.type_of(&target)),
            ));
        };
        // Hash before the mutable borrow of the object.
        let hash = self.heap.hash_value(&index);
        match self.heap.get_mut(r) {
            Object::Array(items) => {
                let len = items.len();
                let Some(i) = index.as_number() else {
                    return Err(self.make_error(
                        ExceptionKind::Type,
                        "array index must be a number",
                    ));
                };
                let i = i as i64;
                if i < 0 || i as usize >= len {
                    return Err(self.make_error(
                        ExceptionKind::Range,
                        format!("array index {i} out of range (length {len})"),
                    ));
                }
                items[i as usize] = value;
                Ok(())
            }
            Object::Map(map) => {
                map.insert(hash, index, value);
                Ok(())
            }
            other => {
                let kind = other.kind_name().to_string();
                Err(self.make_error(
                    ExceptionKind::Type,
                    format!("{kind} does not support subscript assignment"),
                ))
            }
        }
    }

    /// Validates a numeric index against a length.
    fn check_index(&mut self, index: &Value, len: usize) -> Result<usize, Value> {
        let Some(n) = index.as_number() else {
            return Err(self.make_error(ExceptionKind::Type, "index must be a number"));
        };
        let i = n as i64;
        if i < 0 || i as usize >= len {
            return Err(self.make_error(
                ExceptionKind::Range,
                format!("index {i} out of range (length {len})"),
            ));
        }
        Ok(i as usize)
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    /// `CALL argc`: dispatch on the callee under the arguments.
    pub(crate) fn call_value(&mut self, argc: u8) -> Result<(), Value> {
        let callee_index = self.exec_ref().stack.len() - argc as usize - 1;
        let callee = self.exec_ref().stack[callee_index].clone();
        match callee {
            Value::Function(f) => match f.kind {
                FunctionKind::Async => self.call_async(f, argc),
                FunctionKind::Generator => self.call_generator(f, argc),
                _ => self.call_function(f, argc, None),
            },
            Value::Native(native) => {
                let args: Vec<Value> = self.exec_ref().stack[callee_index + 1..].to_vec();
                self.exec().stack.truncate(callee_index);
                let result = (native.func)(self, &args);
                match result {
                    Ok(value) => {
                        // Natives may also fail by parking a pending
                        // exception and returning nil.
                        if let Some(exception) = self.pending_exception.take() {
                            return Err(exception);
                        }
                        self.pushv(value)
                    }
                    Err(exception) => Err(exception),
                }
            }
            Value::Obj(r) => match self.heap.get(r) {
                Object::BoundMethod(bound) => {
                    let receiver = bound.receiver.clone();
                    let method = bound.method.clone();
                    let defining = bound.defining_class;
                    self.exec().stack[callee_index] = receiver;
                    match method {
                        Value::Function(f) => self.call_function(f, argc, defining),
                        other => Err(self.make_error(
                            ExceptionKind::Type,
                            format!("bound method is not callable ({})", self.type_of(&other)),
                        )),
                    }
                }
                Object::Class(_) => Err(self.make_error(
                    ExceptionKind::Type,
                    "classes are instantiated with 'new'",
                )),
                other => {
                    let kind = other.kind_name().to_string();
                    Err(self.make_error(ExceptionKind::Type, format!("{kind} is not callable")))
                }
            },
            other => Err(self.make_error(
                ExceptionKind::Type,
                format!("{} is not callable", self.type_of(&other)),
            )),
        }
    }

    /// Pushes a frame for a bytecode function call.
    pub(crate) fn call_function(
        &mut self,
        function: Arc<Function>,
        argc: u8,
        class_def: Option<ObjRef>,
    ) -> Result<(), Value> {
        if argc != function.arity {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!(
                    "{} expects {} argument(s), got {argc}",
                    if function.name.is_empty() {
                        "<anonymous>"
                    } else {
                        &function.name
                    },
                    function.arity
                ),
            ));
        }
        if self.exec_ref().frames.len() >= FRAMES_MAX {
            return Err(self.make_error(ExceptionKind::Runtime, "call stack overflow"));
        }
        let base = self.exec_ref().stack.len() - argc as usize - 1;
        let mut frame = CallFrame::new(function, base);
        frame.class_def = class_def;
        self.exec().frames.push(frame);
        Ok(())
    }

    // =========================================================================
    // CLASSES
    // =========================================================================

    fn op_inherit(&mut self, class: Value, superclass: Value) -> Result<(), Value> {
        let (Some(class_ref), Some(super_ref)) = (class.as_obj(), superclass.as_obj()) else {
            return Err(self.make_error(ExceptionKind::Type, "superclass must be a class"));
        };
        if !matches!(self.heap.get(super_ref), Object::Class(_)) {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("superclass must be a class, got {}", self.type_of(&superclass)),
            ));
        }
        match self.heap.get_mut(class_ref) {
            Object::Class(object) => {
                object.superclass = Some(super_ref);
                Ok(())
            }
            _ => Err(self.make_error(ExceptionKind::Type, "INHERIT outside a class definition")),
        }
    }

    /// Walks the superclass chain for a method. Returns the method and
    /// the class it was found on.
    pub(crate) fn find_method(&self, class: ObjRef, name: &str) -> Option<(Value, ObjRef)> {
        let mut current = Some(class);
        while let Some(r) = current {
            let Object::Class(object) = self.heap.get(r) else {
                return None;
            };
            if let Some(method) = object.methods.get(name) {
                return Some((method.clone(), r));
            }
            current = object.superclass;
        }
        None
    }

    fn op_instance_new(&mut self, argc: u8) -> Result<(), Value> {
        let class_index = self.exec_ref().stack.len() - argc as usize - 1;
        let class_value = self.exec_ref().stack[class_index].clone();
        let Some(class_ref) = class_value.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("'new' requires a class, got {}", self.type_of(&class_value)),
            ));
        };
        if !matches!(self.heap.get(class_ref), Object::Class(_)) {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("'new' requires a class, got {}", self.type_of(&class_value)),
            ));
        }

        let instance = Value::Obj(self.heap.alloc(Object::Instance(InstanceObject {
            class: class_ref,
            fields: Default::default(),
        })));

        match self.find_method(class_ref, "init") {
            Some((Value::Function(init), defining)) => {
                self.exec().stack[class_index] = instance;
                self.call_function(init, argc, Some(defining))
            }
            Some((other, _)) => Err(self.make_error(
                ExceptionKind::Type,
                format!("init must be a function, got {}", self.type_of(&other)),
            )),
            None => {
                if argc != 0 {
                    return Err(self.make_error(
                        ExceptionKind::Type,
                        format!("class has no init but was given {argc} argument(s)"),
                    ));
                }
                self.exec().stack[class_index] = instance;
                Ok(())
            }
        }
    }

    fn op_invoke(&mut self, name: &str, argc: u8) -> Result<(), Value> {
        let receiver_index = self.exec_ref().stack.len() - argc as usize - 1;
        let receiver = self.exec_ref().stack[receiver_index].clone();
        let Some(r) = receiver.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("{} has no methods", self.type_of(&receiver)),
            ));
        };

        match self.heap.get(r) {
            Object::Instance(instance) => {
                // Callable fields shadow methods.
                let field = instance.fields.get(name).cloned();
                let class = instance.class;
                if let Some(field) = field {
                    self.exec().stack[receiver_index] = field;
                    return self.call_value(argc);
                }
                match self.find_method(class, name) {
                    Some((Value::Function(method), defining)) => {
                        self.call_function(method, argc, Some(defining))
                    }
                    Some((Value::Native(native), _)) => {
                        let value = Value::Native(native);
                        self.exec().stack[receiver_index] = value;
                        self.call_value(argc)
                    }
                    _ => Err(self.make_error(
                        ExceptionKind::Type,
                        format!("undefined method '{name}'"),
                    )),
                }
            }
            Object::Map(_) => {
                let key = self.heap.string_value(name);
                let hash = self.heap.hash_value(&key);
                let callee = match self.heap.get(r) {
                    Object::Map(map) => map.get(hash, &key).cloned(),
                    _ => None,
                };
                match callee {
                    // A callable entry shadows the map primitives, which
                    // is what makes module export maps callable
                    // namespaces.
                    Some(callee) => {
                        self.exec().stack[receiver_index] = callee;
                        self.call_value(argc)
                    }
                    None => {
                        let exec = self.exec();
                        let args: Vec<Value> = exec.stack.drain(receiver_index + 1..).collect();
                        exec.stack.pop();
                        let result = self.map_builtin(r, name, &args)?;
                        self.pushv(result)
                    }
                }
            }
            _ => self.invoke_builtin(receiver, name, argc),
        }
    }

    fn op_get_property(&mut self, target: &Value, name: &str) -> Result<Value, Value> {
        let Some(r) = target.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("{} has no properties", self.type_of(target)),
            ));
        };
        match self.heap.get(r) {
            Object::Instance(instance) => {
                let field = instance.fields.get(name).cloned();
                let class = instance.class;
                if let Some(value) = field {
                    return Ok(value);
                }
                match self.find_method(class, name) {
                    Some((method, defining)) => {
                        Ok(Value::Obj(self.heap.alloc(Object::BoundMethod(
                            BoundMethodObject {
                                receiver: target.clone(),
                                method,
                                defining_class: Some(defining),
                            },
                        ))))
                    }
                    None => Err(self.make_error(
                        ExceptionKind::Reference,
                        format!("undefined property '{name}'"),
                    )),
                }
            }
            Object::Map(_) => {
                let key = self.heap.string_value(name);
                let hash = self.heap.hash_value(&key);
                let value = match self.heap.get(r) {
                    Object::Map(map) => map.get(hash, &key).cloned(),
                    _ => None,
                };
                Ok(value.unwrap_or(Value::Nil))
            }
            Object::Str(s) => match name {
                "length" => Ok(Value::Number(s.chars.chars().count() as f64)),
                _ => Err(self.make_error(
                    ExceptionKind::Reference,
                    format!("string has no property '{name}'"),
                )),
            },
            Object::Array(items) => match name {
                "length" => Ok(Value::Number(items.len() as f64)),
                _ => Err(self.make_error(
                    ExceptionKind::Reference,
                    format!("array has no property '{name}'"),
                )),
            },
            Object::Set(set) => match name {
                "length" => Ok(Value::Number(set.len() as f64)),
                _ => Err(self.make_error(
                    ExceptionKind::Reference,
                    format!("set has no property '{name}'"),
                )),
            },
            Object::Exception(exception) => {
                // Snapshot before allocating the result; the heap borrow
                // must not overlap the alloc.
                let message = exception.message.clone();
                let type_name = exception.type_name.clone();
                let line = exception.line;
                let file = exception.file.clone();
                let cause = exception.cause.clone();
                let suppressed = exception.suppressed.clone();
                let rendered = exception.render_trace();
                match name {
                    "message" => Ok(self.heap.string_value(&message)),
                    "type" => Ok(self.heap.string_value(&type_name)),
                    "line" => Ok(Value::Number(line as f64)),
                    "file" => Ok(self.heap.string_value(&file)),
                    "cause" => Ok(cause.unwrap_or(Value::Nil)),
                    "suppressed" => {
                        Ok(Value::Obj(self.heap.alloc(Object::Array(suppressed))))
                    }
                    "stack" => Ok(self.heap.string_value(&rendered)),
                    _ => Err(self.make_error(
                        ExceptionKind::Reference,
                        format!("exception has no property '{name}'"),
                    )),
                }
            }
            Object::Generator(generator) => match name {
                "done" => Ok(Value::Bool(
                    generator.state == crate::value::GeneratorState::Done,
                )),
                _ => Err(self.make_error(
                    ExceptionKind::Reference,
                    format!("generator has no property '{name}'"),
                )),
            },
            other => Err(self.make_error(
                ExceptionKind::Type,
                format!("{} has no properties", other.kind_name()),
            )),
        }
    }

    fn op_set_property(&mut self, target: &Value, name: &str, value: Value) -> Result<(), Value> {
        let Some(r) = target.as_obj() else {
            return Err(self.make_error(
                ExceptionKind::Type,
                format!("{} has no properties", self.type_of(target)),
            ));
        };
        let key = self.heap.string_value(name);
        let hash = self.heap.hash_value(&key);
        match self.heap.get_mut(r) {
            Object::Instance(instance) => {
                instance.fields.insert(name.to_string(), value);
                Ok(())
            }
            Object::Map(map) => {
                map.insert(hash, key, value);
                Ok(())
            }
            other => {
                let kind = other.kind_name().to_string();
                Err(self.make_error(
                    ExceptionKind::Type,
                    format!("cannot assign properties on {kind}"),
                ))
            }
        }
    }

    fn op_get_super(&mut self, receiver: Value, name: &str) -> Result<Value, Value> {
        let Some(class_def) = self.frame().class_def else {
            return Err(self.make_error(
                ExceptionKind::Runtime,
                "'super' outside of a method",
            ));
        };
        let superclass = match self.heap.get(class_def) {
            Object::Class(object) => object.superclass,
            _ => None,
        };
        let Some(superclass) = superclass else {
            return Err(self.make_error(
                ExceptionKind::Runtime,
                "class has no superclass",
            ));
        };
        match self.find_method(superclass, name) {
            Some((method, defining)) => Ok(Value::Obj(self.heap.alloc(Object::BoundMethod(
                BoundMethodObject {
                    receiver,
                    method,
                    defining_class: Some(defining),
                },
            )))),
            None => Err(self.make_error(
                ExceptionKind::Reference,
                format!("undefined superclass method '{name}'"),
            )),
        }
    }

    // =========================================================================
    // REGEX
    // =========================================================================

    fn expect_string(&mut self, value: &Value, what: &str) -> Result<String, Value> {
        match self.heap.value_str(value) {
            Some(s) => Ok(s.to_string()),
            None => Err(self.make_error(
                ExceptionKind::Type,
                format!("{what} must be a string, got {}", self.type_of(value)),
            )),
        }
    }

    fn expect_regex(&mut self, value: &Value) -> Result<ObjRef, Value> {
        match value.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Regex(_)) => Ok(r),
            _ => Err(self.make_error(
                ExceptionKind::Type,
                format!("expected a regex, got {}", self.type_of(value)),
            )),
        }
    }

    fn op_regex_new(&mut self, pattern: Value, flags: Value) -> Result<Value, Value> {
        let pattern = self.expect_string(&pattern, "regex pattern")?;
        let flags = self.expect_string(&flags, "regex flags")?;

        let mut prefix = String::new();
        for flag in flags.chars() {
            match flag {
                'i' => prefix.push_str("(?i)"),
                'm' => prefix.push_str("(?m)"),
                's' => prefix.push_str("(?s)"),
                other => {
                    return Err(self.make_error(
                        ExceptionKind::Syntax,
                        format!("unsupported regex flag '{other}'"),
                    ));
                }
            }
        }

        match regex::Regex::new(&format!("{prefix}{pattern}")) {
            Ok(compiled) => Ok(Value::Obj(self.heap.alloc(Object::Regex(RegexObject {
                pattern,
                flags,
                compiled,
                last_groups: None,
            })))),
            Err(error) => Err(self.make_error(
                ExceptionKind::Syntax,
                format!("invalid regex: {error}"),
            )),
        }
    }

    fn op_regex_test(&mut self, regex: Value, text: Value) -> Result<Value, Value> {
        let r = self.expect_regex(&regex)?;
        let text = self.expect_string(&text, "regex subject")?;
        let Object::Regex(object) = self.heap.get(r) else {
            unreachable!();
        };
        Ok(Value::Bool(object.compiled.is_match(&text)))
    }

    fn op_regex_match(&mut self, regex: Value, text: Value) -> Result<Value, Value> {
        let r = self.expect_regex(&regex)?;
        let text = self.expect_string(&text, "regex subject")?;
        let Object::Regex(object) = self.heap.get(r) else {
            unreachable!();
        };
        let captures = object.compiled.captures(&text);
        let groups: Option<Vec<Option<String>>> = captures.map(|caps| {
            (0..caps.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
                .collect()
        });

        if let Object::Regex(object) = self.heap.get_mut(r) {
            object.last_groups = groups.clone();
        }

        match groups {
            Some(groups) => {
                let values: Vec<Value> = groups
                    .into_iter()
                    .map(|group| match group {
                        Some(text) => self.heap.string_value(&text),
                        None => Value::Nil,
                    })
                    .collect();
                Ok(Value::Obj(self.heap.alloc(Object::Array(values))))
            }
            None => Ok(Value::Nil),
        }
    }

    fn op_regex_replace(
        &mut self,
        regex: Value,
        text: Value,
        replacement: Value,
    ) -> Result<Value, Value> {
        let r = self.expect_regex(&regex)?;
        let text = self.expect_string(&text, "regex subject")?;
        let replacement = self.expect_string(&replacement, "replacement")?;
        let Object::Regex(object) = self.heap.get(r) else {
            unreachable!();
        };
        let replaced = object
            .compiled
            .replace_all(&text, replacement.as_str())
            .to_string();
        Ok(self.heap.string_value(&replaced))
    }

    fn op_regex_split(&mut self, regex: Value, text: Value) -> Result<Value, Value> {
        let r = self.expect_regex(&regex)?;
        let text = self.expect_string(&text, "regex subject")?;
        let Object::Regex(object) = self.heap.get(r) else {
            unreachable!();
        };
        let parts: Vec<String> = object.compiled.split(&text).map(String::from).collect();
        let values: Vec<Value> = parts
            .into_iter()
            .map(|part| self.heap.string_value(&part))
            .collect();
        Ok(Value::Obj(self.heap.alloc(Object::Array(values))))
    }

    // =========================================================================
    // AWAIT
    // =========================================================================

    /// `AWAIT`: resolve immediately, throw on rejection, or report the
    /// pending promise to suspend on.
    fn op_await(&mut self, awaited: Value) -> Result<Option<ObjRef>, Value> {
        if self.exec_ref().kind != crate::frame::ExecKind::Async {
            return Err(self.make_error(
                ExceptionKind::Runtime,
                "'await' outside of an async function",
            ));
        }
        let Some(r) = awaited.as_obj() else {
            // Awaiting a plain value resolves to it.
            self.pushv(awaited)?;
            return Ok(None);
        };
        match self.heap.get(r) {
            Object::Promise(promise) => match &promise.state {
                PromiseState::Resolved(value) => {
                    let value = value.clone();
                    self.pushv(value)?;
                    Ok(None)
                }
                PromiseState::Rejected(value) => Err(value.clone()),
                PromiseState::Pending => Ok(Some(r)),
            },
            _ => {
                self.pushv(awaited)?;
                Ok(None)
            }
        }
    }
}
