//! Native callables and the core set every interpreter starts with.
//!
//! A native is a plain function pointer: no closures, so instances stay
//! `Send` and a pool can move them between worker threads. Failure is
//! signaled by returning the exception value as the `Err` arm; the VM
//! treats it as an implicit throw at the call site. A native may instead
//! park an exception in the VM's pending slot and return nil - the VM
//! checks the slot after every native call.
//!
//! The core set is deliberately small: the VM's own primitives
//! (`print`, `clock`, `type`, `len`, `str`, `set`, `assert`), the error
//! constructors for the exception taxonomy, and the two hidden hooks
//! the compiler lowers module syntax onto (`__import`, `__export`).

use crate::exception::ExceptionKind;
use crate::value::{Object, Value, ValueSet};
use crate::vm::Vm;

/// Result of a native call: a value, or an exception to throw.
pub type NativeResult = Result<Value, Value>;

/// The native calling convention.
pub type NativeFn = fn(&mut Vm, &[Value]) -> NativeResult;

/// A named native callable.
#[derive(Debug)]
pub struct NativeFunction {
    /// Name as bound in globals (shown in traces).
    pub name: String,
    /// The function pointer.
    pub func: NativeFn,
}

/// Installs the core natives into a VM's globals.
pub fn install_core(vm: &mut Vm) {
    vm.register_func("print", native_print);
    vm.register_func("clock", native_clock);
    vm.register_func("type", native_type);
    vm.register_func("len", native_len);
    vm.register_func("str", native_str);
    vm.register_func("set", native_set);
    vm.register_func("assert", native_assert);
    vm.register_func("__import", native_import);
    vm.register_func("__export", native_export);

    // The error taxonomy, constructible from scripts:
    // `throw TypeError("bad operand")`.
    vm.register_func("Error", |vm, args| make_exception(vm, ExceptionKind::Error, args));
    vm.register_func("TypeError", |vm, args| make_exception(vm, ExceptionKind::Type, args));
    vm.register_func("RuntimeError", |vm, args| {
        make_exception(vm, ExceptionKind::Runtime, args)
    });
    vm.register_func("SyntaxError", |vm, args| {
        make_exception(vm, ExceptionKind::Syntax, args)
    });
    vm.register_func("ReferenceError", |vm, args| {
        make_exception(vm, ExceptionKind::Reference, args)
    });
    vm.register_func("RangeError", |vm, args| {
        make_exception(vm, ExceptionKind::Range, args)
    });
    vm.register_func("MemoryError", |vm, args| {
        make_exception(vm, ExceptionKind::Memory, args)
    });
    vm.register_func("SecurityError", |vm, args| {
        make_exception(vm, ExceptionKind::Security, args)
    });
    vm.register_func("IOError", |vm, args| make_exception(vm, ExceptionKind::Io, args));
    vm.register_func("NetworkError", |vm, args| {
        make_exception(vm, ExceptionKind::Network, args)
    });
    vm.register_func("TimeoutError", |vm, args| {
        make_exception(vm, ExceptionKind::Timeout, args)
    });
    vm.register_func("AssertionError", |vm, args| {
        make_exception(vm, ExceptionKind::Assertion, args)
    });
}

fn make_exception(vm: &mut Vm, kind: ExceptionKind, args: &[Value]) -> NativeResult {
    let message = args
        .first()
        .map(|value| vm.heap.display_value(value))
        .unwrap_or_default();
    let exception = vm.make_error(kind, message);
    // Optional second argument chains a cause.
    if let (Some(cause), Some(r)) = (args.get(1), exception.as_obj()) {
        if let Object::Exception(object) = vm.heap.get_mut(r) {
            object.cause = Some(cause.clone());
        }
    }
    Ok(exception)
}

fn native_print(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let line = args
        .iter()
        .map(|value| vm.heap.display_value(value))
        .collect::<Vec<_>>()
        .join(" ");
    vm.output.write_line(&line);
    Ok(Value::Nil)
}

fn native_clock(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(Value::Number(vm.start_time.elapsed().as_secs_f64()))
}

fn native_type(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let name = match args.first() {
        Some(Value::Obj(r)) => vm.heap.get(*r).kind_name(),
        Some(other) => other.type_name(),
        None => "nil",
    };
    Ok(vm.heap.string_value(name))
}

fn native_len(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let length = match args.first() {
        Some(Value::Obj(r)) => match vm.heap.get(*r) {
            Object::Str(s) => Some(s.chars.chars().count()),
            Object::Array(items) => Some(items.len()),
            Object::Map(map) => Some(map.len()),
            Object::Set(set) => Some(set.len()),
            _ => None,
        },
        _ => None,
    };
    match length {
        Some(length) => Ok(Value::Number(length as f64)),
        None => {
            let type_name = args
                .first()
                .map(|v| vm.heap.display_value(v))
                .unwrap_or_default();
            Err(vm.make_error(
                ExceptionKind::Type,
                format!("len() requires a string or collection, got {type_name}"),
            ))
        }
    }
}

fn native_str(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let rendered = args
        .first()
        .map(|value| vm.heap.display_value(value))
        .unwrap_or_default();
    Ok(vm.heap.string_value(&rendered))
}

fn native_set(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let mut set = ValueSet::new();
    if let Some(Value::Obj(r)) = args.first() {
        if let Object::Array(items) = vm.heap.get(*r) {
            let items = items.clone();
            for item in items {
                let hash = vm.heap.hash_value(&item);
                set.add(hash, item);
            }
        }
    }
    Ok(Value::Obj(vm.heap.alloc(Object::Set(set))))
}

fn native_assert(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let passed = args.first().map(Value::is_truthy).unwrap_or(false);
    if passed {
        return Ok(Value::Nil);
    }
    let message = match args.get(1) {
        Some(value) => vm.heap.display_value(value),
        None => "assertion failed".to_string(),
    };
    Err(vm.make_error(ExceptionKind::Assertion, message))
}

/// The hook `import` statements lower to.
fn native_import(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let Some(name) = args.first().and_then(|v| vm.heap.value_str(v)).map(String::from) else {
        return Err(vm.make_error(ExceptionKind::Type, "import requires a module name string"));
    };
    vm.import_module_value(&name)
}

/// The hook `export` declarations lower to.
fn native_export(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let Some(name) = args.first().and_then(|v| vm.heap.value_str(v)).map(String::from) else {
        return Err(vm.make_error(ExceptionKind::Type, "export requires a name string"));
    };
    let value = args.get(1).cloned().unwrap_or(Value::Nil);
    vm.export_value(&name, value);
    Ok(Value::Nil)
}
