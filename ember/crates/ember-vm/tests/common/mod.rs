//! Shared fixtures for the VM integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ember_vm::{ExecStatus, GcConfig, Value, Vm};

/// A VM with `print` captured into a buffer.
pub fn vm_with_output() -> (Vm, Arc<Mutex<String>>) {
    let mut vm = Vm::new();
    let output = vm.capture_output();
    (vm, output)
}

/// A VM that collects at every allocation point, with output captured.
pub fn stress_vm() -> (Vm, Arc<Mutex<String>>) {
    let mut vm = Vm::with_config(GcConfig {
        stress: true,
        ..Default::default()
    });
    let output = vm.capture_output();
    (vm, output)
}

/// Evaluates source, asserting success.
pub fn eval_ok(vm: &mut Vm, source: &str) {
    let status = vm.eval(source);
    assert_eq!(
        status,
        ExecStatus::Success,
        "eval failed for:\n{source}\npending: {:?}",
        vm.pending_exception_trace()
    );
}

/// Evaluates source, asserting it fails with the given status.
pub fn eval_err(vm: &mut Vm, source: &str, expected: ExecStatus) {
    let status = vm.eval(source);
    assert_eq!(status, expected, "unexpected status for:\n{source}");
}

/// The number on top of the stack after the last eval.
pub fn top_number(vm: &mut Vm) -> f64 {
    match vm.pop_result() {
        Some(Value::Number(n)) => n,
        other => panic!("expected number on stack, got {other:?}"),
    }
}

/// The string on top of the stack after the last eval.
pub fn top_string(vm: &mut Vm) -> String {
    let value = vm.pop_result().expect("stack is empty");
    match vm.heap().value_str(&value) {
        Some(s) => s.to_string(),
        None => panic!("expected string on stack, got {value:?}"),
    }
}

/// The boolean on top of the stack after the last eval.
pub fn top_bool(vm: &mut Vm) -> bool {
    match vm.pop_result() {
        Some(Value::Bool(b)) => b,
        other => panic!("expected bool on stack, got {other:?}"),
    }
}

/// Drains the captured output buffer.
pub fn take_output(buffer: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap())
}
