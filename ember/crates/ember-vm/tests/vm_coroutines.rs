//! Cooperative coroutines: generators parked at YIELD, async functions
//! parked at AWAIT, and host-driven promise settlement.

mod common;

use common::{eval_ok, take_output, top_number, vm_with_output};
use ember_vm::{ExecStatus, Value, Vm};

#[test]
fn test_generator_yields_in_sequence() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "fn counter() { yield 1\nyield 2\nyield 3 }\n\
         g = counter()\n\
         print(g.next())\nprint(g.next())\nprint(g.next())\nprint(g.next())\nprint(g.done())",
    );
    assert_eq!(take_output(&output), "1\n2\n3\nnil\ntrue\n");
}

#[test]
fn test_generator_body_runs_lazily() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "fn gen() { print(\"started\")\nyield 1 }\n\
         g = gen()\nprint(\"created\")\ng.next()",
    );
    // Nothing runs until the first next().
    assert_eq!(take_output(&output), "created\nstarted\n");
}

#[test]
fn test_generator_with_loop_state() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "fn squares(n) { i = 1\nwhile (i <= n) { yield i * i\ni = i + 1 } }\n\
         g = squares(4)\ng.next() + g.next() + g.next() + g.next()",
    );
    assert_eq!(top_number(&mut vm), 30.0);
}

#[test]
fn test_generator_throw_propagates_to_caller() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "fn bad() { yield 1\nthrow \"mid-stream\" }\n\
         g = bad()\ng.next()\n\
         try { g.next() } catch (e) { print(e) }\nprint(g.done())",
    );
    assert_eq!(take_output(&output), "mid-stream\ntrue\n");
}

#[test]
fn test_async_function_immediate_completion() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "async fn quick() { return 5 }\np = quick()\np");
    let promise = vm.pop_result().expect("promise on stack");
    match vm.promise_result(&promise) {
        Ok(Some(Value::Number(n))) => assert_eq!(n, 5.0),
        other => panic!("expected resolved 5, got {other:?}"),
    }
}

#[test]
fn test_await_resolved_promise_continues_inline() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "async fn inner() { return 10 }\n\
         async fn outer() { x = await inner()\nreturn x + 1 }\n\
         p = outer()\np",
    );
    let promise = vm.pop_result().unwrap();
    match vm.promise_result(&promise) {
        Ok(Some(Value::Number(n))) => assert_eq!(n, 11.0),
        other => panic!("expected resolved 11, got {other:?}"),
    }
}

#[test]
fn test_await_pending_promise_suspends_until_host_resolves() {
    let mut vm = Vm::new();
    let pending = vm.promise_pending();
    vm.set_global("slot", pending.clone());

    eval_ok(&mut vm, "async fn waiter() { v = await slot\nreturn v * 2 }\np = waiter()\np");
    let result = vm.pop_result().unwrap();

    // Still pending: the async body is parked at its await.
    assert!(matches!(vm.promise_result(&result), Ok(None)));

    vm.resolve_promise(&pending, Value::Number(21.0));
    match vm.promise_result(&result) {
        Ok(Some(Value::Number(n))) => assert_eq!(n, 42.0),
        other => panic!("expected resolved 42, got {other:?}"),
    }
}

#[test]
fn test_rejection_throws_at_await_site() {
    let (mut vm, output) = vm_with_output();
    let pending = vm.promise_pending();
    vm.set_global("slot", pending.clone());

    eval_ok(
        &mut vm,
        "async fn waiter() {\n\
         try { await slot } catch (e) { print(\"caught \" + e)\nreturn 0 }\n\
         return 1\n\
         }\n\
         p = waiter()\np",
    );
    let result = vm.pop_result().unwrap();
    assert!(matches!(vm.promise_result(&result), Ok(None)));

    let boom = vm.make_string("boom");
    vm.reject_promise(&pending, boom);
    assert_eq!(take_output(&output), "caught boom\n");
    match vm.promise_result(&result) {
        Ok(Some(Value::Number(n))) => assert_eq!(n, 0.0),
        other => panic!("expected resolved 0, got {other:?}"),
    }
}

#[test]
fn test_unhandled_rejection_rejects_the_callers_promise() {
    let mut vm = Vm::new();
    let pending = vm.promise_pending();
    vm.set_global("slot", pending.clone());

    eval_ok(&mut vm, "async fn waiter() { return await slot }\np = waiter()\np");
    let result = vm.pop_result().unwrap();

    let failure = vm.make_string("network down");
    vm.reject_promise(&pending, failure);
    match vm.promise_result(&result) {
        Err(exception) => {
            assert_eq!(vm.heap().value_str(&exception), Some("network down"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn test_chained_async_functions_cascade() {
    let mut vm = Vm::new();
    let pending = vm.promise_pending();
    vm.set_global("slot", pending.clone());

    eval_ok(
        &mut vm,
        "async fn a() { return await slot }\n\
         async fn b() { x = await a()\nreturn x + 1 }\n\
         async fn c() { x = await b()\nreturn x + 1 }\n\
         p = c()\np",
    );
    let result = vm.pop_result().unwrap();
    assert!(matches!(vm.promise_result(&result), Ok(None)));

    vm.resolve_promise(&pending, Value::Number(40.0));
    match vm.promise_result(&result) {
        Ok(Some(Value::Number(n))) => assert_eq!(n, 42.0),
        other => panic!("expected resolved 42, got {other:?}"),
    }
}

#[test]
fn test_await_outside_async_is_a_compile_error() {
    let mut vm = Vm::new();
    assert_eq!(vm.eval("fn f(p) { return await p }"), ExecStatus::CompileError);
}

#[test]
fn test_await_plain_value_resolves_to_it() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "async fn f() { return (await 7) + 1 }\np = f()\np");
    let promise = vm.pop_result().unwrap();
    match vm.promise_result(&promise) {
        Ok(Some(Value::Number(n))) => assert_eq!(n, 8.0),
        other => panic!("expected resolved 8, got {other:?}"),
    }
}
