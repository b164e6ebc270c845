//! GC behavior through the full VM: garbage is reclaimed, live data
//! survives, cycles don't leak, and stress-mode collection at every
//! allocation point doesn't change program results.

mod common;

use common::{eval_ok, stress_vm, take_output, top_number, top_string};
use ember_vm::{GcConfig, Value, Vm};

#[test]
fn test_garbage_is_reclaimed() {
    let mut vm = Vm::with_config(GcConfig {
        // A tiny threshold so collections actually trigger in-test.
        initial_next_gc: 4 * 1024,
        ..Default::default()
    });
    eval_ok(
        &mut vm,
        "for (i = 0; i < 5000; i = i + 1) { tmp = [i, i + 1, i + 2] }",
    );
    assert!(
        vm.gc_stats().collections > 0,
        "allocation churn should have triggered collections"
    );

    // Only the last array is reachable; collection bounds the heap.
    vm.collect_now();
    let live_after = vm.live_objects();
    assert!(
        live_after < 200,
        "heap should be near-empty after churn, {live_after} objects live"
    );
}

#[test]
fn test_reachable_values_survive_collection() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "keep = [1, 2, 3]\nname = \"precious\"");
    vm.collect_now();
    vm.collect_now();

    eval_ok(&mut vm, "keep[0] + keep[1] + keep[2]");
    assert_eq!(top_number(&mut vm), 6.0);
    eval_ok(&mut vm, "name");
    assert_eq!(top_string(&mut vm), "precious");
}

#[test]
fn test_cycles_are_collected() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "cyc = {}\ncyc[\"self\"] = cyc\nring = [nil]\nring[0] = ring",
    );
    vm.collect_now();
    let live_with_cycles = vm.live_objects();

    // Drop the only external references; the cycles must die.
    eval_ok(&mut vm, "cyc = nil\nring = nil");
    vm.collect_now();
    assert!(
        vm.live_objects() < live_with_cycles,
        "cyclic garbage survived collection"
    );
}

#[test]
fn test_instances_keep_their_class_alive() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "class Node { fn init(v) { this.v = v\nthis.next = nil } }\n\
         head = new Node(1)\nhead.next = new Node(2)\nhead.next.next = head",
    );
    vm.collect_now();
    eval_ok(&mut vm, "head.next.v");
    assert_eq!(top_number(&mut vm), 2.0);

    // Cut the root; the instance cycle and nothing else should go.
    eval_ok(&mut vm, "Node = nil\nhead = nil");
    let before = vm.live_objects();
    vm.collect_now();
    assert!(vm.live_objects() < before);
}

#[test]
fn test_stress_mode_preserves_results() {
    let (mut vm, output) = stress_vm();
    eval_ok(
        &mut vm,
        "fn fib(n) { if (n < 2) return n\nreturn fib(n - 1) + fib(n - 2) }\n\
         print(fib(10))\n\
         parts = \"a,b,c\".split(\",\")\n\
         print(parts.join(\"-\"))\n\
         m = { x: 1 }\nm[\"y\"] = 2\nprint(m.len())",
    );
    assert_eq!(take_output(&output), "55\na-b-c\n2\n");
    assert!(vm.gc_stats().collections > 0);
}

#[test]
fn test_stress_mode_exceptions_and_classes() {
    let (mut vm, output) = stress_vm();
    eval_ok(
        &mut vm,
        "class A { fn init() { this.tag = \"a\" } fn who() { return this.tag } }\n\
         try { throw new A().who() } catch (e) { print(e) } finally { print(\"done\") }",
    );
    assert_eq!(take_output(&output), "a\ndone\n");
}

#[test]
fn test_stress_mode_unbound_generator_survives_resume() {
    let (mut vm, output) = stress_vm();
    // The generator is never bound to a variable, so during next() the
    // only thing keeping it alive is the VM's coroutine pin.
    eval_ok(
        &mut vm,
        "fn gen() { yield \"a\"\nyield \"b\" }\nprint(gen().next())",
    );
    assert_eq!(take_output(&output), "a\n");
}

#[test]
fn test_interned_strings_stable_across_collections() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "a = \"stable\"");
    vm.collect_now();
    eval_ok(&mut vm, "b = \"stable\"\na == b");
    assert!(matches!(vm.pop_result(), Some(Value::Bool(true))));
}

#[test]
fn test_bytes_accounting_moves_both_ways() {
    let mut vm = Vm::new();
    let baseline = vm.heap().bytes_allocated();
    eval_ok(&mut vm, "big = []\nfor (i = 0; i < 1000; i = i + 1) { big.push([i]) }");
    let grown = vm.heap().bytes_allocated();
    assert!(grown > baseline);

    eval_ok(&mut vm, "big = nil");
    vm.collect_now();
    assert!(vm.heap().bytes_allocated() < grown);
}
