//! End-to-end evaluation tests: expressions, control flow, functions,
//! classes, collections, and the stack-discipline guarantees embedders
//! rely on.

mod common;

use common::{eval_err, eval_ok, take_output, top_bool, top_number, top_string, vm_with_output};
use ember_vm::{ExecStatus, Value, Vm};

#[test]
fn test_arithmetic_leaves_result_on_stack() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "((10 + 5) * 2) - (3 + 7)");
    assert_eq!(top_number(&mut vm), 20.0);
}

#[test]
fn test_non_final_statements_leave_stack_empty() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "x = 1\ny = 2\nprint(x + y)");
    // print is not an expression statement whose value is retained: the
    // final statement's call result is. It evaluates to nil.
    assert!(matches!(vm.pop_result(), Some(Value::Nil)));
    assert!(vm.pop_result().is_none(), "stack must be empty");
}

#[test]
fn test_for_loop_with_break_prints_prefix() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "for (i = 0; i < 10; i = i + 1) { if (i == 4) break; print(i) }",
    );
    assert_eq!(take_output(&output), "0\n1\n2\n3\n");
}

#[test]
fn test_continue_skips_iterations() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "for (i = 0; i < 6; i = i + 1) { if (i % 2 == 1) continue; print(i) }",
    );
    assert_eq!(take_output(&output), "0\n2\n4\n");
}

#[test]
fn test_while_loop() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "total = 0\nn = 1\nwhile (n <= 10) { total = total + n\nn = n + 1 }\ntotal");
    assert_eq!(top_number(&mut vm), 55.0);
}

#[test]
fn test_function_call_and_recursion() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "fn fib(n) { if (n < 2) return n\nreturn fib(n - 1) + fib(n - 2) }\nfib(12)",
    );
    assert_eq!(top_number(&mut vm), 144.0);
}

#[test]
fn test_call_api_leaves_result_on_stack() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "fn add(a, b) { return a + b }");
    let status = vm.call("add", &[Value::Number(2.0), Value::Number(40.0)]);
    assert_eq!(status, ExecStatus::Success);
    assert_eq!(top_number(&mut vm), 42.0);
}

#[test]
fn test_call_undefined_function_fails() {
    let mut vm = Vm::new();
    let status = vm.call("missing", &[]);
    assert_eq!(status, ExecStatus::RuntimeError);
    assert!(vm.take_pending_exception().is_some());
}

#[test]
fn test_registered_native_is_callable() {
    let mut vm = Vm::new();
    vm.register_func("double", |_vm, args| {
        let n = args.first().and_then(Value::as_number).unwrap_or(0.0);
        Ok(Value::Number(n * 2.0))
    });
    eval_ok(&mut vm, "double(21)");
    assert_eq!(top_number(&mut vm), 42.0);
}

#[test]
fn test_arity_mismatch_is_a_type_error() {
    let mut vm = Vm::new();
    eval_err(
        &mut vm,
        "fn two(a, b) { return a }\ntwo(1)",
        ExecStatus::RuntimeError,
    );
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("TypeError"), "{trace}");
}

#[test]
fn test_undefined_variable_is_a_reference_error() {
    let mut vm = Vm::new();
    eval_err(&mut vm, "nope + 1", ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("ReferenceError"), "{trace}");
    assert!(trace.contains("nope"), "{trace}");
}

#[test]
fn test_string_concat_and_coercion() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "\"answer: \" + 42");
    assert_eq!(top_string(&mut vm), "answer: 42");
}

#[test]
fn test_string_interpolation() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "name = \"world\"\n\"hello ${name}, ${1 + 1} times\"");
    assert_eq!(top_string(&mut vm), "hello world, 2 times");
}

#[test]
fn test_interpolation_with_bad_expression_throws_syntax_error() {
    let mut vm = Vm::new();
    eval_err(&mut vm, "\"broken ${)}\"", ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("SyntaxError"), "{trace}");
}

#[test]
fn test_string_builtin_methods() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "\"Hello World\".substring(6, 11)");
    assert_eq!(top_string(&mut vm), "World");

    eval_ok(&mut vm, "\"a,b,c\".split(\",\").len()");
    assert_eq!(top_number(&mut vm), 3.0);

    eval_ok(&mut vm, "\"ember\".upper()");
    assert_eq!(top_string(&mut vm), "EMBER");
}

#[test]
fn test_array_literal_and_subscript() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "a = [10, 20, 30]\na[1]");
    assert_eq!(top_number(&mut vm), 20.0);

    eval_ok(&mut vm, "a[1] = 25\na[1]");
    assert_eq!(top_number(&mut vm), 25.0);

    eval_ok(&mut vm, "a.push(40)\na.len()");
    assert_eq!(top_number(&mut vm), 4.0);
}

#[test]
fn test_array_index_out_of_range() {
    let mut vm = Vm::new();
    eval_err(&mut vm, "a = [1]\na[5]", ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("RangeError"), "{trace}");
}

#[test]
fn test_map_literal_subscript_and_methods() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "m = { a: 1, \"b\": 2 }\nm[\"a\"] + m[\"b\"]");
    assert_eq!(top_number(&mut vm), 3.0);

    eval_ok(&mut vm, "m[\"c\"] = 3\nm.len()");
    assert_eq!(top_number(&mut vm), 3.0);

    eval_ok(&mut vm, "m.delete(\"a\")\nm.has(\"a\")");
    assert!(!top_bool(&mut vm));

    eval_ok(&mut vm, "m[\"missing\"]");
    assert!(matches!(vm.pop_result(), Some(Value::Nil)));
}

#[test]
fn test_map_insert_then_get_laws() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "m = {}\n\
         for (i = 0; i < 200; i = i + 1) { m[i] = i * 2 }\n\
         for (i = 0; i < 100; i = i + 1) { m.delete(i) }\n\
         m.len()",
    );
    assert_eq!(top_number(&mut vm), 100.0);

    eval_ok(&mut vm, "m[150]");
    assert_eq!(top_number(&mut vm), 300.0);

    eval_ok(&mut vm, "m[50]");
    assert!(matches!(vm.pop_result(), Some(Value::Nil)));
}

#[test]
fn test_set_algebra() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "a = set([1, 2, 3, 4])\nb = set([3, 4, 5])\n\
         a.union(b).len() + a.intersection(b).len() * 10 + a.difference(b).len() * 100",
    );
    // union 5, intersection 2, difference 2.
    assert_eq!(top_number(&mut vm), 225.0);
}

#[test]
fn test_iterator_protocol() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "it = [1, 2, 3].iter()\nwhile (!it.done()) { print(it.next()) }",
    );
    assert_eq!(take_output(&output), "1\n2\n3\n");
}

#[test]
fn test_classes_init_fields_methods() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "class Point {\n\
         fn init(x, y) { this.x = x\nthis.y = y }\n\
         fn sum() { return this.x + this.y }\n\
         }\n\
         p = new Point(3, 4)\np.sum()",
    );
    assert_eq!(top_number(&mut vm), 7.0);

    eval_ok(&mut vm, "p.x = 30\np.sum()");
    assert_eq!(top_number(&mut vm), 34.0);
}

#[test]
fn test_inheritance_and_super() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "class Animal {\n\
         fn init(name) { this.name = name }\n\
         fn speak() { return this.name + \" makes a sound\" }\n\
         }\n\
         class Dog extends Animal {\n\
         fn speak() { return super.speak() + \": woof\" }\n\
         }\n\
         d = new Dog(\"rex\")\nd.speak()",
    );
    assert_eq!(top_string(&mut vm), "rex makes a sound: woof");
}

#[test]
fn test_bound_method_values() {
    let mut vm = Vm::new();
    eval_ok(
        &mut vm,
        "class Counter {\n\
         fn init() { this.n = 0 }\n\
         fn bump() { this.n = this.n + 1\nreturn this.n }\n\
         }\n\
         c = new Counter()\nf = c.bump\nf()\nf()",
    );
    assert_eq!(top_number(&mut vm), 2.0);
}

#[test]
fn test_switch_dispatch_and_fallthrough() {
    let (mut vm, output) = vm_with_output();
    eval_ok(
        &mut vm,
        "x = 2\n\
         switch (x) {\n\
         case 1: print(\"one\")\nbreak\n\
         case 2: print(\"two\")\n\
         case 3: print(\"three\")\nbreak\n\
         default: print(\"other\")\n\
         }",
    );
    // Case 2 matches and falls through into case 3's body.
    assert_eq!(take_output(&output), "two\nthree\n");

    eval_ok(
        &mut vm,
        "x = 9\nswitch (x) { case 1: print(\"one\")\nbreak\ndefault: print(\"other\") }",
    );
    assert_eq!(take_output(&output), "other\n");
}

#[test]
fn test_logical_operators_and_truthiness() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "(true and 1) == true");
    assert!(top_bool(&mut vm));

    eval_ok(&mut vm, "(nil or false) == false");
    assert!(top_bool(&mut vm));

    eval_ok(&mut vm, "not nil");
    assert!(top_bool(&mut vm));

    // Zero is truthy; only nil and false are falsey.
    eval_ok(&mut vm, "0 and true");
    assert!(top_bool(&mut vm));
}

#[test]
fn test_deep_equality_of_collections() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "[1, [2, 3]] == [1, [2, 3]]");
    assert!(top_bool(&mut vm));

    // A brace at statement start opens a block, so bind the maps first.
    eval_ok(&mut vm, "m1 = { a: 1 }\nm2 = { a: 1 }\nm1 == m2");
    assert!(top_bool(&mut vm));

    eval_ok(&mut vm, "[1, 2] == [2, 1]");
    assert!(!top_bool(&mut vm));
}

#[test]
fn test_regex_opcodes() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "r = regex(\"[0-9]+\", \"\")\nregex_test(r, \"abc123\")");
    assert!(top_bool(&mut vm));

    eval_ok(&mut vm, "m = regex_match(regex(\"(a+)(b+)\", \"\"), \"aabbb\")\nm[1] + m[2]");
    assert_eq!(top_string(&mut vm), "aabbb");

    eval_ok(
        &mut vm,
        "regex_replace(regex(\"[0-9]+\", \"\"), \"a1b22c\", \"#\")",
    );
    assert_eq!(top_string(&mut vm), "a#b#c");

    eval_ok(&mut vm, "regex_split(regex(\",\", \"\"), \"x,y,z\").len()");
    assert_eq!(top_number(&mut vm), 3.0);

    eval_ok(&mut vm, "regex_test(regex(\"HELLO\", \"i\"), \"hello\")");
    assert!(top_bool(&mut vm));
}

#[test]
fn test_invalid_regex_throws_syntax_error() {
    let mut vm = Vm::new();
    eval_err(&mut vm, "regex(\"(unclosed\", \"\")", ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("SyntaxError"), "{trace}");
}

#[test]
fn test_compile_error_status() {
    let mut vm = Vm::new();
    assert_eq!(vm.eval("fn ("), ExecStatus::CompileError);
}

#[test]
fn test_len_and_type_natives() {
    let mut vm = Vm::new();
    eval_ok(&mut vm, "len(\"four\")");
    assert_eq!(top_number(&mut vm), 4.0);

    eval_ok(&mut vm, "type([1])");
    assert_eq!(top_string(&mut vm), "array");

    eval_ok(&mut vm, "type(nil)");
    assert_eq!(top_string(&mut vm), "nil");
}
