//! Module loader tests: search paths, export binding forms, loading
//! state machine, and circular-dependency detection - over real files
//! in temporary directories.

mod common;

use std::fs;
use std::path::Path;

use common::{eval_ok, take_output, top_number, top_string, vm_with_output};
use ember_vm::{ExecStatus, ModuleStatus, Vm};
use tempfile::TempDir;

/// A VM with `dir` registered as a module search path.
fn vm_with_modules(dir: &Path) -> Vm {
    let mut vm = Vm::new();
    vm.add_module_path(dir).expect("search path should validate");
    vm
}

fn write_module(dir: &Path, name: &str, source: &str) {
    fs::write(dir.join(format!("{name}.ember")), source).unwrap();
}

#[test]
fn test_named_imports() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("math.ember"),
        "export fn sq(x) { return x * x }\nexport fn cube(x) { return x * x * x }",
    )?;

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "import { sq, cube as c } from \"math\"\nsq(4) + c(2)");
    assert_eq!(top_number(&mut vm), 24.0);
    Ok(())
}

#[test]
fn test_namespace_import() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "geometry", "export pi = 3\nexport fn area(r) { return pi * r * r }");

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "import * as geo from \"geometry\"\ngeo.area(2) + geo.pi");
    assert_eq!(top_number(&mut vm), 15.0);
}

#[test]
fn test_default_import() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "answer", "export default 42");

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "import answer from \"answer\"\nanswer");
    assert_eq!(top_number(&mut vm), 42.0);
}

#[test]
fn test_side_effect_import() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "noisy", "print(\"loaded\")");

    let (mut vm, output) = vm_with_output();
    vm.add_module_path(dir.path()).unwrap();
    eval_ok(&mut vm, "import \"noisy\"");
    assert_eq!(take_output(&output), "loaded\n");
}

#[test]
fn test_reexport() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "base", "export fn id(x) { return x }");
    write_module(dir.path(), "facade", "export { id as identity } from \"base\"");

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "import { identity } from \"facade\"\nidentity(7)");
    assert_eq!(top_number(&mut vm), 7.0);
}

#[test]
fn test_package_directory_form() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    fs::create_dir(dir.path().join("tools"))?;
    fs::write(
        dir.path().join("tools").join("package.ember"),
        "export name = \"tools\"",
    )?;

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "import { name } from \"tools\"\nname");
    assert_eq!(top_string(&mut vm), "tools");
    Ok(())
}

#[test]
fn test_module_loaded_once_and_monotonic() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "counted", "print(\"body ran\")\nexport x = 1");

    let (mut vm, output) = vm_with_output();
    vm.add_module_path(dir.path()).unwrap();
    eval_ok(
        &mut vm,
        "import { x } from \"counted\"\nimport { x } from \"counted\"\nx",
    );
    // The body runs once; the second import hits the registry.
    assert_eq!(take_output(&output), "body ran\n");
    assert_eq!(top_number(&mut vm), 1.0);

    let record = vm.modules().find_by_name("counted").expect("record exists");
    assert_eq!(record.status, ModuleStatus::Loaded);
}

#[test]
fn test_relative_imports_between_modules() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "helper", "export fn twice(x) { return 2 * x }");
    write_module(
        dir.path(),
        "main",
        "import { twice } from \"./helper\"\nexport fn quad(x) { return twice(twice(x)) }",
    );

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "import { quad } from \"main\"\nquad(3)");
    assert_eq!(top_number(&mut vm), 12.0);
}

#[test]
fn test_circular_import_fails_and_marks_failed() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "a", "import \"./b\"\nexport x = 1");
    write_module(dir.path(), "b", "import \"./a\"\nexport y = 2");

    let mut vm = vm_with_modules(dir.path());
    let status = vm.eval("import \"a\"");
    assert_eq!(status, ExecStatus::RuntimeError);

    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("circular"), "{trace}");

    // Neither module may end up Loaded.
    let a = vm.modules().find_by_name("a").expect("record for a");
    assert_eq!(a.status, ModuleStatus::Failed);
    let b = vm.modules().find_by_name("./b").expect("record for b");
    assert_ne!(b.status, ModuleStatus::Loaded);
}

#[test]
fn test_missing_module_is_an_io_error() {
    let mut vm = Vm::new();
    let status = vm.eval("import \"does_not_exist_anywhere\"");
    assert_eq!(status, ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("IOError"), "{trace}");
}

#[test]
fn test_path_traversal_is_rejected() {
    let mut vm = Vm::new();
    let status = vm.eval("import \"../escape\"");
    assert_eq!(status, ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("SecurityError"), "{trace}");
}

#[test]
fn test_module_compile_error_marks_failed() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "broken", "fn (");

    let mut vm = vm_with_modules(dir.path());
    let status = vm.eval("import \"broken\"");
    assert_eq!(status, ExecStatus::RuntimeError);
    let record = vm.modules().find_by_name("broken").expect("record exists");
    assert_eq!(record.status, ModuleStatus::Failed);

    // Importing again reports the prior failure instead of re-running.
    let status = vm.eval("import \"broken\"");
    assert_eq!(status, ExecStatus::RuntimeError);
    let trace = vm.pending_exception_trace().unwrap();
    assert!(trace.contains("previously failed"), "{trace}");
}

#[test]
fn test_add_module_path_rejects_bad_dirs() {
    let mut vm = Vm::new();
    assert!(vm.add_module_path(Path::new("/definitely/not/here")).is_err());

    let dir = TempDir::new().unwrap();
    assert!(vm.add_module_path(dir.path()).is_ok());
    // Duplicates are rejected.
    assert!(vm.add_module_path(dir.path()).is_err());
}

#[test]
fn test_require_expression_returns_export_map() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "config", "export port = 8080");

    let mut vm = vm_with_modules(dir.path());
    eval_ok(&mut vm, "cfg = require(\"config\")\ncfg[\"port\"]");
    assert_eq!(top_number(&mut vm), 8080.0);
}

#[test]
fn test_resolve_module_path_without_loading() {
    let dir = TempDir::new().unwrap();
    write_module(dir.path(), "findme", "x = 1");

    let mut vm = vm_with_modules(dir.path());
    let path = vm.resolve_module_path("findme").expect("should resolve");
    assert!(path.ends_with("findme.ember"));
    assert!(vm.modules().is_empty(), "resolution must not load");
    assert!(vm.resolve_module_path("absent_module_name").is_none());
}
