//! The interpreter: VM state, embedding API, GC orchestration, and the
//! module loader.
//!
//! The dispatch loop itself lives in `dispatch`, exception unwinding in
//! `except`, coroutine plumbing in `coroutine`, and runtime string
//! interpolation in `interp` - all as `impl Vm` blocks over the state
//! defined here.
//!
//! # Execution model
//!
//! A [`Vm`] owns a stack of [`ExecState`]s. Index 0 is the persistent
//! top-level execution; module loads, async calls, and generator resumes
//! push fresh ones. The dispatch loop always runs the topmost state, so
//! nested executions are rooted for the collector simply by living in
//! the stack.
//!
//! Collection happens only at the dispatch safepoint, never inside an
//! allocation, so values a single opcode holds in Rust locals can't be
//! swept out from under it.

mod builtins;
mod coroutine;
mod dispatch;
mod except;
mod interp;

pub use crate::frame::{ExecKind, ExecState, Outcome};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ember_compile::{compile, Function};
use ember_util::Handler;
use rustc_hash::FxHashMap;

use crate::exception::{ExceptionKind, ExceptionObject, TraceFrame};
use crate::frame::CallFrame;
use crate::gc::{GcConfig, GcStats, Heap};
use crate::module::{ModuleRecord, ModuleRegistry, ModuleStatus};
use crate::native::{self, NativeFn, NativeFunction};
use crate::value::{Object, Value, ValueMap};
use crate::{ExecStatus, VmError};

/// Where `print` and friends write.
#[derive(Clone, Debug, Default)]
pub enum OutputSink {
    /// Process stdout.
    #[default]
    Stdout,
    /// An in-memory buffer, for tests and embedders that redirect.
    Capture(Arc<Mutex<String>>),
}

impl OutputSink {
    /// Writes one line.
    pub fn write_line(&self, line: &str) {
        match self {
            OutputSink::Stdout => println!("{line}"),
            OutputSink::Capture(buffer) => {
                let mut guard = buffer.lock().expect("output buffer poisoned");
                guard.push_str(line);
                guard.push('\n');
            }
        }
    }
}

/// An Ember interpreter instance.
///
/// Single-threaded by construction: one `Vm` runs one execution at a
/// time. The pool crate wraps instances in mutexes to serve concurrent
/// tasks; nothing here is shared between instances.
pub struct Vm {
    /// The object heap and collector.
    pub(crate) heap: Heap,
    /// Global bindings.
    pub(crate) globals: FxHashMap<String, Value>,
    /// Execution states; index 0 is the persistent top-level one.
    pub(crate) exec_stack: Vec<ExecState>,
    /// Loaded modules by canonical path.
    pub(crate) modules: ModuleRegistry,
    /// Custom module search paths, highest priority first.
    pub(crate) module_paths: Vec<PathBuf>,
    /// Canonical keys of modules currently loading (importer on top).
    pub(crate) loading_stack: Vec<String>,
    /// The unhandled exception from the last failed execution.
    pub(crate) pending_exception: Option<Value>,
    /// Coroutine objects pinned while their execution state is checked
    /// out of them (a resuming generator or waking promise is otherwise
    /// invisible to the collector).
    pub(crate) coroutine_roots: Vec<crate::value::ObjRef>,
    /// Output sink for `print`.
    pub(crate) output: OutputSink,
    /// Most recently compiled top-level script, for `run`.
    script: Option<Arc<Function>>,
    /// Creation time, for the `clock` native.
    pub(crate) start_time: Instant,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").finish_non_exhaustive()
    }
}

impl Vm {
    /// Creates an interpreter with default GC configuration.
    pub fn new() -> Self {
        Vm::with_config(GcConfig::default())
    }

    /// Creates an interpreter with the given GC configuration.
    pub fn with_config(gc_config: GcConfig) -> Self {
        let mut vm = Self {
            heap: Heap::new(gc_config),
            globals: FxHashMap::default(),
            exec_stack: vec![ExecState::new(ExecKind::Script, "eval")],
            modules: ModuleRegistry::new(),
            module_paths: Vec::new(),
            loading_stack: Vec::new(),
            pending_exception: None,
            coroutine_roots: Vec::new(),
            output: OutputSink::Stdout,
            script: None,
            start_time: Instant::now(),
        };
        native::install_core(&mut vm);
        vm
    }

    // =========================================================================
    // EMBEDDING API
    // =========================================================================

    /// Compiles and executes a source string in the top-level context.
    pub fn eval(&mut self, source: &str) -> ExecStatus {
        match self.eval_internal(source, "eval") {
            Ok(()) => ExecStatus::Success,
            Err(error) => error.status(),
        }
    }

    /// Runs an already compiled script in the top-level context. This is
    /// the entry a bytecode cache feeds.
    pub fn run_compiled(&mut self, script: Arc<Function>) -> ExecStatus {
        self.script = Some(script.clone());
        match self.run_script(script) {
            Ok(()) => ExecStatus::Success,
            Err(error) => error.status(),
        }
    }

    /// Clears the error state left by a failed execution.
    pub fn clear_error_state(&mut self) {
        self.pending_exception = None;
    }

    /// Re-runs the most recently compiled script.
    pub fn run(&mut self) -> ExecStatus {
        let Some(script) = self.script.clone() else {
            return ExecStatus::RuntimeError;
        };
        match self.run_script(script) {
            Ok(()) => ExecStatus::Success,
            Err(error) => error.status(),
        }
    }

    /// Calls a globally bound function by name. The result is left on
    /// the operand stack (see [`Vm::top_of_stack`]).
    pub fn call(&mut self, name: &str, args: &[Value]) -> ExecStatus {
        match self.call_internal(name, args) {
            Ok(()) => ExecStatus::Success,
            Err(error) => error.status(),
        }
    }

    /// Installs a native callable into globals.
    pub fn register_func(&mut self, name: &str, func: NativeFn) {
        let native = NativeFunction {
            name: name.to_string(),
            func,
        };
        self.globals
            .insert(name.to_string(), Value::Native(Arc::new(native)));
    }

    /// Imports a module by name, loading it if necessary.
    pub fn import_module(&mut self, name: &str) -> ExecStatus {
        match self.import_module_value(name) {
            Ok(_) => ExecStatus::Success,
            Err(exception) => {
                self.pending_exception = Some(exception);
                ExecStatus::RuntimeError
            }
        }
    }

    /// Adds a custom module search path, validated.
    pub fn add_module_path(&mut self, dir: &Path) -> Result<(), VmError> {
        crate::module::resolver::validate_search_path(dir)?;
        if self.module_paths.iter().any(|existing| existing == dir) {
            log::warn!("[MODULE_PATH] ignoring duplicate search path {}", dir.display());
            return Err(VmError::Security(format!(
                "duplicate module path: {}",
                dir.display()
            )));
        }
        log::debug!("[MODULE_PATH] registered search path {}", dir.display());
        self.module_paths.push(dir.to_path_buf());
        Ok(())
    }

    /// Resolves a module name to the path the loader would use, without
    /// loading it.
    pub fn resolve_module_path(&self, name: &str) -> Option<PathBuf> {
        crate::module::resolver::resolve(name, self.current_module_dir().as_deref(), &self.module_paths)
    }

    /// The value on top of the operand stack, if any.
    pub fn top_of_stack(&self) -> Option<&Value> {
        self.exec_stack.first().and_then(|exec| exec.stack.last())
    }

    /// Pops the value on top of the operand stack.
    pub fn pop_result(&mut self) -> Option<Value> {
        self.exec_stack.first_mut().and_then(|exec| exec.stack.pop())
    }

    /// Takes the pending exception left by the last failed execution.
    pub fn take_pending_exception(&mut self) -> Option<Value> {
        self.pending_exception.take()
    }

    /// Renders the pending exception (message plus trace) without
    /// consuming it.
    pub fn pending_exception_trace(&self) -> Option<String> {
        let value = self.pending_exception.as_ref()?;
        Some(match value.as_obj().map(|r| self.heap.get(r)) {
            Some(Object::Exception(exception)) => exception.render_trace(),
            _ => self.heap.display_value(value),
        })
    }

    /// Redirects `print` output into a buffer and returns a handle to
    /// it.
    pub fn capture_output(&mut self) -> Arc<Mutex<String>> {
        let buffer = Arc::new(Mutex::new(String::new()));
        self.output = OutputSink::Capture(buffer.clone());
        buffer
    }

    /// GC statistics.
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats().snapshot()
    }

    /// Forces a full collection cycle.
    pub fn collect_now(&mut self) {
        self.collect_garbage();
    }

    /// Number of live heap objects (diagnostics and tests).
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// The module registry, for embedders inspecting load state.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// The heap, for embedders inspecting values the VM handed out.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Interns a string and returns it as a value (host convenience for
    /// building argument lists).
    pub fn make_string(&mut self, text: &str) -> Value {
        self.heap.string_value(text)
    }

    /// Binds a global from the host side.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Reads a global binding.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Clears user-visible state: globals defined by scripts, the stack,
    /// pending exception, and the module registry. Native bindings are
    /// reinstalled. Used by the pool between tenants.
    pub fn reset_for_reuse(&mut self) {
        self.globals.clear();
        self.exec_stack.truncate(1);
        if let Some(main) = self.exec_stack.first_mut() {
            main.stack.clear();
            main.frames.clear();
            main.handlers.clear();
        }
        self.pending_exception = None;
        self.coroutine_roots.clear();
        self.modules = ModuleRegistry::new();
        self.loading_stack.clear();
        self.script = None;
        native::install_core(self);
        self.collect_garbage();
    }

    // =========================================================================
    // EXECUTION PLUMBING
    // =========================================================================

    fn eval_internal(&mut self, source: &str, name: &str) -> Result<(), VmError> {
        let handler = Handler::new();
        let script = compile(source, name, &handler).map_err(|error| {
            for diagnostic in handler.take() {
                eprintln!("{diagnostic}");
            }
            VmError::Compile(error)
        })?;
        self.script = Some(script.clone());
        self.run_script(script)
    }

    fn run_script(&mut self, script: Arc<Function>) -> Result<(), VmError> {
        debug_assert_eq!(self.exec_stack.len(), 1, "script run outside top level");
        let base = self.exec().stack.len();
        self.exec().stack.push(Value::Function(script.clone()));
        let floor = self.exec().frames.len() + 1;
        self.exec().frames.push(CallFrame::new(script, base));

        match self.execute(floor, None) {
            Outcome::Halted | Outcome::Returned(_) => Ok(()),
            Outcome::Threw(exception) => {
                let rendered = self.describe_exception(&exception);
                self.pending_exception = Some(exception);
                // Drop whatever the failed execution left behind.
                let exec = self.exec();
                exec.stack.truncate(base);
                exec.frames.truncate(floor - 1);
                exec.handlers.clear();
                Err(VmError::Unhandled { message: rendered })
            }
            Outcome::AwaitPending(_) | Outcome::Yielded(_) => {
                // The compiler rejects await/yield at top level; if one
                // slips through, surface it as a runtime failure.
                Err(VmError::Runtime {
                    message: "top-level execution suspended".to_string(),
                })
            }
        }
    }

    fn call_internal(&mut self, name: &str, args: &[Value]) -> Result<(), VmError> {
        let Some(callee) = self.globals.get(name).cloned() else {
            log::debug!("[CALL] undefined function '{name}'");
            let exception = self.make_error(
                ExceptionKind::Reference,
                format!("undefined function '{name}'"),
            );
            self.pending_exception = Some(exception);
            return Err(VmError::Runtime {
                message: format!("undefined function '{name}'"),
            });
        };

        let exec = self.exec();
        let frames_before = exec.frames.len();
        let depth_before = exec.stack.len();
        exec.stack.push(callee);
        for arg in args {
            exec.stack.push(arg.clone());
        }

        if let Err(exception) = self.call_value(args.len() as u8) {
            let rendered = self.describe_exception(&exception);
            self.pending_exception = Some(exception);
            self.exec().stack.truncate(depth_before);
            return Err(VmError::Unhandled { message: rendered });
        }

        if self.exec().frames.len() > frames_before {
            match self.execute(frames_before + 1, None) {
                Outcome::Returned(_) | Outcome::Halted => Ok(()),
                Outcome::Threw(exception) => {
                    let rendered = self.describe_exception(&exception);
                    self.pending_exception = Some(exception);
                    let exec = self.exec();
                    exec.stack.truncate(depth_before);
                    exec.frames.truncate(frames_before);
                    exec.handlers.clear();
                    Err(VmError::Unhandled { message: rendered })
                }
                Outcome::AwaitPending(_) | Outcome::Yielded(_) => Err(VmError::Runtime {
                    message: "call suspended outside coroutine context".to_string(),
                }),
            }
        } else {
            // Native call: the result is already on the stack.
            Ok(())
        }
    }

    /// The currently running execution state.
    #[inline]
    pub(crate) fn exec(&mut self) -> &mut ExecState {
        self.exec_stack.last_mut().expect("execution stack empty")
    }

    /// The currently running execution state, shared.
    #[inline]
    pub(crate) fn exec_ref(&self) -> &ExecState {
        self.exec_stack.last().expect("execution stack empty")
    }

    /// The current call frame.
    #[inline]
    pub(crate) fn frame(&self) -> &CallFrame {
        self.exec_ref().frames.last().expect("no active frame")
    }

    /// The current call frame, mutable.
    #[inline]
    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        self.exec().frames.last_mut().expect("no active frame")
    }

    // =========================================================================
    // EXCEPTION CONSTRUCTION
    // =========================================================================

    /// Builds an exception object of the given kind with position and
    /// stack trace captured from the current execution.
    pub(crate) fn make_error(&mut self, kind: ExceptionKind, message: impl Into<String>) -> Value {
        let mut exception = ExceptionObject::new(kind, message);
        let frames = self.capture_trace();
        if let Some(top) = frames.first() {
            exception.file = top.file.clone();
            exception.line = top.line;
            exception.column = top.column;
        }
        exception.stack_frames = frames;
        Value::Obj(self.heap.alloc(Object::Exception(exception)))
    }

    /// Captures the current call stack, innermost frame first.
    pub(crate) fn capture_trace(&self) -> Vec<TraceFrame> {
        let Some(exec) = self.exec_stack.last() else {
            return Vec::new();
        };
        exec.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = if frame.function.name.is_empty() {
                    "<script>".to_string()
                } else {
                    frame.function.name.clone()
                };
                TraceFrame {
                    function,
                    file: exec.script_name.clone(),
                    line: frame.function.chunk.line_at(frame.ip.saturating_sub(1)),
                    column: 0,
                }
            })
            .collect()
    }

    /// A short description of an exception value for error reporting.
    pub(crate) fn describe_exception(&self, value: &Value) -> String {
        match value.as_obj().map(|r| self.heap.get(r)) {
            Some(Object::Exception(exception)) => {
                format!("{}: {}", exception.type_name, exception.message)
            }
            _ => self.heap.display_value(value),
        }
    }

    // =========================================================================
    // GARBAGE COLLECTION
    // =========================================================================

    /// Runs a full mark-and-sweep cycle over every root the VM holds.
    pub(crate) fn collect_garbage(&mut self) {
        let mut gray = Vec::new();
        self.heap.begin_cycle();

        for exec in &self.exec_stack {
            for value in &exec.stack {
                self.heap.mark_value(value, &mut gray);
            }
            for frame in &exec.frames {
                if let Some(class_def) = frame.class_def {
                    self.heap.mark_ref(class_def, &mut gray);
                }
            }
            for handler in &exec.handlers {
                match &handler.completion {
                    crate::frame::Completion::Normal => {}
                    crate::frame::Completion::Throw(value)
                    | crate::frame::Completion::Return(value) => {
                        self.heap.mark_value(value, &mut gray);
                    }
                }
            }
        }
        for value in self.globals.values() {
            self.heap.mark_value(value, &mut gray);
        }
        if let Some(pending) = &self.pending_exception {
            self.heap.mark_value(pending, &mut gray);
        }
        for &pinned in &self.coroutine_roots {
            self.heap.mark_ref(pinned, &mut gray);
        }
        for record in self.modules.iter() {
            self.heap.mark_ref(record.exports, &mut gray);
        }
        self.heap.mark_interned(&mut gray);

        self.heap.trace(&mut gray);
        self.heap.sweep();
    }

    // =========================================================================
    // MODULE LOADING
    // =========================================================================

    /// Directory of the module currently being loaded; relative imports
    /// resolve against it.
    pub(crate) fn current_module_dir(&self) -> Option<PathBuf> {
        let key = self.loading_stack.last()?;
        let record = self.modules.get(key)?;
        record.path.parent().map(Path::to_path_buf)
    }

    /// Imports a module, returning its export map. Errors come back as
    /// exception values ready to throw.
    pub(crate) fn import_module_value(&mut self, name: &str) -> Result<Value, Value> {
        if let Err(reason) = crate::module::resolver::validate_module_name(name) {
            log::error!("[SECURITY] rejected module name '{name}': {reason}");
            return Err(self.make_error(
                ExceptionKind::Security,
                format!("invalid module name '{name}': {reason}"),
            ));
        }

        let base_dir = self.current_module_dir();
        let Some(path) =
            crate::module::resolver::resolve(name, base_dir.as_deref(), &self.module_paths)
        else {
            log::error!("[RESOLVE] module '{name}' not found");
            return Err(self.make_error(
                ExceptionKind::Io,
                format!("module '{name}' not found"),
            ));
        };
        let key = path.to_string_lossy().to_string();

        if let Some(record) = self.modules.get(&key) {
            let status = record.status;
            let exports = record.exports;
            match status {
                ModuleStatus::Loaded => return Ok(Value::Obj(exports)),
                ModuleStatus::Loading => {
                    eprintln!("[MODULE] circular dependency detected while importing '{name}'");
                    log::error!("[MODULE] circular dependency: '{name}' ({key})");
                    return Err(self.make_error(
                        ExceptionKind::Runtime,
                        format!("circular dependency detected while importing '{name}'"),
                    ));
                }
                ModuleStatus::Failed => {
                    return Err(self.make_error(
                        ExceptionKind::Runtime,
                        format!("module '{name}' previously failed to load"),
                    ));
                }
            }
        }

        log::debug!("[IMPORT] loading module '{name}' from {key}");
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(error) => {
                log::error!("[MODULE] read failed for {key}: {error}");
                return Err(self.make_error(
                    ExceptionKind::Io,
                    format!("cannot read module '{name}': {error}"),
                ));
            }
        };

        let exports = self.heap.alloc(Object::Map(ValueMap::new()));
        let record = ModuleRecord::loading(name, path.clone(), exports);
        if let Err(reason) = self.modules.insert(key.clone(), record) {
            return Err(self.make_error(ExceptionKind::Runtime, reason));
        }
        if let Some(parent_key) = self.loading_stack.last().cloned() {
            if let Some(parent) = self.modules.get_mut(&parent_key) {
                parent.deps.push(key.clone());
            }
        }

        let handler = Handler::new();
        let script = match compile(&source, &key, &handler) {
            Ok(script) => script,
            Err(error) => {
                for diagnostic in handler.take() {
                    eprintln!("[MODULE] {diagnostic}");
                }
                self.modules.set_status(&key, ModuleStatus::Failed);
                return Err(self.make_error(
                    ExceptionKind::Syntax,
                    format!("module '{name}' failed to compile: {error}"),
                ));
            }
        };
        self.modules.set_chunk(&key, script.clone());

        // Execute the module body in a fresh execution; the current one
        // (and its chunk/ip/locals) is untouched underneath it.
        self.loading_stack.push(key.clone());
        let mut exec = ExecState::new(ExecKind::Script, &key);
        exec.stack.push(Value::Function(script.clone()));
        exec.frames.push(CallFrame::new(script, 0));
        self.exec_stack.push(exec);
        let outcome = self.execute(1, None);
        self.exec_stack.pop();
        self.loading_stack.pop();

        match outcome {
            Outcome::Halted | Outcome::Returned(_) => {
                self.modules.set_status(&key, ModuleStatus::Loaded);
                log::debug!("[MODULE] loaded '{name}'");
                Ok(Value::Obj(exports))
            }
            Outcome::Threw(exception) => {
                self.modules.set_status(&key, ModuleStatus::Failed);
                log::error!(
                    "[MODULE] '{name}' failed: {}",
                    self.describe_exception(&exception)
                );
                Err(exception)
            }
            Outcome::AwaitPending(_) | Outcome::Yielded(_) => {
                self.modules.set_status(&key, ModuleStatus::Failed);
                Err(self.make_error(
                    ExceptionKind::Runtime,
                    format!("module '{name}' suspended at top level"),
                ))
            }
        }
    }

    /// Writes an export into the module currently loading. Exports
    /// outside a module load are ignored.
    pub(crate) fn export_value(&mut self, name: &str, value: Value) {
        let Some(key) = self.loading_stack.last().cloned() else {
            return;
        };
        let Some(record) = self.modules.get(&key) else {
            return;
        };
        let exports = record.exports;
        let key_value = self.heap.string_value(name);
        let hash = self.heap.hash_value(&key_value);
        if let Object::Map(map) = self.heap.get_mut(exports) {
            map.insert(hash, key_value, value);
        }
    }
}
