//! ember-vm - The Ember virtual machine.
//!
//! A stack-based bytecode interpreter with a tracing garbage collector,
//! structured exception handling, cooperative coroutines, and a module
//! loader. This crate is the embedding surface: create a [`Vm`], feed it
//! source with [`Vm::eval`], call script functions with [`Vm::call`],
//! and install host natives with [`Vm::register_func`].
//!
//! # Example
//!
//! ```
//! use ember_vm::{ExecStatus, Value, Vm};
//!
//! let mut vm = Vm::new();
//! assert_eq!(vm.eval("((10 + 5) * 2) - (3 + 7)"), ExecStatus::Success);
//! match vm.top_of_stack() {
//!     Some(Value::Number(n)) => assert_eq!(*n, 20.0),
//!     other => panic!("expected number, got {other:?}"),
//! }
//! ```

pub mod exception;
pub mod frame;
pub mod gc;
pub mod module;
pub mod native;
pub mod value;
pub mod vm;

pub use exception::{ExceptionKind, ExceptionObject, TraceFrame};
pub use frame::{CallFrame, ExecKind, ExecState, HandlerFrame, Outcome};
pub use gc::{GcConfig, GcStats, Heap};
pub use module::{ModuleRecord, ModuleRegistry, ModuleStatus};
pub use native::{NativeFn, NativeFunction, NativeResult};
pub use value::{ObjRef, Object, Value, ValueMap, ValueSet};
pub use vm::{OutputSink, Vm};

use thiserror::Error;

/// Status codes mirrored to embedders: 0 is success, each failure class
/// has a distinct non-zero code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecStatus {
    /// Execution completed.
    Success = 0,
    /// Source failed to compile.
    CompileError = 1,
    /// An exception left the script unhandled, or execution failed.
    RuntimeError = 2,
    /// Allocation failure or resource exhaustion.
    MemoryError = 3,
    /// A security policy rejected the operation.
    SecurityError = 4,
}

impl ExecStatus {
    /// The numeric return code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether this is the success status.
    pub fn is_success(self) -> bool {
        self == ExecStatus::Success
    }
}

/// Errors surfaced by the embedding API.
#[derive(Debug, Error)]
pub enum VmError {
    /// Compilation failed; diagnostics were reported.
    #[error(transparent)]
    Compile(#[from] ember_compile::CompileError),

    /// A runtime failure outside script code (infrastructure).
    #[error("runtime error: {message}")]
    Runtime {
        /// Description of the failure.
        message: String,
    },

    /// A script exception unwound every frame; the pending exception
    /// slot holds the value.
    #[error("unhandled exception: {message}")]
    Unhandled {
        /// Rendered `TypeName: message` of the exception.
        message: String,
    },

    /// Allocation failure or resource exhaustion.
    #[error("memory error: {0}")]
    Memory(String),

    /// A security policy rejected the operation.
    #[error("security violation: {0}")]
    Security(String),
}

impl VmError {
    /// Maps the error onto the embedder status code.
    pub fn status(&self) -> ExecStatus {
        match self {
            VmError::Compile(_) => ExecStatus::CompileError,
            VmError::Runtime { .. } | VmError::Unhandled { .. } => ExecStatus::RuntimeError,
            VmError::Memory(_) => ExecStatus::MemoryError,
            VmError::Security(_) => ExecStatus::SecurityError,
        }
    }
}
