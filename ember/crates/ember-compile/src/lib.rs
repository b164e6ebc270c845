//! ember-compile - Single-pass compiler for the Ember language.
//!
//! Converts the token stream from `ember-lex` directly into bytecode
//! [`Chunk`]s - there is no AST. Expressions go through a Pratt
//! precedence table; control flow is emitted with placeholder jumps and
//! backpatched once the target is known.
//!
//! The compiler is a value, like the lexer: one [`compiler::Compiler`]
//! per compilation, no process-global state. The VM creates fresh ones at
//! runtime to compile `${expr}` fragments of interpolated strings and the
//! bodies of imported modules.
//!
//! # Example
//!
//! ```
//! use ember_compile::compile;
//! use ember_util::Handler;
//!
//! let handler = Handler::new();
//! let script = compile("1 + 2", "repl", &handler).unwrap();
//! assert!(script.chunk.len() > 0);
//! ```

pub mod chunk;
pub mod compiler;
pub mod opcode;

pub use chunk::{Chunk, ChunkRef, MAX_CONSTANTS};
pub use compiler::Compiler;
pub use opcode::{OpCode, NO_JUMP, NO_SLOT};

use ember_util::Handler;
use std::sync::Arc;
use thiserror::Error;

/// Maximum depth of nested active loops per function.
pub const MAX_LOOP_DEPTH: usize = 8;

/// Maximum depth of nested active `try` blocks per function.
pub const MAX_TRY_DEPTH: usize = 8;

/// Maximum local slots per function (slot operands are one byte).
pub const MAX_LOCALS: usize = 256;

/// What kind of function a chunk belongs to.
///
/// The kind decides validation (`await` only inside [`FunctionKind::Async`],
/// `this` only inside methods) and the VM's call behavior (generators
/// suspend, initializers return the instance).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    /// Top-level script code.
    Script,
    /// An ordinary named function.
    Function,
    /// A method defined in a class body.
    Method,
    /// The `init` method of a class.
    Initializer,
    /// An `async fn`; may contain `await`.
    Async,
    /// A function containing `yield`; calling it builds a generator.
    Generator,
}

/// A compiled function: name, arity, kind, and its code.
///
/// Functions are compile-time artifacts; the VM wraps them in its value
/// type when they are pushed from the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name ("" for the top-level script).
    pub name: String,
    /// Declared parameter count.
    pub arity: u8,
    /// Function kind.
    pub kind: FunctionKind,
    /// The compiled body.
    pub chunk: Chunk,
}

impl Function {
    /// Creates an empty function shell the compiler fills in.
    pub fn new(name: impl Into<String>, kind: FunctionKind) -> Self {
        Self {
            name: name.into(),
            arity: 0,
            kind,
            chunk: Chunk::new(),
        }
    }
}

/// A compile-time constant in a chunk's pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// The `nil` literal.
    Nil,
    /// A boolean literal.
    Bool(bool),
    /// Number literal.
    Number(f64),
    /// String literal (escapes already processed) - also used for
    /// identifier names referenced by name-carrying opcodes.
    Str(String),
    /// Raw body of an interpolated string, rescanned by the VM.
    InterpolatedStr(String),
    /// A compiled function.
    Function(Arc<Function>),
}

/// Error produced when compilation fails.
#[derive(Debug, Error)]
pub enum CompileError {
    /// One or more syntax errors were reported; `rendered` holds the
    /// formatted diagnostics, one per line.
    #[error("compilation failed with {count} error(s):\n{rendered}")]
    Failed {
        /// Number of errors.
        count: usize,
        /// Rendered diagnostics.
        rendered: String,
    },
}

/// Compiles a source string into a top-level script function.
///
/// `name` labels the script in stack traces (typically the file path, or
/// something like "eval"). Errors are reported into `handler` and also
/// summarized in the returned [`CompileError`].
pub fn compile(source: &str, name: &str, handler: &Handler) -> Result<Arc<Function>, CompileError> {
    let compiler = Compiler::new(source, handler);
    compiler.compile_script(name)
}

/// Compiles a single expression into a zero-argument function that
/// evaluates it and returns the result.
///
/// This is the entry the VM uses for the `${expr}` fragments of an
/// interpolated string.
pub fn compile_fragment(
    source: &str,
    handler: &Handler,
) -> Result<Arc<Function>, CompileError> {
    let compiler = Compiler::new(source, handler);
    compiler.compile_expression_fragment()
}
