//! Call frames, exception handler frames, and execution state.
//!
//! An [`ExecState`] is one complete execution: operand stack, call-frame
//! stack, and handler stack. The VM's main script runs in one; every
//! async function call and generator gets its own, which is what makes
//! `AWAIT`/`YIELD` suspension a matter of moving the state into a heap
//! object instead of unwinding native frames.

use std::sync::Arc;

use ember_compile::Function;

use crate::value::{ObjRef, Value};

/// Maximum operand stack depth per execution.
pub const STACK_MAX: usize = 16 * 1024;

/// Maximum call-frame depth per execution.
pub const FRAMES_MAX: usize = 256;

/// One active call.
#[derive(Debug)]
pub struct CallFrame {
    /// The function whose chunk is executing; holds the return chunk for
    /// the frames below it.
    pub function: Arc<Function>,
    /// Next byte to read in the function's chunk.
    pub ip: usize,
    /// Stack index of the callee slot; locals are addressed relative to
    /// this.
    pub base: usize,
    /// For methods: the class the method was found on (resolves
    /// `super`).
    pub class_def: Option<ObjRef>,
}

impl CallFrame {
    /// A frame at the start of `function`, with locals based at `base`.
    pub fn new(function: Arc<Function>, base: usize) -> Self {
        Self {
            function,
            ip: 0,
            base,
            class_def: None,
        }
    }
}

/// Where a protected region currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    /// Executing the try body.
    Try,
    /// Executing the catch body.
    Catch,
    /// Executing the finally body.
    Finally,
}

/// What a finally block owes once it completes.
#[derive(Debug, Default)]
pub enum Completion {
    /// Fall through normally.
    #[default]
    Normal,
    /// Re-raise this thrown value.
    Throw(Value),
    /// Perform this return.
    Return(Value),
}

/// One pushed `TRY_BEGIN`.
///
/// The frame index ties the handler to the call frame it was pushed in,
/// so the unwinder can tell in-frame handlers from outer-frame ones, and
/// so a returning frame can discard handlers it abandoned.
#[derive(Debug)]
pub struct HandlerFrame {
    /// Index into the execution's frame stack.
    pub frame_index: usize,
    /// Absolute chunk offset of the catch block, if there is one.
    pub catch_ip: Option<usize>,
    /// Absolute chunk offset of the finally block, if there is one.
    pub finally_ip: Option<usize>,
    /// Operand stack depth to restore before entering a handler block.
    pub stack_depth: usize,
    /// Which block is currently running.
    pub state: HandlerState,
    /// The abrupt completion a finally block must finish.
    pub completion: Completion,
}

/// Why an execution stopped.
#[derive(Debug)]
pub enum Outcome {
    /// A script `HALT`; the retained value (if any) is on the stack.
    Halted,
    /// The bottom frame returned this value.
    Returned(Value),
    /// An exception left the execution unhandled.
    Threw(Value),
    /// An `AWAIT` hit a pending promise.
    AwaitPending(ObjRef),
    /// A generator parked at `YIELD` with this value.
    Yielded(Value),
}

/// What kind of execution this is; gates `AWAIT`/`YIELD`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecKind {
    /// The VM's persistent top-level execution, or a module load.
    Script,
    /// An async function body.
    Async,
    /// A generator body.
    Generator,
}

/// One complete execution: operand stack, frames, handlers.
#[derive(Debug)]
pub struct ExecState {
    /// Operand stack; bounded by [`STACK_MAX`].
    pub stack: Vec<Value>,
    /// Call frames; bounded by [`FRAMES_MAX`].
    pub frames: Vec<CallFrame>,
    /// Active exception handlers.
    pub handlers: Vec<HandlerFrame>,
    /// Execution kind.
    pub kind: ExecKind,
    /// Name reported in traces ("eval", a module path, ...).
    pub script_name: String,
}

impl ExecState {
    /// An empty script execution.
    pub fn new(kind: ExecKind, script_name: impl Into<String>) -> Self {
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            handlers: Vec::new(),
            kind,
            script_name: script_name.into(),
        }
    }

    /// Current stack depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

impl Default for ExecState {
    fn default() -> Self {
        ExecState::new(ExecKind::Script, "")
    }
}
