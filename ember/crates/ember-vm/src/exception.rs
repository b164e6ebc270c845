//! The exception model: kind taxonomy, stack traces, and the exception
//! object payload.
//!
//! One exception shape is used everywhere - VM-raised errors, script
//! `throw` of constructed errors, native failures, and the pending
//! exception the embedder reads back. It carries the full context: type
//! name, message, source position, captured stack frames, an optional
//! cause link, and a suppressed list.

use std::fmt;

use crate::value::Value;

/// The error taxonomy available to `throw` and the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Generic error.
    Error,
    /// Wrong operand or argument type.
    Type,
    /// Generic runtime failure.
    Runtime,
    /// Malformed source (also raised by runtime compilation of
    /// interpolation fragments).
    Syntax,
    /// Unresolved name.
    Reference,
    /// Index or argument out of range.
    Range,
    /// Allocation failure or resource exhaustion.
    Memory,
    /// Violated security policy (module path validation, pool limits).
    Security,
    /// File or stream failure.
    Io,
    /// Network failure.
    Network,
    /// Operation timed out.
    Timeout,
    /// Failed assertion.
    Assertion,
    /// Script-defined exception type.
    Custom,
}

impl ExceptionKind {
    /// The canonical type name, as scripts and traces see it.
    pub fn type_name(&self) -> &'static str {
        match self {
            ExceptionKind::Error => "Error",
            ExceptionKind::Type => "TypeError",
            ExceptionKind::Runtime => "RuntimeError",
            ExceptionKind::Syntax => "SyntaxError",
            ExceptionKind::Reference => "ReferenceError",
            ExceptionKind::Range => "RangeError",
            ExceptionKind::Memory => "MemoryError",
            ExceptionKind::Security => "SecurityError",
            ExceptionKind::Io => "IOError",
            ExceptionKind::Network => "NetworkError",
            ExceptionKind::Timeout => "TimeoutError",
            ExceptionKind::Assertion => "AssertionError",
            ExceptionKind::Custom => "CustomError",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// One captured stack frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name ("<script>" at top level).
    pub function: String,
    /// The script or module the frame was executing.
    pub file: String,
    /// Source line.
    pub line: u32,
    /// Source column (0 when unavailable; the line table does not track
    /// columns).
    pub column: u32,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "    at {} ({}:{})", self.function, self.file, self.line)
    }
}

/// The exception object payload.
#[derive(Debug)]
pub struct ExceptionObject {
    /// Which kind of error this is.
    pub kind: ExceptionKind,
    /// Type name; differs from `kind.type_name()` only for
    /// [`ExceptionKind::Custom`].
    pub type_name: String,
    /// Human-readable message.
    pub message: String,
    /// Script or module where the throw happened.
    pub file: String,
    /// Source line of the throw.
    pub line: u32,
    /// Source column of the throw (0 when unavailable).
    pub column: u32,
    /// Call stack captured at throw time, innermost first.
    pub stack_frames: Vec<TraceFrame>,
    /// The exception that caused this one, if chained.
    pub cause: Option<Value>,
    /// Exceptions suppressed while this one propagated (e.g. a throw
    /// replaced by a finally block's own abrupt completion).
    pub suppressed: Vec<Value>,
}

impl ExceptionObject {
    /// Creates an exception with no trace; the VM fills in position and
    /// frames when it materializes one during execution.
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: kind.type_name().to_string(),
            message: message.into(),
            file: String::new(),
            line: 0,
            column: 0,
            stack_frames: Vec::new(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    /// Renders `TypeName: message` plus the captured frames.
    pub fn render_trace(&self) -> String {
        let mut out = format!("{}: {}", self.type_name, self.message);
        for frame in &self.stack_frames {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(ExceptionKind::Type.type_name(), "TypeError");
        assert_eq!(ExceptionKind::Io.type_name(), "IOError");
        assert_eq!(ExceptionKind::Memory.type_name(), "MemoryError");
    }

    #[test]
    fn test_render_trace() {
        let mut exception = ExceptionObject::new(ExceptionKind::Runtime, "stack overflow");
        exception.stack_frames.push(TraceFrame {
            function: "deep".to_string(),
            file: "main.ember".to_string(),
            line: 12,
            column: 0,
        });
        let rendered = exception.render_trace();
        assert!(rendered.starts_with("RuntimeError: stack overflow"));
        assert!(rendered.contains("at deep (main.ember:12)"));
    }
}
