//! Bytecode instruction opcodes for the Ember VM.
//!
//! Each opcode is a single byte; operands follow inline in the code
//! stream. Jump operands are two bytes (big-endian), constant-pool and
//! slot operands are one byte.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sentinel jump operand meaning "no target" (pop-only `TRY_END`,
/// `TRY_BEGIN` with no catch or no finally clause).
pub const NO_JUMP: u16 = u16::MAX;

/// Sentinel slot operand meaning "no local binding" (`CATCH_BEGIN` of a
/// catch clause without a variable).
pub const NO_SLOT: u8 = u8::MAX;

/// A single-byte VM instruction.
///
/// The operand layout of each instruction is listed with the variant.
/// Stack effects are written `[before] -> [after]`, top of stack last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // === Constants and stack ===
    /// Push constant. Operand: pool index. `[] -> [value]`
    PushConst,
    /// Discard top of stack. `[value] -> []`
    Pop,

    // === Locals and globals ===
    /// Push a local slot. Operand: slot. `[] -> [value]`
    GetLocal,
    /// Store top of stack into a local slot without popping. Operand: slot.
    SetLocal,
    /// Push a global by name. Operand: pool index of the name string.
    GetGlobal,
    /// Store top of stack into a global without popping. Operand: pool
    /// index of the name string.
    SetGlobal,

    // === Arithmetic and logic ===
    /// `[a, b] -> [a + b]` (numbers add, strings concatenate).
    Add,
    /// `[a, b] -> [a - b]`
    Sub,
    /// `[a, b] -> [a * b]`
    Mul,
    /// `[a, b] -> [a / b]`
    Div,
    /// `[a, b] -> [a % b]`
    Mod,
    /// Arithmetic negation. `[a] -> [-a]`
    Negate,
    /// Logical negation by truthiness. `[a] -> [!a]`
    Not,
    /// Logical AND over truthiness. `[a, b] -> [bool]`
    And,
    /// Logical OR over truthiness. `[a, b] -> [bool]`
    Or,

    // === Comparison ===
    /// Deep equality. `[a, b] -> [bool]`
    Equal,
    /// `[a, b] -> [bool]`
    NotEqual,
    /// Numeric/string ordering. `[a, b] -> [bool]`
    Less,
    /// `[a, b] -> [bool]`
    LessEqual,
    /// `[a, b] -> [bool]`
    Greater,
    /// `[a, b] -> [bool]`
    GreaterEqual,

    // === Control flow ===
    /// Unconditional forward jump. Operand: u16 offset.
    Jump,
    /// Pop condition; jump forward if falsey. Operand: u16 offset.
    JumpIfFalse,
    /// Unconditional backward jump. Operand: u16 offset (subtracted).
    Loop,
    /// `break` jump; identical semantics to [`OpCode::Jump`], kept as a
    /// distinct opcode so disassembly shows intent.
    Break,
    /// `continue` jump; identical semantics to [`OpCode::Loop`] (the
    /// continue target always precedes the continue site).
    Continue,
    /// Stop the dispatch loop for the current script.
    Halt,
    /// Return from the current call frame; return value on top of stack.
    Return,
    /// Call a callable. Operand: argument count.
    /// `[callee, arg1..argN] -> [result]`
    Call,

    // === Containers ===
    /// Build an array from the top N values. Operand: element count.
    ArrayNew,
    /// Subscript read (arrays, maps, strings). `[target, index] -> [value]`
    ArrayGet,
    /// Subscript write (arrays, maps). `[target, index, value] -> [value]`
    ArraySet,
    /// Build a map from the top N key/value pairs. Operand: pair count.
    HashMapNew,
    /// Map-specific key lookup (used by import extraction).
    /// `[map, key] -> [value]`
    HashMapGet,

    // === Classes and instances ===
    /// Define a class. Operand: pool index of the name. `[] -> [class]`
    ClassDef,
    /// Wire up inheritance. `[class, superclass] -> [class]`
    Inherit,
    /// Install a method into the class below it on the stack.
    /// Operand: pool index of the method name. `[class, fn] -> [class]`
    MethodDef,
    /// Instantiate the class under the arguments, running `init` if the
    /// class defines one. Operand: argument count.
    /// `[class, arg1..argN] -> [instance]`
    InstanceNew,
    /// Method-call fast path. Operands: pool index of the name, argument
    /// count. `[receiver, arg1..argN] -> [result]`
    Invoke,
    /// Property read. Operand: pool index of the name.
    /// `[object] -> [value]`
    GetProperty,
    /// Property write. Operand: pool index of the name.
    /// `[object, value] -> [value]`
    SetProperty,
    /// Superclass method lookup bound to `this`. Operand: pool index of
    /// the method name. `[receiver] -> [bound_method]`
    GetSuper,

    // === Exceptions ===
    /// Push a handler frame. Operands: u16 catch offset, u16 finally
    /// offset ([`NO_JUMP`] when the clause is absent).
    TryBegin,
    /// Normal completion of a try body. Operand: u16 offset to the
    /// finally block (or past the handler blocks); [`NO_JUMP`] means pop
    /// the handler without jumping (emitted before `break`/`continue`
    /// out of a protected region).
    TryEnd,
    /// Bind the thrown exception. Operand: local slot, [`NO_SLOT`] to
    /// discard. `[exception] -> []` (the value becomes the local).
    CatchBegin,
    /// Normal completion of a catch body. Operand: u16 offset to the
    /// finally block or past the handler.
    CatchEnd,
    /// Start of a finally block. Marker only.
    FinallyBegin,
    /// End of a finally block: re-raise the pending completion, if any.
    FinallyEnd,
    /// Throw the value on top of the stack. `[exception] -> []`
    Throw,

    // === Coroutines ===
    /// Suspend an async function on the promise at top of stack.
    Await,
    /// Suspend a generator, yielding the value at top of stack.
    Yield,

    // === Regex ===
    /// Compile a regex. `[pattern, flags] -> [regex]`
    RegexNew,
    /// `[regex, text] -> [bool]`
    RegexTest,
    /// `[regex, text] -> [array_of_groups | nil]`
    RegexMatch,
    /// `[regex, text, replacement] -> [string]`
    RegexReplace,
    /// `[regex, text] -> [array]`
    RegexSplit,

    // === Strings ===
    /// Rescan and evaluate an interpolated-string constant. Operand: pool
    /// index of the raw body. `[] -> [string]`
    StringInterpolate,

    // === Switch helpers ===
    /// Compare the case value against the switch value beneath it; on
    /// mismatch pop the case value and jump. On match pop both and fall
    /// through. Operand: u16 offset to the next case test.
    Case,
    /// Pop the switch value and fall into the default body.
    Default,
}

impl OpCode {
    /// Decodes a byte into an opcode, if valid.
    #[inline]
    pub fn decode(byte: u8) -> Option<OpCode> {
        OpCode::try_from(byte).ok()
    }

    /// Human-readable mnemonic for disassembly.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::PushConst => "PUSH_CONST",
            OpCode::Pop => "POP",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Negate => "NEGATE",
            OpCode::Not => "NOT",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Equal => "EQUAL",
            OpCode::NotEqual => "NOT_EQUAL",
            OpCode::Less => "LESS",
            OpCode::LessEqual => "LESS_EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::GreaterEqual => "GREATER_EQUAL",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Loop => "LOOP",
            OpCode::Break => "BREAK",
            OpCode::Continue => "CONTINUE",
            OpCode::Halt => "HALT",
            OpCode::Return => "RETURN",
            OpCode::Call => "CALL",
            OpCode::ArrayNew => "ARRAY_NEW",
            OpCode::ArrayGet => "ARRAY_GET",
            OpCode::ArraySet => "ARRAY_SET",
            OpCode::HashMapNew => "HASH_MAP_NEW",
            OpCode::HashMapGet => "HASH_MAP_GET",
            OpCode::ClassDef => "CLASS_DEF",
            OpCode::Inherit => "INHERIT",
            OpCode::MethodDef => "METHOD_DEF",
            OpCode::InstanceNew => "INSTANCE_NEW",
            OpCode::Invoke => "INVOKE",
            OpCode::GetProperty => "GET_PROPERTY",
            OpCode::SetProperty => "SET_PROPERTY",
            OpCode::GetSuper => "GET_SUPER",
            OpCode::TryBegin => "TRY_BEGIN",
            OpCode::TryEnd => "TRY_END",
            OpCode::CatchBegin => "CATCH_BEGIN",
            OpCode::CatchEnd => "CATCH_END",
            OpCode::FinallyBegin => "FINALLY_BEGIN",
            OpCode::FinallyEnd => "FINALLY_END",
            OpCode::Throw => "THROW",
            OpCode::Await => "AWAIT",
            OpCode::Yield => "YIELD",
            OpCode::RegexNew => "REGEX_NEW",
            OpCode::RegexTest => "REGEX_TEST",
            OpCode::RegexMatch => "REGEX_MATCH",
            OpCode::RegexReplace => "REGEX_REPLACE",
            OpCode::RegexSplit => "REGEX_SPLIT",
            OpCode::StringInterpolate => "STRING_INTERPOLATE",
            OpCode::Case => "CASE",
            OpCode::Default => "DEFAULT",
        }
    }
}
