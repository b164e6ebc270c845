//! Single-pass compiler core: token plumbing, bytecode emission,
//! backpatching, scopes, and the loop/try context stacks.
//!
//! The expression grammar lives in `expr` (Pratt rules) and the statement
//! grammar in `stmt`; both are `impl Compiler` blocks. This module owns
//! everything they share.

mod expr;
mod stmt;

pub use expr::Precedence;

use std::mem;
use std::sync::Arc;

use ember_lex::{Lexer, Token, TokenKind};
use ember_util::{Handler, Span};

use crate::chunk::Chunk;
use crate::opcode::{OpCode, NO_JUMP};
use crate::{
    CompileError, Constant, Function, FunctionKind, MAX_LOCALS, MAX_LOOP_DEPTH, MAX_TRY_DEPTH,
};

/// A named local slot in the current function.
#[derive(Debug)]
struct Local {
    /// Variable name (params, catch bindings, `this`).
    name: String,
    /// Scope depth the local was declared at.
    depth: u32,
}

/// Backpatch bookkeeping for one active loop or switch.
///
/// `continue` jumps backward to a target that is already known when the
/// body compiles; `break` jumps forward, so its operand offsets collect
/// here until the loop end is reached and they can be patched.
#[derive(Debug)]
struct LoopContext {
    /// Absolute code offset `continue` loops back to (unused for switch).
    continue_target: usize,
    /// Operand offsets of pending `break` jumps.
    breaks: Vec<usize>,
    /// Whether this context is a `switch` (breakable, not continuable).
    is_switch: bool,
    /// How many try contexts were open when this context was entered;
    /// `break`/`continue` close any opened since.
    open_tries: usize,
}

/// Bookkeeping for one active `try` statement.
#[derive(Debug)]
struct TryContext {
    /// Code offset of the `TRY_BEGIN` operand pair (catch, finally slots).
    begin_operands: usize,
    /// Absolute start of the catch block, once known.
    catch_start: Option<usize>,
    /// Absolute start of the finally block, once known.
    finally_start: Option<usize>,
}

/// Per-function compilation state.
///
/// Function bodies compile recursively; entering one pushes a fresh
/// context and the previous context is parked in `enclosing`.
struct FunctionCtx {
    /// The function being assembled.
    function: Function,
    /// Declared locals; slot 0 is the callee/`this` slot.
    locals: Vec<Local>,
    /// Current block nesting depth.
    scope_depth: u32,
    /// Active loops and switches.
    loops: Vec<LoopContext>,
    /// Active try statements.
    tries: Vec<TryContext>,
    /// The parked enclosing context.
    enclosing: Option<Box<FunctionCtx>>,
}

impl FunctionCtx {
    fn new(name: &str, kind: FunctionKind) -> Self {
        // Slot 0 holds the callee; inside methods it is addressable
        // as `this`.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            function: Function::new(name, kind),
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
            }],
            scope_depth: 0,
            loops: Vec::new(),
            tries: Vec::new(),
            enclosing: None,
        }
    }
}

/// The single-pass compiler.
///
/// Drives the lexer one token at a time and emits bytecode directly into
/// the current function's chunk. Errors go through the diagnostic
/// handler; after the first error the compiler enters panic mode and
/// synchronizes at the next statement boundary, so one mistake does not
/// cascade into a wall of messages.
pub struct Compiler<'a> {
    /// Token source.
    lexer: Lexer<'a>,

    /// Diagnostic sink.
    handler: &'a Handler,

    /// Most recently consumed token.
    pub(crate) previous: Token,

    /// Lookahead token.
    pub(crate) current: Token,

    /// Whether any error has been reported.
    had_error: bool,

    /// Suppress error reporting until the next synchronization point.
    panic_mode: bool,

    /// Current function being compiled.
    ctx: FunctionCtx,

    /// Stack of enclosing class declarations: `true` if the class has a
    /// superclass (gates `super`).
    class_stack: Vec<bool>,
}

impl<'a> Compiler<'a> {
    /// Creates a compiler over `source`, reporting into `handler`.
    pub fn new(source: &'a str, handler: &'a Handler) -> Self {
        let placeholder = Token::new(TokenKind::Eof, Span::DUMMY);
        Self {
            lexer: Lexer::new(source),
            handler,
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
            ctx: FunctionCtx::new("", FunctionKind::Script),
            class_stack: Vec::new(),
        }
    }

    /// Compiles the whole source as a top-level script.
    pub fn compile_script(mut self, name: &str) -> Result<Arc<Function>, CompileError> {
        self.ctx.function.name = name.to_string();
        self.advance();
        while !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.emit_op(OpCode::Halt);
        self.finish()
    }

    /// Compiles a single expression as a zero-argument function body.
    pub fn compile_expression_fragment(mut self) -> Result<Arc<Function>, CompileError> {
        self.ctx.function.kind = FunctionKind::Function;
        self.ctx.function.name = "<interp>".to_string();
        self.advance();
        self.expression();
        self.consume(&TokenKind::Eof, "expected a single expression");
        self.emit_op(OpCode::Return);
        self.finish()
    }

    fn finish(self) -> Result<Arc<Function>, CompileError> {
        if self.had_error {
            Err(CompileError::Failed {
                count: self.handler.error_count(),
                rendered: self.handler.render(),
            })
        } else {
            Ok(Arc::new(self.ctx.function))
        }
    }

    // =========================================================================
    // TOKEN PLUMBING
    // =========================================================================

    /// Advances to the next token, surfacing lexical errors.
    pub(crate) fn advance(&mut self) {
        self.previous = mem::replace(
            &mut self.current,
            Token::new(TokenKind::Eof, Span::DUMMY),
        );
        loop {
            let token = self.lexer.next_token();
            if let TokenKind::Error(message) = &token.kind {
                let message = message.clone();
                let span = token.span;
                self.error_at_span(span, message);
                continue;
            }
            self.current = token;
            break;
        }
    }

    /// Whether the lookahead token has the same kind as `kind`
    /// (payloads ignored).
    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        mem::discriminant(&self.current.kind) == mem::discriminant(kind)
    }

    /// Consumes the lookahead if it matches `kind`.
    pub(crate) fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consumes the lookahead or reports `message`.
    pub(crate) fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    /// Consumes an identifier and returns its name, or reports `message`.
    pub(crate) fn consume_ident(&mut self, message: &str) -> String {
        if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            self.advance();
            name
        } else {
            self.error_at_current(message);
            String::new()
        }
    }

    /// The source line of the most recently consumed token.
    #[inline]
    pub(crate) fn line(&self) -> u32 {
        self.previous.span.line
    }

    /// Whether the compiler is currently in panic mode.
    #[inline]
    pub(crate) fn is_panicking(&self) -> bool {
        self.panic_mode
    }

    /// Current length of the chunk being emitted into.
    #[inline]
    pub(crate) fn code_len(&self) -> usize {
        self.ctx.function.chunk.len()
    }

    /// Current block nesting depth.
    #[inline]
    pub(crate) fn scope_depth(&self) -> u32 {
        self.ctx.scope_depth
    }

    // =========================================================================
    // ERROR REPORTING
    // =========================================================================

    pub(crate) fn error(&mut self, message: impl Into<String>) {
        let span = self.previous.span;
        self.error_at_span(span, message);
    }

    pub(crate) fn error_at_current(&mut self, message: impl Into<String>) {
        let span = self.current.span;
        self.error_at_span(span, message);
    }

    fn error_at_span(&mut self, span: Span, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.handler.error(message, span);
    }

    /// Skips tokens until a likely statement boundary, leaving panic mode.
    pub(crate) fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if matches!(self.previous.kind, TokenKind::Semicolon) {
                return;
            }
            if matches!(
                self.current.kind,
                TokenKind::Class
                    | TokenKind::Fn
                    | TokenKind::Function
                    | TokenKind::If
                    | TokenKind::While
                    | TokenKind::For
                    | TokenKind::Return
                    | TokenKind::Try
                    | TokenKind::Throw
                    | TokenKind::Switch
                    | TokenKind::Import
                    | TokenKind::Export
            ) {
                return;
            }
            // Newlines are statement terminators too.
            if self.current.span.line > self.previous.span.line {
                return;
            }
            self.advance();
        }
    }

    // =========================================================================
    // EMISSION
    // =========================================================================

    pub(crate) fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.ctx.function.chunk
    }

    pub(crate) fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk_mut().write_op(op, line);
    }

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk_mut().write_byte(byte, line);
    }

    pub(crate) fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.chunk_mut().write_u16(value, line);
    }

    /// Emits a forward jump with a placeholder operand; returns the
    /// operand offset for [`Compiler::patch_jump`].
    pub(crate) fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let operand = self.ctx.function.chunk.len();
        self.emit_u16(NO_JUMP);
        operand
    }

    /// Patches a forward jump to land on the current code position.
    pub(crate) fn patch_jump(&mut self, operand: usize) {
        let target = self.ctx.function.chunk.len();
        self.patch_jump_to(operand, target);
    }

    /// Patches a forward jump to land on `target`.
    pub(crate) fn patch_jump_to(&mut self, operand: usize, target: usize) {
        let distance = target - operand - 2;
        if distance >= NO_JUMP as usize {
            self.error("jump offset too large");
            return;
        }
        self.patch_u16(operand, distance as u16);
    }

    /// Overwrites the u16 at `operand` (big-endian).
    pub(crate) fn patch_u16(&mut self, operand: usize, value: u16) {
        self.ctx.function.chunk.code[operand] = (value >> 8) as u8;
        self.ctx.function.chunk.code[operand + 1] = (value & 0xFF) as u8;
    }

    /// Emits a backward jump (`LOOP` or `CONTINUE`) to `target`.
    pub(crate) fn emit_loop(&mut self, op: OpCode, target: usize) {
        self.emit_op(op);
        // The VM subtracts the operand after having read it.
        let distance = self.ctx.function.chunk.len() + 2 - target;
        if distance > NO_JUMP as usize {
            self.error("loop body too large");
            self.emit_u16(NO_JUMP);
            return;
        }
        self.emit_u16(distance as u16);
    }

    /// Adds a constant to the current chunk, reporting pool exhaustion.
    pub(crate) fn make_constant(&mut self, constant: Constant) -> u8 {
        match self.chunk_mut().add_constant(constant) {
            Some(index) => index,
            None => {
                self.error("too many constants in one chunk");
                0
            }
        }
    }

    /// Emits `PUSH_CONST` for the given constant.
    pub(crate) fn emit_constant(&mut self, constant: Constant) {
        let index = self.make_constant(constant);
        self.emit_op(OpCode::PushConst);
        self.emit_byte(index);
    }

    /// Interns an identifier name into the constant pool.
    pub(crate) fn identifier_constant(&mut self, name: &str) -> u8 {
        self.make_constant(Constant::Str(name.to_string()))
    }

    // =========================================================================
    // SCOPES AND LOCALS
    // =========================================================================

    pub(crate) fn begin_scope(&mut self) {
        self.ctx.scope_depth += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        self.ctx.scope_depth -= 1;
        while self
            .ctx
            .locals
            .last()
            .is_some_and(|local| local.depth > self.ctx.scope_depth)
        {
            self.ctx.locals.pop();
            self.emit_op(OpCode::Pop);
        }
    }

    /// Declares a local in the current scope and returns its slot.
    pub(crate) fn add_local(&mut self, name: &str) -> u8 {
        if self.ctx.locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return 0;
        }
        let depth = self.ctx.scope_depth;
        if self
            .ctx
            .locals
            .iter()
            .any(|local| local.depth == depth && local.name == name)
        {
            self.error(format!("duplicate variable '{name}' in this scope"));
        }
        self.ctx.locals.push(Local {
            name: name.to_string(),
            depth,
        });
        (self.ctx.locals.len() - 1) as u8
    }

    /// Resolves a name to a local slot, if it is one.
    pub(crate) fn resolve_local(&self, name: &str) -> Option<u8> {
        self.ctx
            .locals
            .iter()
            .rposition(|local| local.name == name)
            .map(|index| index as u8)
    }

    // =========================================================================
    // FUNCTION NESTING
    // =========================================================================

    /// Enters a nested function context.
    pub(crate) fn push_function(&mut self, name: &str, kind: FunctionKind) {
        let fresh = FunctionCtx::new(name, kind);
        let parked = mem::replace(&mut self.ctx, fresh);
        self.ctx.enclosing = Some(Box::new(parked));
    }

    /// Leaves the current function context, returning the finished
    /// function.
    pub(crate) fn pop_function(&mut self) -> Arc<Function> {
        // Implicit return for bodies that fall off the end.
        match self.ctx.function.kind {
            FunctionKind::Initializer => {
                self.emit_op(OpCode::GetLocal);
                self.emit_byte(0);
            }
            _ => {
                self.emit_constant(Constant::Nil);
            }
        }
        self.emit_op(OpCode::Return);

        let enclosing = self
            .ctx
            .enclosing
            .take()
            .expect("pop_function without matching push_function");
        let finished = mem::replace(&mut self.ctx, *enclosing);
        Arc::new(finished.function)
    }

    /// Current function kind.
    #[inline]
    pub(crate) fn function_kind(&self) -> FunctionKind {
        self.ctx.function.kind
    }

    /// Marks the current function as a generator (seen `yield`).
    pub(crate) fn mark_generator(&mut self) -> bool {
        match self.ctx.function.kind {
            FunctionKind::Function | FunctionKind::Generator => {
                self.ctx.function.kind = FunctionKind::Generator;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_arity(&mut self, arity: u8) {
        self.ctx.function.arity = arity;
    }

    // =========================================================================
    // LOOP / TRY CONTEXTS
    // =========================================================================

    /// Pushes a loop (or switch) context. Reports when the nesting budget
    /// is exhausted.
    pub(crate) fn push_loop(&mut self, continue_target: usize, is_switch: bool) {
        if self.ctx.loops.len() >= MAX_LOOP_DEPTH {
            self.error("too many nested loops");
        }
        let open_tries = self.ctx.tries.len();
        self.ctx.loops.push(LoopContext {
            continue_target,
            breaks: Vec::new(),
            is_switch,
            open_tries,
        });
    }

    /// Pops the innermost loop context and patches its pending breaks.
    pub(crate) fn pop_loop(&mut self) {
        let context = self
            .ctx
            .loops
            .pop()
            .expect("pop_loop without matching push_loop");
        for operand in context.breaks {
            self.patch_jump(operand);
        }
    }

    /// Emits a `break`: close protected regions opened inside the target
    /// context, then jump forward to be patched at the context's end.
    pub(crate) fn emit_break(&mut self) {
        let Some(index) = self.ctx.loops.len().checked_sub(1) else {
            self.error("'break' outside loop or switch");
            return;
        };
        let open_tries = self.ctx.loops[index].open_tries;
        self.close_tries_down_to(open_tries);
        let operand = self.emit_jump(OpCode::Break);
        self.ctx.loops[index].breaks.push(operand);
    }

    /// Emits a `continue` targeting the innermost non-switch loop.
    pub(crate) fn emit_continue(&mut self) {
        let Some(index) = self.ctx.loops.iter().rposition(|l| !l.is_switch) else {
            self.error("'continue' outside loop");
            return;
        };
        let open_tries = self.ctx.loops[index].open_tries;
        let target = self.ctx.loops[index].continue_target;
        self.close_tries_down_to(open_tries);
        self.emit_loop(OpCode::Continue, target);
    }

    /// Emits pop-only `TRY_END`s for try contexts deeper than `depth`.
    fn close_tries_down_to(&mut self, depth: usize) {
        let open = self.ctx.tries.len();
        for _ in depth..open {
            self.emit_op(OpCode::TryEnd);
            self.emit_u16(NO_JUMP);
        }
    }

    /// Pushes a try context. The depth budget overflowing is a compile
    /// error, but the context is pushed regardless so `pop_try` stays
    /// balanced and parsing can continue.
    pub(crate) fn push_try(&mut self, begin_operands: usize) {
        if self.ctx.tries.len() >= MAX_TRY_DEPTH {
            self.error("too many nested try blocks");
        }
        self.ctx.tries.push(TryContext {
            begin_operands,
            catch_start: None,
            finally_start: None,
        });
    }

    /// Records the catch block start and patches `TRY_BEGIN`.
    pub(crate) fn mark_catch_start(&mut self) {
        let here = self.ctx.function.chunk.len();
        if here > NO_JUMP as usize {
            self.error("jump offset too large");
        }
        if let Some(context) = self.ctx.tries.last_mut() {
            context.catch_start = Some(here);
            let operand = context.begin_operands;
            self.patch_u16(operand, here as u16);
        }
    }

    /// Records the finally block start, patches `TRY_BEGIN`, and returns
    /// the offset so the normal-completion jumps can target it.
    pub(crate) fn mark_finally_start(&mut self) -> usize {
        let here = self.ctx.function.chunk.len();
        if here > NO_JUMP as usize {
            self.error("jump offset too large");
        }
        if let Some(context) = self.ctx.tries.last_mut() {
            context.finally_start = Some(here);
            let operand = context.begin_operands + 2;
            self.patch_u16(operand, here as u16);
        }
        here
    }

    /// Pops the innermost try context, checking that at least one
    /// handler block was attached.
    pub(crate) fn pop_try(&mut self) {
        let context = self
            .ctx
            .tries
            .pop()
            .expect("pop_try without matching push_try");
        if context.catch_start.is_none() && context.finally_start.is_none() {
            self.error("try statement requires at least 'catch' or 'finally'");
        }
    }

    // =========================================================================
    // CLASS CONTEXTS
    // =========================================================================

    pub(crate) fn push_class(&mut self, has_superclass: bool) {
        self.class_stack.push(has_superclass);
    }

    pub(crate) fn pop_class(&mut self) {
        self.class_stack.pop();
    }

    pub(crate) fn in_class_with_superclass(&self) -> bool {
        self.class_stack.last().copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ember_util::Handler;

    use crate::opcode::{OpCode, NO_JUMP};
    use crate::{compile, Constant, Function, FunctionKind};

    fn compile_ok(source: &str) -> Arc<Function> {
        let handler = Handler::new();
        compile(source, "test", &handler).expect("expected successful compile")
    }

    fn compile_err(source: &str) -> String {
        let handler = Handler::new();
        match compile(source, "test", &handler) {
            Ok(_) => panic!("expected compile error for: {source}"),
            Err(err) => err.to_string(),
        }
    }

    /// Walks a chunk instruction by instruction, returning each opcode
    /// with the offset of its (first) operand.
    fn opcodes(function: &Function) -> Vec<(OpCode, usize)> {
        let chunk = &function.chunk;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.len() {
            let op = OpCode::decode(chunk.read_byte(offset)).expect("invalid opcode in chunk");
            out.push((op, offset + 1));
            offset += 1 + match op {
                OpCode::PushConst
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::SetGlobal
                | OpCode::Call
                | OpCode::ArrayNew
                | OpCode::HashMapNew
                | OpCode::ClassDef
                | OpCode::MethodDef
                | OpCode::InstanceNew
                | OpCode::GetProperty
                | OpCode::SetProperty
                | OpCode::GetSuper
                | OpCode::CatchBegin
                | OpCode::StringInterpolate => 1,
                OpCode::Invoke => 2,
                OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::Loop
                | OpCode::Break
                | OpCode::Continue
                | OpCode::Case
                | OpCode::TryEnd
                | OpCode::CatchEnd => 2,
                OpCode::TryBegin => 4,
                _ => 0,
            };
        }
        out
    }

    #[test]
    fn test_arithmetic_ends_with_halt_and_retains_value() {
        let script = compile_ok("((10 + 5) * 2) - (3 + 7)");
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert_eq!(ops.last(), Some(&OpCode::Halt));
        // The final expression value must survive to the top of the stack.
        assert!(!ops.contains(&OpCode::Pop));
    }

    #[test]
    fn test_non_final_expressions_are_popped() {
        let script = compile_ok("1 + 2\n3 + 4");
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        let pops = ops.iter().filter(|op| **op == OpCode::Pop).count();
        assert_eq!(pops, 1);
    }

    #[test]
    fn test_two_statements_on_one_line_need_separator() {
        let message = compile_err("x = 1 y = 2");
        assert!(message.contains("expected newline or ';'"), "{message}");
        // With the separator it compiles.
        compile_ok("x = 1; y = 2");
    }

    #[test]
    fn test_every_break_and_continue_is_patched() {
        let script = compile_ok(
            "for (i = 0; i < 10; i = i + 1) {\n\
             if (i == 4) break\n\
             if (i == 2) continue\n\
             print(i)\n\
             }",
        );
        for (op, operand) in opcodes(&script) {
            if matches!(op, OpCode::Jump | OpCode::JumpIfFalse | OpCode::Break) {
                assert_ne!(
                    script.chunk.read_u16(operand),
                    NO_JUMP,
                    "unpatched forward jump at operand {operand}"
                );
            }
            if matches!(op, OpCode::Loop | OpCode::Continue) {
                let distance = script.chunk.read_u16(operand) as usize;
                // A backward jump must land inside the chunk.
                assert!(distance <= operand + 2, "backward jump out of range");
            }
        }
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        let message = compile_err("break");
        assert!(message.contains("'break' outside loop"), "{message}");
    }

    #[test]
    fn test_continue_inside_switch_targets_enclosing_loop() {
        compile_ok(
            "while (x < 3) { switch (x) { case 1: continue } }",
        );
        let message = compile_err("switch (x) { case 1: continue }");
        assert!(message.contains("'continue' outside loop"), "{message}");
    }

    #[test]
    fn test_loop_nesting_budget() {
        // Nine nested loops exceed the budget of eight.
        let mut source = String::new();
        for _ in 0..9 {
            source.push_str("while (true) { ");
        }
        source.push_str("x = 1 ");
        for _ in 0..9 {
            source.push('}');
        }
        let message = compile_err(&source);
        assert!(message.contains("too many nested loops"), "{message}");
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        let message = compile_err("try { x = 1 }");
        assert!(message.contains("requires at least"), "{message}");
    }

    #[test]
    fn test_try_catch_finally_shape() {
        let script = compile_ok(
            "try { throw \"boom\" } catch (e) { print(e) } finally { print(\"done\") }",
        );
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        for expected in [
            OpCode::TryBegin,
            OpCode::Throw,
            OpCode::TryEnd,
            OpCode::CatchBegin,
            OpCode::CatchEnd,
            OpCode::FinallyBegin,
            OpCode::FinallyEnd,
        ] {
            assert!(ops.contains(&expected), "missing {expected:?}");
        }
        // TRY_BEGIN's catch and finally operands must both be patched.
        let (_, operand) = opcodes(&script)
            .into_iter()
            .find(|(op, _)| *op == OpCode::TryBegin)
            .unwrap();
        assert_ne!(script.chunk.read_u16(operand), NO_JUMP);
        assert_ne!(script.chunk.read_u16(operand + 2), NO_JUMP);
    }

    #[test]
    fn test_function_declaration() {
        let script = compile_ok("fn add(a, b) { return a + b }\nadd(1, 2)");
        let function = script
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("function constant missing");
        assert_eq!(function.name, "add");
        assert_eq!(function.arity, 2);
        assert_eq!(function.kind, FunctionKind::Function);
    }

    #[test]
    fn test_yield_marks_generator() {
        let script = compile_ok("fn counter() { yield 1\nyield 2 }");
        let function = script
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(function.kind, FunctionKind::Generator);
    }

    #[test]
    fn test_await_outside_async_is_an_error() {
        let message = compile_err("fn f(p) { return await p }");
        assert!(message.contains("'await' outside"), "{message}");
        compile_ok("async fn f(p) { return await p }");
    }

    #[test]
    fn test_class_declaration() {
        let script = compile_ok(
            "class Point {\n\
             fn init(x, y) { this.x = x\nthis.y = y }\n\
             fn len() { return this.x + this.y }\n\
             }\n\
             p = new Point(3, 4)",
        );
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert!(ops.contains(&OpCode::ClassDef));
        assert!(ops.contains(&OpCode::MethodDef));
        assert!(ops.contains(&OpCode::InstanceNew));
    }

    #[test]
    fn test_this_outside_method_is_an_error() {
        let message = compile_err("x = this");
        assert!(message.contains("'this' outside"), "{message}");
    }

    #[test]
    fn test_super_requires_superclass() {
        let message =
            compile_err("class A { fn m() { return super.m() } }");
        assert!(message.contains("no superclass"), "{message}");
        compile_ok(
            "class A { fn m() { return 1 } }\n\
             class B extends A { fn m() { return super.m() + 1 } }",
        );
    }

    #[test]
    fn test_import_forms() {
        compile_ok("import \"util\"");
        compile_ok("import { sq, cube as c } from \"math\"");
        compile_ok("import * as math from \"math\"");
        compile_ok("import math from \"math\"");
        let script = compile_ok("import { a } from \"m\"");
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert!(ops.contains(&OpCode::HashMapGet));
    }

    #[test]
    fn test_export_forms() {
        compile_ok("export fn f() { return 1 }");
        compile_ok("export x = 42");
        compile_ok("export default 42");
        compile_ok("f = 1\ng = 2\nexport { f, g }");
        compile_ok("export { a as b } from \"m\"");
    }

    #[test]
    fn test_switch_compiles_case_and_default() {
        let script = compile_ok(
            "switch (x) {\n\
             case 1: print(\"one\")\nbreak\n\
             case 2: print(\"two\")\nbreak\n\
             default: print(\"other\")\n\
             }",
        );
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert_eq!(ops.iter().filter(|op| **op == OpCode::Case).count(), 2);
        assert!(ops.contains(&OpCode::Default));
    }

    #[test]
    fn test_regex_intrinsics_lower_to_opcodes() {
        let script = compile_ok("r = regex(\"[0-9]+\", \"\")\nregex_test(r, \"42\")");
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert!(ops.contains(&OpCode::RegexNew));
        assert!(ops.contains(&OpCode::RegexTest));
        assert!(!ops.contains(&OpCode::Call));
    }

    #[test]
    fn test_interpolated_string_constant() {
        let script = compile_ok("name = \"world\"\ngreeting = \"hello ${name}\"");
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert!(ops.contains(&OpCode::StringInterpolate));
        assert!(script
            .chunk
            .constants
            .iter()
            .any(|c| matches!(c, Constant::InterpolatedStr(raw) if raw == "hello ${name}")));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let message = compile_err("1 + 2 = 3");
        assert!(message.contains("invalid assignment target"), "{message}");
    }

    #[test]
    fn test_error_recovery_reports_multiple_errors() {
        let handler = Handler::new();
        let result = compile("x = \ny = )\nbreak", "test", &handler);
        assert!(result.is_err());
        assert!(handler.error_count() >= 2);
    }

    #[test]
    fn test_compound_assignment() {
        let script = compile_ok("x = 1\nx += 2\nx *= 3");
        let ops: Vec<OpCode> = opcodes(&script).iter().map(|(op, _)| *op).collect();
        assert!(ops.contains(&OpCode::Add));
        assert!(ops.contains(&OpCode::Mul));
    }

    #[test]
    fn test_fragment_compilation() {
        let handler = Handler::new();
        let fragment = crate::compile_fragment("a + b * 2", &handler).unwrap();
        let ops: Vec<OpCode> = opcodes(&fragment).iter().map(|(op, _)| *op).collect();
        assert_eq!(ops.last(), Some(&OpCode::Return));
    }
}
