//! Statement compilation: control flow, functions, classes, exception
//! handling, switch, and module import/export lowering.

use ember_lex::TokenKind;

use super::Compiler;
use crate::opcode::{OpCode, NO_SLOT};
use crate::{Constant, FunctionKind};

impl<'a> Compiler<'a> {
    /// Compiles one declaration or statement, synchronizing afterwards if
    /// an error put the compiler into panic mode.
    pub(crate) fn declaration(&mut self) {
        if self.match_token(&TokenKind::Fn) || self.match_token(&TokenKind::Function) {
            self.fn_declaration(false);
        } else if self.match_token(&TokenKind::Async) {
            if !self.match_token(&TokenKind::Fn) && !self.match_token(&TokenKind::Function) {
                self.error_at_current("expected 'fn' after 'async'");
            }
            self.fn_declaration(true);
        } else if self.match_token(&TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(&TokenKind::Import) {
            self.import_declaration();
        } else if self.match_token(&TokenKind::Export) {
            self.export_declaration();
        } else {
            self.statement();
        }

        if self.is_panicking() {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(&TokenKind::If) {
            self.if_statement();
        } else if self.match_token(&TokenKind::While) {
            self.while_statement();
        } else if self.match_token(&TokenKind::For) {
            self.for_statement();
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(&TokenKind::Break) {
            self.emit_break();
            self.consume_statement_end();
        } else if self.match_token(&TokenKind::Continue) {
            self.emit_continue();
            self.consume_statement_end();
        } else if self.match_token(&TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_token(&TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(&TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(&TokenKind::Yield) {
            self.yield_statement();
        } else if self.match_token(&TokenKind::Do) {
            self.error("'do' is reserved and has no statement form");
        } else if self.match_token(&TokenKind::LBrace) {
            self.block();
        } else {
            self.expression_statement();
        }
    }

    /// Statements end at a `;`, a newline, a closing brace, or the end
    /// of input.
    pub(crate) fn consume_statement_end(&mut self) {
        if self.match_token(&TokenKind::Semicolon) {
            return;
        }
        if self.check(&TokenKind::RBrace) || self.check(&TokenKind::Eof) {
            return;
        }
        if self.current.span.line > self.previous.span.line {
            return;
        }
        self.error_at_current("expected newline or ';' after statement");
    }

    /// Whether the lookahead already terminates the current statement
    /// (used for bare `return` and bare `yield`).
    fn at_statement_end(&self) -> bool {
        self.check(&TokenKind::Semicolon)
            || self.check(&TokenKind::RBrace)
            || self.check(&TokenKind::Eof)
            || self.current.span.line > self.previous.span.line
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume_statement_end();
        // The final top-level expression of a script keeps its value on
        // the stack; everything else is popped.
        let retain = self.function_kind() == FunctionKind::Script
            && self.scope_depth() == 0
            && self.check(&TokenKind::Eof);
        if !retain {
            self.emit_op(OpCode::Pop);
        }
    }

    fn block(&mut self) {
        self.begin_scope();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RBrace, "expected '}' after block");
        self.end_scope();
    }

    // =========================================================================
    // CONTROL FLOW
    // =========================================================================

    fn if_statement(&mut self) {
        self.consume(&TokenKind::LParen, "expected '(' after 'if'");
        self.expression();
        self.consume(&TokenKind::RParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);

        if self.match_token(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.consume(&TokenKind::LParen, "expected '(' after 'while'");
        self.expression();
        self.consume(&TokenKind::RParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.push_loop(loop_start, false);
        self.statement();
        self.emit_loop(OpCode::Loop, loop_start);
        self.patch_jump(exit_jump);
        self.pop_loop();
    }

    fn for_statement(&mut self) {
        self.consume(&TokenKind::LParen, "expected '(' after 'for'");

        // Initializer clause.
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(&TokenKind::Semicolon, "expected ';' after loop initializer");
        }

        let loop_start = self.code_len();

        // Condition clause.
        let exit_jump = if self.match_token(&TokenKind::Semicolon) {
            None
        } else {
            self.expression();
            self.consume(&TokenKind::Semicolon, "expected ';' after loop condition");
            Some(self.emit_jump(OpCode::JumpIfFalse))
        };

        // Increment clause runs after the body, so the body is emitted
        // first in execution order by jumping over the increment code.
        let continue_target = if self.check(&TokenKind::RParen) {
            loop_start
        } else {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.emit_loop(OpCode::Loop, loop_start);
            self.patch_jump(body_jump);
            increment_start
        };
        self.consume(&TokenKind::RParen, "expected ')' after for clauses");

        self.push_loop(continue_target, false);
        self.statement();
        self.emit_loop(OpCode::Loop, continue_target);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
        }
        self.pop_loop();
    }

    fn return_statement(&mut self) {
        match self.function_kind() {
            FunctionKind::Script => {
                self.error("cannot return from top-level code");
            }
            FunctionKind::Initializer => {
                if !self.at_statement_end() {
                    self.error("cannot return a value from an initializer");
                }
            }
            _ => {}
        }

        if self.at_statement_end() {
            match self.function_kind() {
                FunctionKind::Initializer => {
                    self.emit_op(OpCode::GetLocal);
                    self.emit_byte(0);
                }
                _ => self.emit_constant(Constant::Nil),
            }
        } else {
            self.expression();
        }
        self.emit_op(OpCode::Return);
        self.consume_statement_end();
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Throw);
        self.consume_statement_end();
    }

    fn yield_statement(&mut self) {
        if !self.mark_generator() {
            self.error("'yield' outside of a function");
        }
        if self.at_statement_end() {
            self.emit_constant(Constant::Nil);
        } else {
            self.expression();
        }
        self.emit_op(OpCode::Yield);
        // The value sent on resumption is unused in statement position.
        self.emit_op(OpCode::Pop);
        self.consume_statement_end();
    }

    // =========================================================================
    // EXCEPTION HANDLING
    // =========================================================================

    fn try_statement(&mut self) {
        self.emit_op(OpCode::TryBegin);
        let begin_operands = self.code_len();
        self.emit_u16(crate::NO_JUMP); // catch start, patched
        self.emit_u16(crate::NO_JUMP); // finally start, patched
        self.push_try(begin_operands);

        self.consume(&TokenKind::LBrace, "expected '{' after 'try'");
        self.block();
        let try_end = self.emit_jump(OpCode::TryEnd);

        let mut catch_end = None;
        if self.match_token(&TokenKind::Catch) {
            self.mark_catch_start();

            if self.match_token(&TokenKind::LParen) {
                let name = self.consume_ident("expected exception variable name");
                self.consume(&TokenKind::RParen, "expected ')' after exception variable");
                // The unwinder leaves the exception exactly where the new
                // local's slot is, so CATCH_BEGIN just blesses it.
                self.begin_scope();
                let slot = self.add_local(&name);
                self.emit_op(OpCode::CatchBegin);
                self.emit_byte(slot);
                self.consume(&TokenKind::LBrace, "expected '{' after catch clause");
                while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
                    self.declaration();
                }
                self.consume(&TokenKind::RBrace, "expected '}' after catch body");
                self.end_scope();
            } else {
                self.emit_op(OpCode::CatchBegin);
                self.emit_byte(NO_SLOT);
                self.consume(&TokenKind::LBrace, "expected '{' after 'catch'");
                while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
                    self.declaration();
                }
                self.consume(&TokenKind::RBrace, "expected '}' after catch body");
            }
            catch_end = Some(self.emit_jump(OpCode::CatchEnd));
        }

        if self.match_token(&TokenKind::Finally) {
            let finally_start = self.mark_finally_start();
            self.emit_op(OpCode::FinallyBegin);
            self.consume(&TokenKind::LBrace, "expected '{' after 'finally'");
            self.block();
            self.emit_op(OpCode::FinallyEnd);

            // Normal completion of the try/catch body funnels into the
            // finally block.
            self.patch_jump_to(try_end, finally_start);
            if let Some(catch_end) = catch_end {
                self.patch_jump_to(catch_end, finally_start);
            }
        } else {
            self.patch_jump(try_end);
            if let Some(catch_end) = catch_end {
                self.patch_jump(catch_end);
            }
        }

        self.pop_try();
    }

    // =========================================================================
    // SWITCH
    // =========================================================================

    fn switch_statement(&mut self) {
        self.consume(&TokenKind::LParen, "expected '(' after 'switch'");
        self.expression();
        self.consume(&TokenKind::RParen, "expected ')' after switch value");
        self.consume(&TokenKind::LBrace, "expected '{' after switch value");

        // A switch is a breakable context; `continue` falls through to
        // the enclosing loop.
        self.push_loop(0, true);

        let mut fallthrough: Option<usize> = None;
        while self.match_token(&TokenKind::Case) {
            self.expression();
            self.consume(&TokenKind::Colon, "expected ':' after case value");
            let mismatch = self.emit_jump(OpCode::Case);
            if let Some(jump) = fallthrough.take() {
                self.patch_jump(jump);
            }
            while !self.check(&TokenKind::Case)
                && !self.check(&TokenKind::Default)
                && !self.check(&TokenKind::RBrace)
                && !self.check(&TokenKind::Eof)
            {
                self.declaration();
            }
            // C-style fallthrough: skip the next case test, land on its
            // body.
            fallthrough = Some(self.emit_jump(OpCode::Jump));
            self.patch_jump(mismatch);
        }

        // Reached with the switch value still on the stack when every
        // case mismatched; DEFAULT pops it.
        self.emit_op(OpCode::Default);
        if let Some(jump) = fallthrough.take() {
            self.patch_jump(jump);
        }
        if self.match_token(&TokenKind::Default) {
            self.consume(&TokenKind::Colon, "expected ':' after 'default'");
            while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
                self.declaration();
            }
        }

        self.consume(&TokenKind::RBrace, "expected '}' after switch body");
        self.pop_loop();
    }

    // =========================================================================
    // FUNCTIONS AND CLASSES
    // =========================================================================

    /// Compiles `fn name(params) { body }`, defining a global. Returns
    /// the function name for `export` to reuse.
    fn fn_declaration(&mut self, is_async: bool) -> String {
        let name = self.consume_ident("expected function name");
        let kind = if is_async {
            FunctionKind::Async
        } else {
            FunctionKind::Function
        };
        self.compile_function(&name, kind);
        let index = self.identifier_constant(&name);
        self.emit_op(OpCode::SetGlobal);
        self.emit_byte(index);
        self.emit_op(OpCode::Pop);
        name
    }

    /// Compiles a function body in a nested context and emits its
    /// constant in the enclosing chunk.
    fn compile_function(&mut self, name: &str, kind: FunctionKind) {
        self.push_function(name, kind);
        self.begin_scope();

        self.consume(&TokenKind::LParen, "expected '(' after function name");
        let mut arity: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                let param = self.consume_ident("expected parameter name");
                self.add_local(&param);
                arity += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after parameters");
        if arity > u8::MAX as u16 {
            self.error("too many parameters");
        }
        self.set_arity(arity as u8);

        self.consume(&TokenKind::LBrace, "expected '{' before function body");
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RBrace, "expected '}' after function body");

        let function = self.pop_function();
        self.emit_constant(Constant::Function(function));
    }

    /// Compiles `class Name [extends Super] { fn method() {} ... }`.
    /// Returns the class name for `export` to reuse.
    fn class_declaration(&mut self) -> String {
        let name = self.consume_ident("expected class name");
        let name_index = self.identifier_constant(&name);

        self.emit_op(OpCode::ClassDef);
        self.emit_byte(name_index);
        self.emit_op(OpCode::SetGlobal);
        self.emit_byte(name_index);

        let mut has_superclass = false;
        if self.match_token(&TokenKind::Extends) {
            let superclass = self.consume_ident("expected superclass name");
            if superclass == name {
                self.error("a class cannot inherit from itself");
            }
            self.named_variable(&superclass, false);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }
        self.push_class(has_superclass);

        self.consume(&TokenKind::LBrace, "expected '{' before class body");
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if !self.match_token(&TokenKind::Fn) && !self.match_token(&TokenKind::Function) {
                self.error_at_current("expected method declaration");
                break;
            }
            let method = self.consume_ident("expected method name");
            let method_index = self.identifier_constant(&method);
            let kind = if method == "init" {
                FunctionKind::Initializer
            } else {
                FunctionKind::Method
            };
            self.compile_function(&method, kind);
            self.emit_op(OpCode::MethodDef);
            self.emit_byte(method_index);
        }
        self.consume(&TokenKind::RBrace, "expected '}' after class body");

        self.emit_op(OpCode::Pop); // the class itself
        self.pop_class();
        name
    }

    // =========================================================================
    // IMPORT / EXPORT
    // =========================================================================

    fn import_declaration(&mut self) {
        if let TokenKind::Str(module) = &self.current.kind {
            // `import "x"` - execute for side effects only.
            let module = module.clone();
            self.advance();
            self.emit_import_call(&module);
            self.emit_op(OpCode::Pop);
        } else if self.match_token(&TokenKind::LBrace) {
            // `import { a, b as c } from "x"`
            let bindings = self.import_binding_list();
            self.consume(&TokenKind::From, "expected 'from' after import list");
            let module = self.consume_module_name();
            for (name, alias) in bindings {
                self.emit_import_call(&module);
                self.emit_constant(Constant::Str(name));
                self.emit_op(OpCode::HashMapGet);
                let alias_index = self.identifier_constant(&alias);
                self.emit_op(OpCode::SetGlobal);
                self.emit_byte(alias_index);
                self.emit_op(OpCode::Pop);
            }
        } else if self.match_token(&TokenKind::Star) {
            // `import * as n from "x"` - bind the whole export map.
            self.consume(&TokenKind::As, "expected 'as' after '*'");
            let alias = self.consume_ident("expected namespace alias");
            self.consume(&TokenKind::From, "expected 'from' after namespace alias");
            let module = self.consume_module_name();
            self.emit_import_call(&module);
            let alias_index = self.identifier_constant(&alias);
            self.emit_op(OpCode::SetGlobal);
            self.emit_byte(alias_index);
            self.emit_op(OpCode::Pop);
        } else {
            // `import d from "x"` - bind the default export.
            let alias = self.consume_ident("expected module name or import list");
            self.consume(&TokenKind::From, "expected 'from' after import binding");
            let module = self.consume_module_name();
            self.emit_import_call(&module);
            self.emit_constant(Constant::Str("default".to_string()));
            self.emit_op(OpCode::HashMapGet);
            let alias_index = self.identifier_constant(&alias);
            self.emit_op(OpCode::SetGlobal);
            self.emit_byte(alias_index);
            self.emit_op(OpCode::Pop);
        }
        self.consume_statement_end();
    }

    /// Parses `a, b as c, ...` up to the closing brace.
    fn import_binding_list(&mut self) -> Vec<(String, String)> {
        let mut bindings = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let name = self.consume_ident("expected import name");
                let alias = if self.match_token(&TokenKind::As) {
                    self.consume_ident("expected alias after 'as'")
                } else {
                    name.clone()
                };
                bindings.push((name, alias));
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBrace, "expected '}' after import list");
        bindings
    }

    fn consume_module_name(&mut self) -> String {
        if let TokenKind::Str(module) = &self.current.kind {
            let module = module.clone();
            self.advance();
            module
        } else {
            self.error_at_current("expected module name string");
            String::new()
        }
    }

    fn export_declaration(&mut self) {
        if self.match_token(&TokenKind::Default) {
            // `export default expr`
            self.begin_export("default");
            self.expression();
            self.finish_export();
            self.consume_statement_end();
        } else if self.match_token(&TokenKind::Fn) || self.match_token(&TokenKind::Function) {
            let name = self.fn_declaration(false);
            self.export_global(&name);
        } else if self.match_token(&TokenKind::Async) {
            if !self.match_token(&TokenKind::Fn) && !self.match_token(&TokenKind::Function) {
                self.error_at_current("expected 'fn' after 'async'");
            }
            let name = self.fn_declaration(true);
            self.export_global(&name);
        } else if self.match_token(&TokenKind::Class) {
            let name = self.class_declaration();
            self.export_global(&name);
        } else if self.match_token(&TokenKind::LBrace) {
            let bindings = self.import_binding_list();
            if self.match_token(&TokenKind::From) {
                // `export { a } from "x"` - re-export without binding.
                let module = self.consume_module_name();
                for (name, alias) in bindings {
                    self.begin_export(&alias);
                    self.emit_import_call(&module);
                    self.emit_constant(Constant::Str(name));
                    self.emit_op(OpCode::HashMapGet);
                    self.finish_export();
                }
            } else {
                for (name, alias) in bindings {
                    self.begin_export(&alias);
                    self.named_variable(&name, false);
                    self.finish_export();
                }
            }
            self.consume_statement_end();
        } else {
            // `export x = expr`
            let name = self.consume_ident("expected export name");
            self.consume(&TokenKind::Eq, "expected '=' after export name");
            self.expression();
            let index = self.identifier_constant(&name);
            self.emit_op(OpCode::SetGlobal);
            self.emit_byte(index);
            self.emit_op(OpCode::Pop);
            self.export_global(&name);
            self.consume_statement_end();
        }
    }

    /// Starts an `__export(name, ...)` call: callee and name argument.
    fn begin_export(&mut self, name: &str) {
        let export_fn = self.identifier_constant("__export");
        self.emit_op(OpCode::GetGlobal);
        self.emit_byte(export_fn);
        self.emit_constant(Constant::Str(name.to_string()));
    }

    /// Finishes an `__export` call after the value has been emitted.
    fn finish_export(&mut self) {
        self.emit_op(OpCode::Call);
        self.emit_byte(2);
        self.emit_op(OpCode::Pop);
    }

    /// Exports the current value of a global under its own name.
    fn export_global(&mut self, name: &str) {
        self.begin_export(name);
        self.named_variable(name, false);
        self.finish_export();
    }
}
