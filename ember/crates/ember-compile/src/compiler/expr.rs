//! Expression compilation using Pratt parsing (top-down operator
//! precedence), emitting bytecode directly.
//!
//! # Operator precedence (lowest to highest)
//!
//! | Level | Operators |
//! |-------|-----------|
//! | assignment | `=`, `+=`, `-=`, `*=`, `/=` |
//! | logical OR | `or`, `\|\|` |
//! | logical AND | `and`, `&&` |
//! | equality | `==`, `!=` |
//! | comparison | `<`, `<=`, `>`, `>=` |
//! | term | `+`, `-` |
//! | factor | `*`, `/`, `%` |
//! | unary | `!`, `not`, `-` |
//! | call/member | `()`, `.`, `[]` |
//! | primary | literals, identifiers, grouping |

use ember_lex::TokenKind;

use super::Compiler;
use crate::opcode::OpCode;
use crate::{Constant, FunctionKind};

/// Precedence levels, lowest binds loosest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    /// Not an operator.
    None,
    /// `=`
    Assignment,
    /// `or` `||`
    Or,
    /// `and` `&&`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `<=` `>` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/` `%`
    Factor,
    /// `!` `-` (prefix)
    Unary,
    /// `()` `.` `[]`
    Call,
    /// Literals and grouping.
    Primary,
}

impl Precedence {
    /// The next-tighter level (used for left-associative operators).
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// A prefix or infix compilation rule.
type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

/// One row of the Pratt table.
struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

/// The Pratt table, written as a match so payload-carrying token kinds
/// fit naturally.
fn rule<'a>(kind: &TokenKind) -> ParseRule<'a> {
    macro_rules! row {
        ($prefix:expr, $infix:expr, $prec:expr) => {
            ParseRule {
                prefix: $prefix,
                infix: $infix,
                precedence: $prec,
            }
        };
    }

    match kind {
        TokenKind::Number(_) => row!(Some(Compiler::number), None, Precedence::None),
        TokenKind::Str(_) => row!(Some(Compiler::string), None, Precedence::None),
        TokenKind::InterpolatedStr(_) => {
            row!(Some(Compiler::interpolated_string), None, Precedence::None)
        }
        TokenKind::Ident(_) => row!(Some(Compiler::variable), None, Precedence::None),
        TokenKind::True | TokenKind::False | TokenKind::Nil => {
            row!(Some(Compiler::literal), None, Precedence::None)
        }
        TokenKind::LParen => row!(
            Some(Compiler::grouping),
            Some(Compiler::call),
            Precedence::Call
        ),
        TokenKind::LBracket => row!(
            Some(Compiler::array_literal),
            Some(Compiler::subscript),
            Precedence::Call
        ),
        TokenKind::LBrace => row!(Some(Compiler::map_literal), None, Precedence::None),
        TokenKind::Dot => row!(None, Some(Compiler::dot), Precedence::Call),
        TokenKind::Minus => row!(
            Some(Compiler::unary),
            Some(Compiler::binary),
            Precedence::Term
        ),
        TokenKind::Plus => row!(None, Some(Compiler::binary), Precedence::Term),
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
            row!(None, Some(Compiler::binary), Precedence::Factor)
        }
        TokenKind::Bang | TokenKind::Not => row!(Some(Compiler::unary), None, Precedence::None),
        TokenKind::EqEq | TokenKind::BangEq => {
            row!(None, Some(Compiler::binary), Precedence::Equality)
        }
        TokenKind::Lt | TokenKind::LtEq | TokenKind::Gt | TokenKind::GtEq => {
            row!(None, Some(Compiler::binary), Precedence::Comparison)
        }
        TokenKind::And | TokenKind::AmpAmp => row!(None, Some(Compiler::binary), Precedence::And),
        TokenKind::Or | TokenKind::PipePipe => row!(None, Some(Compiler::binary), Precedence::Or),
        TokenKind::This => row!(Some(Compiler::this_expr), None, Precedence::None),
        TokenKind::Super => row!(Some(Compiler::super_expr), None, Precedence::None),
        TokenKind::New => row!(Some(Compiler::new_expr), None, Precedence::None),
        TokenKind::Await => row!(Some(Compiler::await_expr), None, Precedence::None),
        TokenKind::Require => row!(Some(Compiler::require_expr), None, Precedence::None),
        _ => row!(None, None, Precedence::None),
    }
}

/// Regex intrinsics: calls to these names compile straight to regex
/// opcodes instead of a `CALL`.
fn regex_intrinsic(name: &str) -> Option<(OpCode, u8)> {
    match name {
        "regex" => Some((OpCode::RegexNew, 2)),
        "regex_test" => Some((OpCode::RegexTest, 2)),
        "regex_match" => Some((OpCode::RegexMatch, 2)),
        "regex_replace" => Some((OpCode::RegexReplace, 3)),
        "regex_split" => Some((OpCode::RegexSplit, 2)),
        _ => None,
    }
}

impl<'a> Compiler<'a> {
    /// Compiles one full expression.
    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: parse a prefix expression, then fold in infix
    /// operators while their precedence is at least `precedence`.
    pub(crate) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(&self.previous.kind).prefix else {
            self.error("expected expression");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(&self.current.kind).precedence {
            self.advance();
            let infix = rule(&self.previous.kind)
                .infix
                .expect("token with precedence must have an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(&TokenKind::Eq) {
            self.error("invalid assignment target");
        }
    }

    // =========================================================================
    // PREFIX RULES
    // =========================================================================

    fn number(&mut self, _can_assign: bool) {
        let TokenKind::Number(value) = self.previous.kind else {
            unreachable!("number rule on non-number token");
        };
        self.emit_constant(Constant::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let TokenKind::Str(value) = &self.previous.kind else {
            unreachable!("string rule on non-string token");
        };
        let value = value.clone();
        self.emit_constant(Constant::Str(value));
    }

    fn interpolated_string(&mut self, _can_assign: bool) {
        let TokenKind::InterpolatedStr(raw) = &self.previous.kind else {
            unreachable!("interpolation rule on wrong token");
        };
        let raw = raw.clone();
        let index = self.make_constant(Constant::InterpolatedStr(raw));
        self.emit_op(OpCode::StringInterpolate);
        self.emit_byte(index);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_constant(Constant::Bool(true)),
            TokenKind::False => self.emit_constant(Constant::Bool(false)),
            TokenKind::Nil => self.emit_constant(Constant::Nil),
            _ => unreachable!("literal rule on wrong token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(&TokenKind::RParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang | TokenKind::Not => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on wrong token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let TokenKind::Ident(name) = &self.previous.kind else {
            unreachable!("variable rule on non-identifier");
        };
        let name = name.clone();

        // Regex intrinsic call forms lower straight to opcodes.
        if self.check(&TokenKind::LParen) {
            if let Some((op, arity)) = regex_intrinsic(&name) {
                self.advance();
                let argc = self.argument_list();
                if argc != arity {
                    self.error(format!(
                        "{name} expects {arity} argument(s), found {argc}"
                    ));
                }
                self.emit_op(op);
                return;
            }
        }

        self.named_variable(&name, can_assign);
    }

    /// Emits a get or set for a named variable, resolving locals first.
    pub(crate) fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, operand) = match self.resolve_local(name) {
            Some(slot) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            None => {
                let index = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, index)
            }
        };

        if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(operand);
        } else if can_assign && self.check_compound_assign().is_some() {
            let op = self.check_compound_assign().unwrap();
            self.advance();
            self.emit_op(get_op);
            self.emit_byte(operand);
            self.expression();
            self.emit_op(op);
            self.emit_op(set_op);
            self.emit_byte(operand);
        } else {
            self.emit_op(get_op);
            self.emit_byte(operand);
        }
    }

    /// The arithmetic opcode a compound-assignment lookahead maps to.
    fn check_compound_assign(&self) -> Option<OpCode> {
        match self.current.kind {
            TokenKind::PlusEq => Some(OpCode::Add),
            TokenKind::MinusEq => Some(OpCode::Sub),
            TokenKind::StarEq => Some(OpCode::Mul),
            TokenKind::SlashEq => Some(OpCode::Div),
            _ => None,
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                // Trailing comma.
                if self.check(&TokenKind::RBracket) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBracket, "expected ']' after array elements");
        if count > u8::MAX as u16 {
            self.error("too many elements in array literal");
        }
        self.emit_op(OpCode::ArrayNew);
        self.emit_byte(count as u8);
    }

    fn map_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RBrace) {
            loop {
                // Bare identifiers are shorthand for string keys.
                if let TokenKind::Ident(key) = &self.current.kind {
                    let key = key.clone();
                    self.advance();
                    self.emit_constant(Constant::Str(key));
                } else {
                    self.expression();
                }
                self.consume(&TokenKind::Colon, "expected ':' after map key");
                self.expression();
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBrace, "expected '}' after map entries");
        if count > u8::MAX as u16 {
            self.error("too many entries in map literal");
        }
        self.emit_op(OpCode::HashMapNew);
        self.emit_byte(count as u8);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if !matches!(
            self.function_kind(),
            FunctionKind::Method | FunctionKind::Initializer
        ) {
            self.error("'this' outside of a method");
            return;
        }
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(0);
    }

    fn super_expr(&mut self, _can_assign: bool) {
        if !matches!(
            self.function_kind(),
            FunctionKind::Method | FunctionKind::Initializer
        ) {
            self.error("'super' outside of a method");
        } else if !self.in_class_with_superclass() {
            self.error("'super' in a class with no superclass");
        }

        self.consume(&TokenKind::Dot, "expected '.' after 'super'");
        let name = self.consume_ident("expected superclass method name");
        let index = self.identifier_constant(&name);

        // Receiver, then the bound superclass method.
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(0);
        self.emit_op(OpCode::GetSuper);
        self.emit_byte(index);

        if self.match_token(&TokenKind::LParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Call);
            self.emit_byte(argc);
        }
    }

    fn new_expr(&mut self, _can_assign: bool) {
        let name = self.consume_ident("expected class name after 'new'");
        self.named_variable(&name, false);

        // Allow dotted paths like `new geometry.Point(...)`.
        while self.match_token(&TokenKind::Dot) {
            let property = self.consume_ident("expected property name after '.'");
            let index = self.identifier_constant(&property);
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(index);
        }

        self.consume(&TokenKind::LParen, "expected '(' after class name");
        let argc = self.argument_list();
        self.emit_op(OpCode::InstanceNew);
        self.emit_byte(argc);
    }

    fn await_expr(&mut self, _can_assign: bool) {
        if self.function_kind() != FunctionKind::Async {
            self.error("'await' outside of an async function");
        }
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Await);
    }

    fn require_expr(&mut self, _can_assign: bool) {
        self.consume(&TokenKind::LParen, "expected '(' after 'require'");
        if let TokenKind::Str(module) = &self.current.kind {
            let module = module.clone();
            self.advance();
            self.emit_import_call(&module);
        } else {
            self.error_at_current("expected module name string");
        }
        self.consume(&TokenKind::RParen, "expected ')' after module name");
    }

    // =========================================================================
    // INFIX RULES
    // =========================================================================

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        let precedence = rule(&operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::Percent => self.emit_op(OpCode::Mod),
            TokenKind::EqEq => self.emit_op(OpCode::Equal),
            TokenKind::BangEq => self.emit_op(OpCode::NotEqual),
            TokenKind::Lt => self.emit_op(OpCode::Less),
            TokenKind::LtEq => self.emit_op(OpCode::LessEqual),
            TokenKind::Gt => self.emit_op(OpCode::Greater),
            TokenKind::GtEq => self.emit_op(OpCode::GreaterEqual),
            TokenKind::And | TokenKind::AmpAmp => self.emit_op(OpCode::And),
            TokenKind::Or | TokenKind::PipePipe => self.emit_op(OpCode::Or),
            _ => unreachable!("binary rule on wrong token"),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        let name = self.consume_ident("expected property name after '.'");
        let index = self.identifier_constant(&name);

        if self.match_token(&TokenKind::LParen) {
            // Method-call fast path: receiver stays in place.
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(index);
            self.emit_byte(argc);
        } else if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(index);
        } else if can_assign && self.check_compound_assign().is_some() {
            self.error_at_current("invalid compound assignment target");
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(index);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(&TokenKind::RBracket, "expected ']' after index");

        if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression();
            self.emit_op(OpCode::ArraySet);
        } else if can_assign && self.check_compound_assign().is_some() {
            self.error_at_current("invalid compound assignment target");
        } else {
            self.emit_op(OpCode::ArrayGet);
        }
    }

    // =========================================================================
    // SHARED PIECES
    // =========================================================================

    /// Compiles a parenthesized argument list (opening paren already
    /// consumed) and returns the argument count.
    pub(crate) fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression();
                argc += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after arguments");
        if argc > u8::MAX as u16 {
            self.error("too many arguments");
        }
        argc as u8
    }

    /// Emits the host-import call sequence, leaving the module's export
    /// map on the stack.
    pub(crate) fn emit_import_call(&mut self, module: &str) {
        let import_name = self.identifier_constant("__import");
        self.emit_op(OpCode::GetGlobal);
        self.emit_byte(import_name);
        self.emit_constant(Constant::Str(module.to_string()));
        self.emit_op(OpCode::Call);
        self.emit_byte(1);
    }
}
