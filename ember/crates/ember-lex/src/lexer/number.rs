//! Number literal lexing.
//!
//! Integers and decimals, including leading-dot fractions (`.5`). No
//! exponent forms, no radix prefixes.

use crate::{Lexer, Token, TokenKind};

impl<'a> Lexer<'a> {
    /// Lexes a number literal starting at the current cursor position.
    pub(crate) fn lex_number(&mut self) -> Token {
        // Leading-dot fraction: `.5`
        if self.cursor.current_char() == '.' {
            self.cursor.advance();
            self.consume_digits();
            return self.finish_number();
        }

        self.consume_digits();

        // A fractional part requires a digit after the dot, otherwise the
        // dot belongs to a member access.
        if self.cursor.current_char() == '.' && self.cursor.char_at(1).is_ascii_digit() {
            self.cursor.advance();
            self.consume_digits();
        }

        self.finish_number()
    }

    fn consume_digits(&mut self) {
        while self.cursor.current_char().is_ascii_digit() {
            self.cursor.advance();
        }
    }

    fn finish_number(&mut self) -> Token {
        let text = self.cursor.slice(self.token_start, self.cursor.position());
        match text.parse::<f64>() {
            Ok(value) => self.make_token(TokenKind::Number(value)),
            Err(_) => self.error_token(format!("invalid number literal '{text}'")),
        }
    }
}
