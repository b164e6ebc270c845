//! Main lexer struct, token dispatch, and scan-state snapshots.

use ember_util::Span;

use crate::cursor::{Cursor, CursorState};
use crate::{Token, TokenKind};

/// A snapshot of the lexer's scan state.
///
/// The scanner is a first-class value: everything it knows is captured
/// here, so a caller can park a scan, run another one, and come back.
/// The compiler does exactly that when it compiles the `${expr}` segments
/// of an interpolated string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LexerState {
    /// The underlying cursor position.
    pub cursor: CursorState,
}

/// The lexer for Ember source code.
///
/// Produces one [`Token`] per call to [`Lexer::next_token`]. Errors are
/// returned as [`TokenKind::Error`] tokens carrying a message; the caller
/// decides how to surface them.
///
/// # Example
///
/// ```
/// use ember_lex::{Lexer, TokenKind};
///
/// let mut lexer = Lexer::new("x = 42");
/// assert_eq!(lexer.next_token().kind, TokenKind::Ident("x".to_string()));
/// assert_eq!(lexer.next_token().kind, TokenKind::Eq);
/// assert_eq!(lexer.next_token().kind, TokenKind::Number(42.0));
/// assert_eq!(lexer.next_token().kind, TokenKind::Eof);
/// ```
pub struct Lexer<'a> {
    /// Character cursor for traversing source.
    pub(crate) cursor: Cursor<'a>,

    /// Start position of the current token.
    pub(crate) token_start: usize,

    /// Start line of the current token.
    pub(crate) token_start_line: u32,

    /// Start column of the current token.
    pub(crate) token_start_column: u32,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer over the given source code.
    pub fn new(source: &'a str) -> Self {
        Self {
            cursor: Cursor::new(source),
            token_start: 0,
            token_start_line: 1,
            token_start_column: 1,
        }
    }

    /// The source text being scanned.
    #[inline]
    pub fn source(&self) -> &'a str {
        self.cursor.source()
    }

    /// Captures the current scan state.
    pub fn save(&self) -> LexerState {
        LexerState {
            cursor: self.cursor.save(),
        }
    }

    /// Restores a previously captured scan state.
    pub fn restore(&mut self, state: LexerState) {
        self.cursor.restore(state.cursor);
    }

    /// Returns the next token from the source.
    ///
    /// Skips whitespace and comments, then dispatches on the first
    /// character of the token.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        self.token_start = self.cursor.position();
        self.token_start_line = self.cursor.line();
        self.token_start_column = self.cursor.column();

        if self.cursor.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.cursor.current_char();

        if c.is_ascii_digit() {
            return self.lex_number();
        }
        // A leading-dot fraction like `.5`; a bare `.` stays an operator.
        if c == '.' && self.cursor.char_at(1).is_ascii_digit() {
            return self.lex_number();
        }
        if c == '"' {
            return self.lex_string();
        }
        if is_ident_start(c) {
            return self.lex_identifier();
        }

        self.lex_operator()
    }

    /// Builds a token of the given kind spanning from the recorded token
    /// start to the current cursor position.
    pub(crate) fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            Span::new(
                self.token_start,
                self.cursor.position(),
                self.token_start_line,
                self.token_start_column,
            ),
        )
    }

    /// Builds an error token carrying `message`.
    pub(crate) fn error_token(&self, message: impl Into<String>) -> Token {
        self.make_token(TokenKind::Error(message.into()))
    }
}

/// Whether `c` can start an identifier.
#[inline]
pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Whether `c` can continue an identifier.
#[inline]
pub(crate) fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind.is_eof();
            out.push(token.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
        assert_eq!(kinds("   \n\t  "), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_statement_tokens() {
        assert_eq!(
            kinds("if (x < 10) { y = y + 1 }"),
            vec![
                TokenKind::If,
                TokenKind::LParen,
                TokenKind::Ident("x".to_string()),
                TokenKind::Lt,
                TokenKind::Number(10.0),
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::Ident("y".to_string()),
                TokenKind::Eq,
                TokenKind::Ident("y".to_string()),
                TokenKind::Plus,
                TokenKind::Number(1.0),
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_token_lines() {
        let mut lexer = Lexer::new("a\nb");
        assert_eq!(lexer.next_token().line(), 1);
        assert_eq!(lexer.next_token().line(), 2);
    }

    #[test]
    fn test_save_restore_replays_tokens() {
        let mut lexer = Lexer::new("1 + 2");
        let _ = lexer.next_token();
        let state = lexer.save();
        let first = lexer.next_token();
        let second = lexer.next_token();
        lexer.restore(state);
        assert_eq!(lexer.next_token(), first);
        assert_eq!(lexer.next_token(), second);
    }
}
