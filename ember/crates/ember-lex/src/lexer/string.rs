//! String literal lexing and interpolation tracking.
//!
//! A double-quoted literal containing at least one `${expr}` segment is a
//! distinct token kind: the lexer hands the raw body through untouched so
//! the compiler (or the VM, rescanning at runtime) can compile each
//! embedded expression. The scan still has to understand enough structure
//! to find the closing quote: escape sequences, brace nesting inside
//! `${...}`, and string literals *inside* the interpolation.

use crate::{Lexer, Token, TokenKind};

impl<'a> Lexer<'a> {
    /// Lexes a string literal starting at the opening quote.
    pub(crate) fn lex_string(&mut self) -> Token {
        self.cursor.advance(); // opening quote
        let body_start = self.cursor.position();
        let mut has_interpolation = false;

        loop {
            if self.cursor.is_at_end() {
                return self.error_token("unterminated string literal");
            }

            match self.cursor.current_char() {
                '"' => break,
                '\\' => {
                    // Skip the escape introducer and whatever follows so an
                    // escaped quote cannot end the literal.
                    self.cursor.advance();
                    if !self.cursor.is_at_end() {
                        self.cursor.advance();
                    }
                }
                '$' if self.cursor.char_at(1) == '{' => {
                    has_interpolation = true;
                    self.cursor.advance(); // '$'
                    self.cursor.advance(); // '{'
                    if let Some(token) = self.skip_interpolation() {
                        return token;
                    }
                }
                _ => {
                    self.cursor.advance();
                }
            }
        }

        let body = self
            .cursor
            .slice(body_start, self.cursor.position())
            .to_string();
        self.cursor.advance(); // closing quote

        if has_interpolation {
            self.make_token(TokenKind::InterpolatedStr(body))
        } else {
            self.make_token(TokenKind::Str(unescape(&body)))
        }
    }

    /// Skips the body of a `${...}` segment, tracking brace depth and
    /// inner string literals. Returns an error token if the segment is
    /// unterminated.
    fn skip_interpolation(&mut self) -> Option<Token> {
        let mut depth = 1usize;
        while depth > 0 {
            if self.cursor.is_at_end() {
                return Some(self.error_token("unterminated interpolation in string literal"));
            }
            match self.cursor.current_char() {
                '{' => {
                    depth += 1;
                    self.cursor.advance();
                }
                '}' => {
                    depth -= 1;
                    self.cursor.advance();
                }
                '"' => {
                    if let Some(token) = self.skip_inner_string() {
                        return Some(token);
                    }
                }
                '\\' => {
                    self.cursor.advance();
                    if !self.cursor.is_at_end() {
                        self.cursor.advance();
                    }
                }
                _ => {
                    self.cursor.advance();
                }
            }
        }
        None
    }

    /// Skips a string literal nested inside an interpolation so its braces
    /// and quotes don't confuse the depth tracking.
    fn skip_inner_string(&mut self) -> Option<Token> {
        self.cursor.advance(); // opening quote
        loop {
            if self.cursor.is_at_end() {
                return Some(self.error_token("unterminated string literal"));
            }
            match self.cursor.current_char() {
                '"' => {
                    self.cursor.advance();
                    return None;
                }
                '\\' => {
                    self.cursor.advance();
                    if !self.cursor.is_at_end() {
                        self.cursor.advance();
                    }
                }
                _ => {
                    self.cursor.advance();
                }
            }
        }
    }
}

/// Processes escape sequences in a raw string body.
///
/// Recognized escapes: `\n`, `\t`, `\r`, `\0`, `\\`, `\"`, `\$`. An
/// unrecognized escape keeps the escaped character as-is.
///
/// # Examples
///
/// ```
/// use ember_lex::unescape;
///
/// assert_eq!(unescape("a\\nb"), "a\nb");
/// assert_eq!(unescape("\\$not_interp"), "$not_interp");
/// ```
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
