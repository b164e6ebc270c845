//! Whitespace and comment skipping.
//!
//! Ember has two line-comment forms, `#` and `//`, both running to end of
//! line. There are no block comments.

use crate::Lexer;

impl<'a> Lexer<'a> {
    /// Skips whitespace and comments up to the start of the next token.
    pub(crate) fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.cursor.current_char() {
                ' ' | '\t' | '\r' | '\n' => {
                    self.cursor.advance();
                }
                '#' => {
                    self.skip_line_comment();
                }
                '/' if self.cursor.char_at(1) == '/' => {
                    self.skip_line_comment();
                }
                _ => break,
            }
        }
    }

    /// Consumes characters up to (not including) the next newline.
    fn skip_line_comment(&mut self) {
        while !self.cursor.is_at_end() && self.cursor.current_char() != '\n' {
            self.cursor.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Lexer, TokenKind};

    #[test]
    fn test_hash_comment() {
        let mut lexer = Lexer::new("# a comment\n42");
        assert_eq!(lexer.next_token().kind, TokenKind::Number(42.0));
    }

    #[test]
    fn test_slash_slash_comment() {
        let mut lexer = Lexer::new("// comment\nx");
        assert_eq!(lexer.next_token().kind, TokenKind::Ident("x".to_string()));
    }

    #[test]
    fn test_single_slash_is_not_comment() {
        let mut lexer = Lexer::new("a / b");
        assert_eq!(lexer.next_token().kind, TokenKind::Ident("a".to_string()));
        assert_eq!(lexer.next_token().kind, TokenKind::Slash);
    }

    #[test]
    fn test_comment_at_eof() {
        let mut lexer = Lexer::new("# trailing");
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }
}
