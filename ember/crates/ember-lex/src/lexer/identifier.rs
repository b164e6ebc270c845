//! Identifier and keyword lexing.

use crate::lexer::core::is_ident_continue;
use crate::{keyword_from_ident, Lexer, Token, TokenKind};

impl<'a> Lexer<'a> {
    /// Lexes an identifier or keyword starting at the current position.
    pub(crate) fn lex_identifier(&mut self) -> Token {
        while is_ident_continue(self.cursor.current_char()) {
            self.cursor.advance();
        }

        let text = self.cursor.slice(self.token_start, self.cursor.position());
        match keyword_from_ident(text) {
            Some(keyword) => self.make_token(keyword),
            None => self.make_token(TokenKind::Ident(text.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Lexer, TokenKind};

    fn lex_one(source: &str) -> TokenKind {
        Lexer::new(source).next_token().kind
    }

    #[test]
    fn test_identifier() {
        assert_eq!(lex_one("foo_bar2"), TokenKind::Ident("foo_bar2".to_string()));
        assert_eq!(lex_one("_private"), TokenKind::Ident("_private".to_string()));
    }

    #[test]
    fn test_keyword() {
        assert_eq!(lex_one("class"), TokenKind::Class);
        assert_eq!(lex_one("yield"), TokenKind::Yield);
    }

    #[test]
    fn test_keyword_prefix_is_identifier() {
        assert_eq!(lex_one("classes"), TokenKind::Ident("classes".to_string()));
        assert_eq!(lex_one("iff"), TokenKind::Ident("iff".to_string()));
    }
}
