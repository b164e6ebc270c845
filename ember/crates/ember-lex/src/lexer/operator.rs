//! Operator and punctuation lexing.

use crate::{Lexer, Token, TokenKind};

impl<'a> Lexer<'a> {
    /// Lexes an operator or punctuation token.
    ///
    /// Multi-character operators are matched greedily: `<=` before `<`,
    /// `+=` before `+`, and so on.
    pub(crate) fn lex_operator(&mut self) -> Token {
        let c = self.cursor.current_char();
        self.cursor.advance();

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '%' => TokenKind::Percent,
            '+' => {
                if self.cursor.match_char('=') {
                    TokenKind::PlusEq
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.cursor.match_char('=') {
                    TokenKind::MinusEq
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.cursor.match_char('=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.cursor.match_char('=') {
                    TokenKind::SlashEq
                } else {
                    TokenKind::Slash
                }
            }
            '!' => {
                if self.cursor.match_char('=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if self.cursor.match_char('=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            '<' => {
                if self.cursor.match_char('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.cursor.match_char('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.cursor.match_char('&') {
                    TokenKind::AmpAmp
                } else {
                    return self.error_token("unexpected character '&' (did you mean '&&'?)");
                }
            }
            '|' => {
                if self.cursor.match_char('|') {
                    TokenKind::PipePipe
                } else {
                    return self.error_token("unexpected character '|' (did you mean '||'?)");
                }
            }
            other => {
                return self.error_token(format!("unexpected character '{other}'"));
            }
        };

        self.make_token(kind)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Lexer, TokenKind};

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind.is_eof() {
                break;
            }
            out.push(token.kind);
        }
        out
    }

    #[test]
    fn test_greedy_matching() {
        assert_eq!(
            kinds("<= < >= > == = != !"),
            vec![
                TokenKind::LtEq,
                TokenKind::Lt,
                TokenKind::GtEq,
                TokenKind::Gt,
                TokenKind::EqEq,
                TokenKind::Eq,
                TokenKind::BangEq,
                TokenKind::Bang,
            ]
        );
    }

    #[test]
    fn test_compound_assignment() {
        assert_eq!(
            kinds("+= -= *= /="),
            vec![
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::StarEq,
                TokenKind::SlashEq,
            ]
        );
    }

    #[test]
    fn test_logical_operators() {
        assert_eq!(kinds("&& ||"), vec![TokenKind::AmpAmp, TokenKind::PipePipe]);
    }

    #[test]
    fn test_lone_ampersand_is_error() {
        assert!(matches!(kinds("&")[0], TokenKind::Error(_)));
    }
}
