use logos::Logos;

use crate::util::{Diagnostic, Span};

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    // Keywords
    #[token("let")]
    Let,
    #[token("fun")]
    Fun,
    #[token("if")]
    If,
    #[token("then")]
    Then,
    #[token("else")]
    Else,
    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    // Operators
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Eq,
    #[token("->")]
    #[token("→")]
    RArrow,
    #[token("@")]
    At,
    #[token(".")]
    Dot,
    // Literals and Identifiers
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(-[A-Za-z0-9_]+)*")]
    Ident,
    #[regex(r"-?[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?")]
    Number,
    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,
}

impl Token {
    pub fn describe(self) -> &'static str {
        match self {
            Token::Let => "`let`",
            Token::Fun => "`fun`",
            Token::If => "`if`",
            Token::Then => "`then`",
            Token::Else => "`else`",
            Token::LParen => "`(`",
            Token::RParen => "`)`",
            Token::LBrace => "`{`",
            Token::RBrace => "`}`",
            Token::Comma => "`,`",
            Token::Colon => "`:`",
            Token::Eq => "`=`",
            Token::RArrow => "`->`",
            Token::At => "`@`",
            Token::Dot => "`.`",
            Token::Ident => "identifier",
            Token::Number => "number",
            Token::Str => "string",
        }
    }
}

/// Splits `src` into tokens, reporting characters no token accepts.
pub fn lex(src: &str) -> (Vec<(Token, Span)>, Vec<Diagnostic>) {
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    let mut lexer = Token::lexer(src);
    while let Some(token) = lexer.next() {
        let range = lexer.span();
        let span = Span::new(range.start, range.end);
        match token {
            Ok(token) => tokens.push((token, span)),
            Err(()) => diagnostics.push(Diagnostic::error("Unexpected character", span)),
        }
    }
    (tokens, diagnostics)
}

/// Offsets at which each line starts.
pub fn line_starts(src: &str) -> Vec<usize> {
    let bytes = src.as_bytes();
    let mut starts = vec![0];
    let mut cursor = 0;
    while cursor < bytes.len() {
        match bytes[cursor] {
            b'\n' => starts.push(cursor + 1),
            b'\r' if bytes.get(cursor + 1) == Some(&b'\n') => {
                cursor += 1;
                starts.push(cursor + 1);
            }
            b'\r' => starts.push(cursor + 1),
            _ => (),
        }
        cursor += 1;
    }
    starts
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        let (tokens, diagnostics) = lex(src);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        tokens.into_iter().map(|(token, _)| token).collect()
    }

    #[test]
    fn lexer_recognizes_keywords_and_identifiers() {
        assert_eq!(
            kinds("let letter fun funny"),
            vec![Token::Let, Token::Ident, Token::Fun, Token::Ident]
        );
    }

    #[test]
    fn lexer_keeps_arrow_apart_from_hyphenated_names() {
        assert_eq!(
            kinds("is-zero int64->int64"),
            vec![Token::Ident, Token::Ident, Token::RArrow, Token::Ident]
        );
        assert_eq!(kinds("a → b"), vec![Token::Ident, Token::RArrow, Token::Ident]);
    }

    #[test]
    fn lexer_recognizes_literals() {
        assert_eq!(
            kinds(r#"1 -2 3.5 1e3 "a\"b" // trailing"#),
            vec![
                Token::Number,
                Token::Number,
                Token::Number,
                Token::Number,
                Token::Str
            ]
        );
    }

    #[test]
    fn lexer_reports_unknown_characters() {
        let (tokens, diagnostics) = lex("x $ y");
        assert_eq!(tokens.len(), 2);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].span, Span::new(2, 3));
    }

    #[test]
    fn line_starts_cover_all_newline_styles() {
        assert_eq!(line_starts("a\nb\r\nc\rd"), vec![0, 2, 5, 7]);
        assert_eq!(line_starts(""), vec![0]);
    }
}
