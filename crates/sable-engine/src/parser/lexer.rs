//! Lexer for the Sable scripting language.
//!
//! The token recognizer is generated with the logos library and wrapped in a
//! `Lexer` that tracks line/column positions and reports problems into the
//! compilation unit's shared error list. Lexing keeps going after an error so
//! a single pass can surface as many diagnostics as possible.

use logos::Logos;

use crate::compiler::unit::CompilationUnit;
use crate::compiler::{ErrorLevel, ErrorMessage};
use crate::parser::token::{Span, Token};

/// Logos-based token enum for lexing.
///
/// Used internally for recognition; converted to the public `Token` enum
/// after lexing.
#[derive(Logos, Debug, Clone, PartialEq)]
enum RawToken {
    // Whitespace (skip)
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    // Block comments nest; the callback consumes the balanced body.
    #[regex(r"/\*", lex_block_comment)]
    BlockComment,

    // Keywords (must come before identifiers)
    #[token("function")]
    Function,

    #[token("class")]
    Class,

    #[token("extends")]
    Extends,

    #[token("let")]
    Let,

    #[token("const")]
    Const,

    #[token("if")]
    If,

    #[token("else")]
    Else,

    #[token("while")]
    While,

    #[token("for")]
    For,

    #[token("break")]
    Break,

    #[token("continue")]
    Continue,

    #[token("return")]
    Return,

    #[token("try")]
    Try,

    #[token("catch")]
    Catch,

    #[token("throw")]
    Throw,

    #[token("new")]
    New,

    #[token("as")]
    As,

    #[token("yield")]
    Yield,

    #[token("true")]
    True,

    #[token("false")]
    False,

    #[token("null")]
    Null,

    // Identifiers (must come after keywords)
    #[regex(r"[a-zA-Z_$][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Identifier(String),

    // Numbers
    #[regex(r"0x[0-9a-fA-F]+", parse_hex)]
    #[regex(r"[0-9]+", parse_int)]
    IntLiteral(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    FloatLiteral(f64),

    // Strings
    #[regex(r#""([^"\\]|\\.)*""#, parse_string)]
    #[regex(r"'([^'\\]|\\.)*'", parse_string)]
    StringLiteral(String),

    // Operators (2-char before 1-char)
    #[token("==")]
    EqualEqual,

    #[token("!=")]
    BangEqual,

    #[token("<=")]
    LessEqual,

    #[token(">=")]
    GreaterEqual,

    #[token("&&")]
    AmpAmp,

    #[token("||")]
    PipePipe,

    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("/")]
    Slash,

    #[token("%")]
    Percent,

    #[token("!")]
    Bang,

    #[token("<")]
    Less,

    #[token(">")]
    Greater,

    #[token("=")]
    Equal,

    #[token(".")]
    Dot,

    #[token(",")]
    Comma,

    #[token(":")]
    Colon,

    #[token(";")]
    Semicolon,

    #[token("(")]
    LeftParen,

    #[token(")")]
    RightParen,

    #[token("{")]
    LeftBrace,

    #[token("}")]
    RightBrace,

    #[token("[")]
    LeftBracket,

    #[token("]")]
    RightBracket,
}

// Helper parsing functions

fn lex_block_comment(lex: &mut logos::Lexer<'_, RawToken>) -> logos::Skip {
    // "/*" is already consumed; scan the remainder tracking nesting depth.
    let remainder = lex.remainder();
    let bytes = remainder.as_bytes();
    let mut depth = 1usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            depth -= 1;
            i += 2;
            if depth == 0 {
                break;
            }
        } else {
            i += 1;
        }
    }

    // Unterminated comments consume to end of input; the wrapper reports it.
    lex.bump(i);
    logos::Skip
}

fn parse_hex(lex: &mut logos::Lexer<'_, RawToken>) -> Option<i64> {
    i64::from_str_radix(&lex.slice()[2..], 16).ok()
}

fn parse_int(lex: &mut logos::Lexer<'_, RawToken>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<'_, RawToken>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, RawToken>) -> Option<String> {
    let s = lex.slice();
    Some(unescape_string(&s[1..s.len() - 1]))
}

fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('\\') => result.push('\\'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some('0') => result.push('\0'),
                Some(other) => result.push(other),
                None => break,
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Main lexer structure.
pub struct Lexer<'a> {
    source: &'a str,
    /// Byte offset of the start of each line, for span construction.
    line_starts: Vec<usize>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            source,
            line_starts,
        }
    }

    /// Build a span for a byte range, resolving line and column.
    fn span(&self, range: std::ops::Range<usize>) -> Span {
        let line_idx = match self.line_starts.binary_search(&range.start) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let column = (range.start - self.line_starts[line_idx]) as u32 + 1;
        Span::new(range.start, range.end, line_idx as u32 + 1, column)
    }

    /// Tokenize the whole source.
    ///
    /// Problems are appended to the unit's error list; lexing continues past
    /// unrecognized input so later errors are still reported. The returned
    /// stream always ends with an `Eof` token.
    pub fn tokenize(&self, unit: &mut CompilationUnit) -> Vec<(Token, Span)> {
        let mut tokens = Vec::new();
        let mut lexer = RawToken::lexer(self.source);

        while let Some(result) = lexer.next() {
            let span = self.span(lexer.span());
            match result {
                Ok(raw) => {
                    if let Some(token) = convert(raw) {
                        tokens.push((token, span));
                    }
                }
                Err(()) => {
                    let slice = lexer.slice();
                    let message = if slice.starts_with('"') || slice.starts_with('\'') {
                        ErrorMessage::UnterminatedString
                    } else {
                        ErrorMessage::UnexpectedCharacter {
                            ch: slice.chars().next().unwrap_or('\0'),
                        }
                    };
                    unit.errors.add(ErrorLevel::Fatal, message, span);
                }
            }
        }

        let end = self.source.len();
        tokens.push((Token::Eof, self.span(end..end)));
        tokens
    }
}

fn convert(raw: RawToken) -> Option<Token> {
    Some(match raw {
        RawToken::Whitespace | RawToken::LineComment | RawToken::BlockComment => return None,
        RawToken::Function => Token::Function,
        RawToken::Class => Token::Class,
        RawToken::Extends => Token::Extends,
        RawToken::Let => Token::Let,
        RawToken::Const => Token::Const,
        RawToken::If => Token::If,
        RawToken::Else => Token::Else,
        RawToken::While => Token::While,
        RawToken::For => Token::For,
        RawToken::Break => Token::Break,
        RawToken::Continue => Token::Continue,
        RawToken::Return => Token::Return,
        RawToken::Try => Token::Try,
        RawToken::Catch => Token::Catch,
        RawToken::Throw => Token::Throw,
        RawToken::New => Token::New,
        RawToken::As => Token::As,
        RawToken::Yield => Token::Yield,
        RawToken::True => Token::True,
        RawToken::False => Token::False,
        RawToken::Null => Token::Null,
        RawToken::Identifier(name) => Token::Identifier(name),
        RawToken::IntLiteral(value) => Token::IntLiteral(value),
        RawToken::FloatLiteral(value) => Token::FloatLiteral(value),
        RawToken::StringLiteral(value) => Token::StringLiteral(value),
        RawToken::EqualEqual => Token::EqualEqual,
        RawToken::BangEqual => Token::BangEqual,
        RawToken::LessEqual => Token::LessEqual,
        RawToken::GreaterEqual => Token::GreaterEqual,
        RawToken::AmpAmp => Token::AmpAmp,
        RawToken::PipePipe => Token::PipePipe,
        RawToken::Plus => Token::Plus,
        RawToken::Minus => Token::Minus,
        RawToken::Star => Token::Star,
        RawToken::Slash => Token::Slash,
        RawToken::Percent => Token::Percent,
        RawToken::Bang => Token::Bang,
        RawToken::Less => Token::Less,
        RawToken::Greater => Token::Greater,
        RawToken::Equal => Token::Equal,
        RawToken::Dot => Token::Dot,
        RawToken::Comma => Token::Comma,
        RawToken::Colon => Token::Colon,
        RawToken::Semicolon => Token::Semicolon,
        RawToken::LeftParen => Token::LeftParen,
        RawToken::RightParen => Token::RightParen,
        RawToken::LeftBrace => Token::LeftBrace,
        RawToken::RightBrace => Token::RightBrace,
        RawToken::LeftBracket => Token::LeftBracket,
        RawToken::RightBracket => Token::RightBracket,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> (Vec<Token>, CompilationUnit) {
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source)
            .tokenize(&mut unit)
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        (tokens, unit)
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let (tokens, unit) = lex("function add let x");
        assert!(unit.errors.is_empty());
        assert_eq!(
            tokens,
            vec![
                Token::Function,
                Token::Identifier("add".into()),
                Token::Let,
                Token::Identifier("x".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let (tokens, unit) = lex("42 0x2a 3.25 1e3");
        assert!(unit.errors.is_empty());
        assert_eq!(
            tokens,
            vec![
                Token::IntLiteral(42),
                Token::IntLiteral(42),
                Token::FloatLiteral(3.25),
                Token::FloatLiteral(1000.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, _) = lex(r#""a\nb" 'c'"#);
        assert_eq!(
            tokens,
            vec![
                Token::StringLiteral("a\nb".into()),
                Token::StringLiteral("c".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_nested_block_comment() {
        let (tokens, unit) = lex("1 /* outer /* inner */ still comment */ 2");
        assert!(unit.errors.is_empty());
        assert_eq!(
            tokens,
            vec![Token::IntLiteral(1), Token::IntLiteral(2), Token::Eof]
        );
    }

    #[test]
    fn test_line_and_column_tracking() {
        let source = "let x\nlet yy";
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let (_, second_let) = &tokens[2];
        assert_eq!(second_let.line, 2);
        assert_eq!(second_let.column, 1);
        let (_, yy) = &tokens[3];
        assert_eq!(yy.line, 2);
        assert_eq!(yy.column, 5);
    }

    #[test]
    fn test_error_recovery_keeps_lexing() {
        let (tokens, unit) = lex("let # x");
        assert_eq!(unit.errors.len(), 1);
        assert!(unit.errors.has_fatal_errors());
        // The lexer kept going past the bad character.
        assert_eq!(
            tokens,
            vec![Token::Let, Token::Identifier("x".into()), Token::Eof]
        );
    }

    #[test]
    fn test_operators() {
        let (tokens, _) = lex("a <= b && c != d");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("a".into()),
                Token::LessEqual,
                Token::Identifier("b".into()),
                Token::AmpAmp,
                Token::Identifier("c".into()),
                Token::BangEqual,
                Token::Identifier("d".into()),
                Token::Eof,
            ]
        );
    }
}
