use std::{
    collections::{BTreeMap, VecDeque},
    str::Chars,
};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::{
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    frontend::{SourceFile, SourceId, Span},
};

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    source_id: SourceId,
    position: usize,
    chars: PeekNth<Chars<'source>>,
    peek_buffer: VecDeque<Token>,
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // fn
    Identifier,       // lane

    /* Literals */
    BooleanLiteral, // true
    NoneLiteral,    // none
    IntegerLiteral, // 1
    FloatLiteral,   // 1.0

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Semicolon,    // ;
    Comma,        // ,

    /* Other */
    Colon,    // :
    Dot,      // .
    FatArrow, // =>

    /* Binary Ops */
    Plus,                 // +
    Minus,                // -
    Asterisk,             // *
    Divide,               // /
    Modulus,              // %
    DoubleEquals,         // ==
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Assignment */
    Equals,         // =
    PlusEquals,     // +=
    MinusEquals,    // -=
    MultiplyEquals, // *=
    DivideEquals,   // /=
    ModulusEquals,  // %=
}

impl TokenKind {
    pub fn is_assignment_operator(&self) -> bool {
        matches!(
            self,
            Self::Equals
                | Self::PlusEquals
                | Self::MinusEquals
                | Self::MultiplyEquals
                | Self::DivideEquals
                | Self::ModulusEquals
        )
    }

    pub fn is_comparison_operator(&self) -> bool {
        matches!(
            self,
            Self::NotEquals
                | Self::DoubleEquals
                | Self::LessThan
                | Self::LessThanOrEqualTo
                | Self::GreaterThan
                | Self::GreaterThanOrEqualTo
        )
    }

    pub fn is_term_operator(&self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    pub fn is_factor_operator(&self) -> bool {
        matches!(self, Self::Asterisk | Self::Divide | Self::Modulus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Fn,
    Record,
    Archetype,
    LevelMemory,
    LevelData,
    Streams,
    Stream,
    Let,
    If,
    Else,
    While,
    For,
    In,
    Match,
    Break,
    Continue,
    Return,
    Assert,
    Pass,
    And,
    Or,
    Not,
    Is,

    /* Storage class markers inside archetype bodies */
    Imported,
    Exported,
    Memory,
    Shared,
    Data,

    /* Recognized only to be rejected with a dedicated error */
    Try,
    Except,
    Raise,
    Global,
    Nonlocal,
    Import,
    Yield,
    Async,
    Await,
}

impl Keyword {
    /// Keywords that exist so their use can be reported as an unsupported
    /// construct instead of a generic parse error
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            Keyword::Try
                | Keyword::Except
                | Keyword::Raise
                | Keyword::Global
                | Keyword::Nonlocal
                | Keyword::Import
                | Keyword::Yield
                | Keyword::Async
                | Keyword::Await
        )
    }
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (';', TokenKind::Semicolon),
        (',', TokenKind::Comma),
        (':', TokenKind::Colon),
        ('.', TokenKind::Dot),
        ('*', TokenKind::Asterisk),
        ('-', TokenKind::Minus),
        ('=', TokenKind::Equals),
        ('+', TokenKind::Plus),
        ('/', TokenKind::Divide),
        ('%', TokenKind::Modulus),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile, source_id: SourceId) -> Self {
        Self {
            source,
            source_id,
            chars: peek_nth(source.contents.chars()),
            position: 0,
            peek_buffer: VecDeque::new(),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.peek_buffer.is_empty() && self.position >= self.source.contents.len()
    }

    pub fn source(&self) -> &SourceFile {
        self.source
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// A zero-width span at the current lexer position, for errors at EOF
    pub fn here(&self) -> Span {
        Span::new(self.source_id, self.position, self.position)
    }

    fn error(&self, span: Span, message: impl Into<String>) -> Diagnostic {
        Diagnostic::spanned(DiagnosticKind::Syntax, span, message)
    }

    fn ignore_whitespace(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if !c.is_ascii_whitespace() {
                break;
            }

            self.chars.next();
            self.position += 1;
        }
    }

    fn ignore_line(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if c == '\n' {
                break;
            }

            self.chars.next();
            self.position += c.len_utf8();
        }
    }

    // Keyword, identifier, or word-shaped literal
    fn read_word(&mut self) -> Token {
        let start_position = self.position;

        while let Some(c) = self.chars.peek().copied() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }

            self.chars.next();
            self.position += 1;
        }

        let span = self.new_span(start_position);
        let value = self.source.value_of_span(span);

        let kind = if let Ok(keyword) = value.parse() {
            TokenKind::Keyword(keyword)
        } else {
            match value {
                "true" | "false" => TokenKind::BooleanLiteral,
                "none" => TokenKind::NoneLiteral,
                _ => TokenKind::Identifier,
            }
        };

        Token { kind, span }
    }

    fn read_number(&mut self) -> Token {
        let start_position = self.position;
        let mut kind = TokenKind::IntegerLiteral;

        assert!(self.chars.peek().is_some());

        while let Some(c) = self.chars.peek().copied() {
            if c == '.' && self.chars.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
                kind = TokenKind::FloatLiteral;
                self.read_decimal_part();
                break;
            }

            if !c.is_ascii_digit() {
                break;
            }

            self.chars.next();
            self.position += 1;
        }

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn read_decimal_part(&mut self) -> Token {
        let start_position = self.position;

        assert!(self.chars.next().is_some());
        self.position += 1;

        while let Some(c) = self.chars.peek().copied() {
            if !c.is_ascii_digit() {
                break;
            }

            self.chars.next();
            self.position += 1;
        }

        Token {
            kind: TokenKind::FloatLiteral,
            span: self.new_span(start_position),
        }
    }

    fn read_single(&mut self, kind: TokenKind) -> Token {
        let start_position = self.position;

        self.chars.next();
        self.position += 1;

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn read_double(&mut self, kind: TokenKind) -> Token {
        let start_position = self.position;

        self.chars.next();
        self.chars.next();

        self.position += 2;

        Token {
            kind,
            span: self.new_span(start_position),
        }
    }

    fn new_span(&self, start: usize) -> Span {
        Span::new(self.source_id, start, self.position)
    }

    pub fn peek(&mut self) -> CompileResult<Option<Token>> {
        if !self.peek_buffer.is_empty() {
            return Ok(self.peek_buffer.front().copied());
        }

        if let Some(token) = self.next()? {
            self.peek_buffer.push_back(token);
        }

        Ok(self.peek_buffer.front().copied())
    }

    pub fn peek_nth(&mut self, n: usize) -> CompileResult<Option<Token>> {
        while self.peek_buffer.len() <= n {
            let Some(token) = self.next_from_stream()? else {
                return Ok(None);
            };
            self.peek_buffer.push_back(token);
        }

        Ok(self.peek_buffer.get(n).copied())
    }

    pub fn next(&mut self) -> CompileResult<Option<Token>> {
        if !self.peek_buffer.is_empty() {
            return Ok(self.peek_buffer.pop_front());
        }

        self.next_from_stream()
    }

    fn next_from_stream(&mut self) -> CompileResult<Option<Token>> {
        while let Some(c) = self.chars.peek().copied() {
            if !c.is_ascii() {
                return Err(self.error(
                    self.here(),
                    format!("Unexpected non-ascii character in stream: `{c}`"),
                ));
            }

            let token = match c {
                // Ignore whitespace
                c if c.is_whitespace() => {
                    self.ignore_whitespace();
                    continue;
                }
                // Ignore comments
                '/' if self.chars.peek_nth(1).is_some_and(|c| *c == '/') => {
                    self.ignore_line();
                    continue;
                }

                // Integer and float literals
                n if n.is_ascii_digit() => self.read_number(),
                '.' if self.chars.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.read_decimal_part()
                }

                // Identifiers, keywords, and word-shaped literals
                a if a.is_ascii_alphabetic() || a == '_' => self.read_word(),

                // Fat arrow (=>)
                '=' if self.chars.peek_nth(1).is_some_and(|c| *c == '>') => {
                    self.read_double(TokenKind::FatArrow)
                }

                // Double Equals (==)
                '=' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::DoubleEquals)
                }
                // Not Equals (!=)
                '!' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::NotEquals)
                }
                // Less than or equal (<=)
                '<' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::LessThanOrEqualTo)
                }
                // Greater than or equal (>=)
                '>' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::GreaterThanOrEqualTo)
                }

                // Plus equals (+=)
                '+' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::PlusEquals)
                }
                // Minus equals (-=)
                '-' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::MinusEquals)
                }
                // Multiply equals (*=)
                '*' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::MultiplyEquals)
                }
                // Divide equals (/=)
                '/' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::DivideEquals)
                }
                // Modulus equals (%=)
                '%' if self.chars.peek_nth(1).is_some_and(|c| *c == '=') => {
                    self.read_double(TokenKind::ModulusEquals)
                }

                s if SINGLE_TOKENS.contains_key(&s) => {
                    self.read_single(*SINGLE_TOKENS.get(&s).unwrap())
                }
                c => {
                    return Err(self.error(
                        Span::new(self.source_id, self.position, self.position + 1),
                        format!("Unexpected character in stream: `{c}`"),
                    ));
                }
            };

            return Ok(Some(token));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::SourceFile;
    use crate::index::Index;

    fn lex_kinds(source: &str) -> Vec<TokenKind> {
        let file = SourceFile::new_in_memory(source);
        let mut lexer = Lexer::new(&file, SourceId::new(0));
        let mut kinds = Vec::new();

        while let Some(token) = lexer.next().unwrap() {
            kinds.push(token.kind);
        }

        kinds
    }

    #[test]
    fn lexes_archetype_header() {
        assert_eq!(
            lex_kinds("archetype Note { imported lane: Scalar; }"),
            vec![
                TokenKind::Keyword(Keyword::Archetype),
                TokenKind::Identifier,
                TokenKind::OpenBrace,
                TokenKind::Keyword(Keyword::Imported),
                TokenKind::Identifier,
                TokenKind::Colon,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::CloseBrace,
            ]
        );
    }

    #[test]
    fn lexes_numbers_and_member_access() {
        assert_eq!(
            lex_kinds("x.y 1.5 2 .25"),
            vec![
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::FloatLiteral,
                TokenKind::IntegerLiteral,
                TokenKind::FloatLiteral,
            ]
        );
    }

    #[test]
    fn distinguishes_fat_arrow_from_comparisons() {
        assert_eq!(
            lex_kinds("=> == = >= >"),
            vec![
                TokenKind::FatArrow,
                TokenKind::DoubleEquals,
                TokenKind::Equals,
                TokenKind::GreaterThanOrEqualTo,
                TokenKind::GreaterThan,
            ]
        );
    }

    #[test]
    fn word_literals_and_rejected_keywords() {
        assert_eq!(
            lex_kinds("true none try lane"),
            vec![
                TokenKind::BooleanLiteral,
                TokenKind::NoneLiteral,
                TokenKind::Keyword(Keyword::Try),
                TokenKind::Identifier,
            ]
        );
        assert!(Keyword::Try.is_rejected());
        assert!(!Keyword::While.is_rejected());
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            lex_kinds("let x = 1; // trailing note\nx"),
            vec![
                TokenKind::Keyword(Keyword::Let),
                TokenKind::Identifier,
                TokenKind::Equals,
                TokenKind::IntegerLiteral,
                TokenKind::Semicolon,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn rejects_non_ascii() {
        let file = SourceFile::new_in_memory("let λ = 1;");
        let mut lexer = Lexer::new(&file, SourceId::new(0));

        lexer.next().unwrap();
        assert!(lexer.next().is_err());
    }
}
