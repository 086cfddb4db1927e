//! Lexer token types

use uuid::Uuid;

/// Token kinds for the expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Str(String),
    True,
    False,
    Null,

    // Property references
    Hash,            // '#'  (shorthand property reference)
    AtSelf,          // '@self'
    EntityRef(Uuid), // '@{8-4-4-4-12}'
    Identifier(String),

    // Path pieces
    Dot,
    LBracket,
    RBracket,

    // Grouping and calls
    LParen,
    RParen,
    Comma,

    // Operators
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,

    // Special
    Eof,
}

/// Byte-offset span of a token in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// The smallest span covering both inputs.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A token with its kind and source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}
