//! Lexer implementation

use super::token::*;
use std::iter::Peekable;
use std::str::CharIndices;
use trellis_core::{ExpressionError, ParseErrorCode};
use uuid::Uuid;

/// Lexer for the expression language.
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            pos: 0,
        }
    }

    /// Tokenize the entire source into a vector of tokens, ending with Eof.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    /// Get the next token from the source.
    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        self.skip_whitespace();

        let start_pos = self.pos;

        let kind = match self.peek_char() {
            None => TokenKind::Eof,
            Some(c) => match c {
                '(' => {
                    self.advance();
                    TokenKind::LParen
                }
                ')' => {
                    self.advance();
                    TokenKind::RParen
                }
                '[' => {
                    self.advance();
                    TokenKind::LBracket
                }
                ']' => {
                    self.advance();
                    TokenKind::RBracket
                }
                ',' => {
                    self.advance();
                    TokenKind::Comma
                }
                '.' => {
                    self.advance();
                    TokenKind::Dot
                }
                '#' => {
                    self.advance();
                    TokenKind::Hash
                }
                '+' => {
                    self.advance();
                    TokenKind::Plus
                }
                '-' => {
                    self.advance();
                    TokenKind::Minus
                }
                '*' => {
                    self.advance();
                    TokenKind::Star
                }
                '/' => {
                    self.advance();
                    TokenKind::Slash
                }
                '%' => {
                    self.advance();
                    TokenKind::Percent
                }

                '=' => {
                    self.advance();
                    if self.peek_char() == Some('=') {
                        self.advance();
                        TokenKind::EqEq
                    } else {
                        return Err(self.error(
                            ParseErrorCode::UnexpectedToken,
                            start_pos,
                            "expected '==', found a single '='",
                        ));
                    }
                }

                '!' => {
                    self.advance();
                    if self.peek_char() == Some('=') {
                        self.advance();
                        TokenKind::NotEq
                    } else {
                        TokenKind::Bang
                    }
                }

                '>' => {
                    self.advance();
                    if self.peek_char() == Some('=') {
                        self.advance();
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }

                '<' => {
                    self.advance();
                    if self.peek_char() == Some('=') {
                        self.advance();
                        TokenKind::Le
                    } else {
                        TokenKind::Lt
                    }
                }

                '&' => {
                    self.advance();
                    if self.peek_char() == Some('&') {
                        self.advance();
                        TokenKind::AndAnd
                    } else {
                        return Err(self.error(
                            ParseErrorCode::UnexpectedToken,
                            start_pos,
                            "expected '&&', found a single '&'",
                        ));
                    }
                }

                '|' => {
                    self.advance();
                    if self.peek_char() == Some('|') {
                        self.advance();
                        TokenKind::OrOr
                    } else {
                        return Err(self.error(
                            ParseErrorCode::UnexpectedToken,
                            start_pos,
                            "expected '||', found a single '|'",
                        ));
                    }
                }

                '@' => self.scan_entity_ref(start_pos)?,

                '"' | '\'' => self.scan_string(start_pos)?,

                c if c.is_ascii_digit() => self.scan_number(start_pos)?,

                c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier(),

                c => {
                    self.advance();
                    return Err(self.error(
                        ParseErrorCode::UnexpectedToken,
                        start_pos,
                        &format!("unexpected character '{}'", c),
                    ));
                }
            },
        };

        Ok(Token {
            kind,
            span: Span::new(start_pos, self.pos),
        })
    }

    /// Scan an identifier or keyword literal.
    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let ident = &self.source[start..self.pos];

        match ident {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Identifier(ident.to_string()),
        }
    }

    /// Scan an `@self` keyword or an `@{uuid}` entity reference.
    fn scan_entity_ref(&mut self, start_pos: usize) -> Result<TokenKind, ExpressionError> {
        self.advance(); // consume '@'

        match self.peek_char() {
            Some('{') => {
                self.advance();
                let uuid_start = self.pos;
                while let Some(c) = self.peek_char() {
                    if c == '}' {
                        break;
                    }
                    self.advance();
                }
                if self.peek_char() != Some('}') {
                    return Err(self.error(
                        ParseErrorCode::InvalidUuid,
                        start_pos,
                        "unterminated entity reference, expected '}'",
                    ));
                }
                let uuid_end = self.pos;
                self.advance(); // consume '}'
                let text = &self.source[uuid_start..uuid_end];

                if !is_canonical_uuid(text) {
                    return Err(self.error(
                        ParseErrorCode::InvalidUuid,
                        start_pos,
                        &format!("'{}' is not an 8-4-4-4-12 hex UUID", text),
                    ));
                }
                let uuid = Uuid::parse_str(text).map_err(|e| {
                    self.error(
                        ParseErrorCode::InvalidUuid,
                        start_pos,
                        &format!("'{}' is not a valid UUID: {}", text, e),
                    )
                })?;
                Ok(TokenKind::EntityRef(uuid))
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let kind = self.scan_identifier();
                match kind {
                    TokenKind::Identifier(ref name) if name == "self" => Ok(TokenKind::AtSelf),
                    _ => Err(self.error(
                        ParseErrorCode::UnexpectedToken,
                        start_pos,
                        "expected 'self' or '{uuid}' after '@'",
                    )),
                }
            }
            _ => Err(self.error(
                ParseErrorCode::UnexpectedToken,
                start_pos,
                "expected 'self' or '{uuid}' after '@'",
            )),
        }
    }

    /// Scan a string literal with escape sequences. Either quote style is
    /// accepted; the delimiters must match.
    fn scan_string(&mut self, start_pos: usize) -> Result<TokenKind, ExpressionError> {
        let quote = self.advance().expect("caller saw the opening quote");
        let mut value = String::new();

        loop {
            match self.peek_char() {
                None => {
                    return Err(self.error(
                        ParseErrorCode::UnterminatedString,
                        start_pos,
                        "string literal never closed",
                    ));
                }
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    let escape_pos = self.pos;
                    self.advance();
                    match self.peek_char() {
                        Some('n') => {
                            self.advance();
                            value.push('\n');
                        }
                        Some('r') => {
                            self.advance();
                            value.push('\r');
                        }
                        Some('t') => {
                            self.advance();
                            value.push('\t');
                        }
                        Some('\\') => {
                            self.advance();
                            value.push('\\');
                        }
                        Some('"') => {
                            self.advance();
                            value.push('"');
                        }
                        Some('\'') => {
                            self.advance();
                            value.push('\'');
                        }
                        Some(c) => {
                            return Err(self.error(
                                ParseErrorCode::InvalidEscape,
                                escape_pos,
                                &format!("unsupported escape '\\{}'", c),
                            ));
                        }
                        None => {
                            return Err(self.error(
                                ParseErrorCode::UnterminatedString,
                                start_pos,
                                "string literal never closed",
                            ));
                        }
                    }
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        Ok(TokenKind::Str(value))
    }

    /// Scan a number literal: digits, optional fraction, optional exponent.
    fn scan_number(&mut self, start_pos: usize) -> Result<TokenKind, ExpressionError> {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.advance();
            } else {
                break;
            }
        }

        // Fraction, only when the dot is followed by a digit (a bare dot is
        // a path separator, not part of the number).
        if self.peek_char() == Some('.')
            && self
                .peek_next_char()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            self.advance();
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        // Exponent
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            self.advance();
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                self.advance();
            }
            let mut exp_digits = false;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    exp_digits = true;
                    self.advance();
                } else {
                    break;
                }
            }
            if !exp_digits {
                return Err(self.error(
                    ParseErrorCode::InvalidNumber,
                    start_pos,
                    "exponent has no digits",
                ));
            }
        }

        let text = &self.source[start_pos..self.pos];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| {
                self.error(
                    ParseErrorCode::InvalidNumber,
                    start_pos,
                    &format!("'{}' is not a valid number", text),
                )
            })
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn error(&self, code: ParseErrorCode, offset: usize, message: &str) -> ExpressionError {
        ExpressionError::Parse {
            code,
            offset,
            message: message.to_string(),
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next_char(&self) -> Option<char> {
        let mut iter = self.source[self.pos..].chars();
        iter.next();
        iter.next()
    }

    fn advance(&mut self) -> Option<char> {
        if let Some((i, c)) = self.chars.next() {
            self.pos = i + c.len_utf8();
            Some(c)
        } else {
            None
        }
    }
}

/// Strict 8-4-4-4-12 hex layout check.
fn is_canonical_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn lex_err(source: &str) -> ExpressionError {
        Lexer::new(source).tokenize().expect_err("should fail")
    }

    #[test]
    fn test_operator_tokens() {
        assert_eq!(
            kinds("|| && == != < > <= >= + - * / % !"),
            vec![
                TokenKind::OrOr,
                TokenKind::AndAnd,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Bang,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_single_ampersand_rejected() {
        let err = lex_err("a & b");
        assert!(matches!(
            err,
            ExpressionError::Parse {
                code: ParseErrorCode::UnexpectedToken,
                ..
            }
        ));
    }

    #[test]
    fn test_keyword_literals() {
        assert_eq!(
            kinds("true false null"),
            vec![
                TokenKind::True,
                TokenKind::False,
                TokenKind::Null,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 1e3 2.5E-2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Number(2.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.025),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_exponent_without_digits_rejected() {
        let err = lex_err("1e");
        assert!(matches!(
            err,
            ExpressionError::Parse {
                code: ParseErrorCode::InvalidNumber,
                ..
            }
        ));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\tc\\d\"e""#),
            vec![TokenKind::Str("a\nb\tc\\d\"e".to_string()), TokenKind::Eof]
        );
        assert_eq!(
            kinds(r#"'it\'s'"#),
            vec![TokenKind::Str("it's".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_invalid_escape_rejected() {
        let err = lex_err(r#""a\qb""#);
        match err {
            ExpressionError::Parse { code, offset, .. } => {
                assert_eq!(code, ParseErrorCode::InvalidEscape);
                assert_eq!(offset, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string_has_position() {
        let err = lex_err("1 + \"abc");
        match err {
            ExpressionError::Parse { code, offset, .. } => {
                assert_eq!(code, ParseErrorCode::UnterminatedString);
                assert_eq!(offset, 4);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_property_shorthand() {
        assert_eq!(
            kinds("#price"),
            vec![
                TokenKind::Hash,
                TokenKind::Identifier("price".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_at_self() {
        assert_eq!(
            kinds("@self.name"),
            vec![
                TokenKind::AtSelf,
                TokenKind::Dot,
                TokenKind::Identifier("name".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_entity_ref_uuid() {
        let toks = kinds("@{550e8400-e29b-41d4-a716-446655440000}.name");
        assert_eq!(
            toks[0],
            TokenKind::EntityRef(
                Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").expect("valid")
            )
        );
    }

    #[test]
    fn test_invalid_uuid_rejected() {
        for source in [
            "@{not-a-uuid}.name",
            "@{550e8400e29b41d4a716446655440000}.name", // missing dashes
            "@{550e8400-e29b-41d4-a716-44665544000g}.x", // non-hex
            "@{550e8400-e29b-41d4-a716-446655440000",    // unterminated
        ] {
            let err = lex_err(source);
            assert!(
                matches!(
                    err,
                    ExpressionError::Parse {
                        code: ParseErrorCode::InvalidUuid,
                        ..
                    }
                ),
                "source {:?} gave {:?}",
                source,
                err
            );
        }
    }

    #[test]
    fn test_collection_markers() {
        assert_eq!(
            kinds("@self.items[*].price"),
            vec![
                TokenKind::AtSelf,
                TokenKind::Dot,
                TokenKind::Identifier("items".to_string()),
                TokenKind::LBracket,
                TokenKind::Star,
                TokenKind::RBracket,
                TokenKind::Dot,
                TokenKind::Identifier("price".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_spans_are_byte_offsets() {
        let tokens = Lexer::new("#a + 10").tokenize().expect("tokenize");
        assert_eq!(tokens[0].span, Span::new(0, 1));
        assert_eq!(tokens[1].span, Span::new(1, 2));
        assert_eq!(tokens[2].span, Span::new(3, 4));
        assert_eq!(tokens[3].span, Span::new(5, 7));
    }
}
