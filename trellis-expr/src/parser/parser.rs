//! Parser implementation
//!
//! Recursive-descent with one level per precedence tier, lowest first:
//! `||`, `&&`, `== !=`, `< > <= >=`, `+ -`, `* / %`, unary `! -`, primary.

use super::ast::*;
use crate::lexer::{Lexer, Span, Token, TokenKind};
use trellis_core::{EntityId, ExpressionError, ParseErrorCode, RecordIdType, Value};

/// Parse an expression source string into an AST.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expression()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    // ========================================================================
    // Precedence tiers
    // ========================================================================

    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        while self.check(&TokenKind::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.current().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.current().kind {
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            let op_span = self.current().span;
            self.advance();
            let operand = self.parse_unary()?;
            let span = op_span.merge(operand.span());
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            });
        }
        self.parse_primary()
    }

    // ========================================================================
    // Primary expressions
    // ========================================================================

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Some(Value::number(n)),
                    span: token.span,
                })
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Some(Value::text(s)),
                    span: token.span,
                })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal {
                    value: Some(Value::boolean(true)),
                    span: token.span,
                })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal {
                    value: Some(Value::boolean(false)),
                    span: token.span,
                })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal {
                    value: None,
                    span: token.span,
                })
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Hash => {
                self.advance();
                let (name, name_span) = self.expect_identifier()?;
                Ok(Expr::Identifier {
                    name,
                    span: token.span.merge(name_span),
                })
            }
            TokenKind::AtSelf => {
                self.advance();
                self.parse_property_ref(RefBase::Current, token.span)
            }
            TokenKind::EntityRef(uuid) => {
                self.advance();
                self.parse_property_ref(RefBase::Entity(EntityId::new(uuid)), token.span)
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.parse_call(name, token.span)
            }
            TokenKind::Eof => Err(self.error(
                ParseErrorCode::UnexpectedEnd,
                token.span.start,
                "unexpected end of expression",
            )),
            other => Err(self.error(
                ParseErrorCode::UnexpectedToken,
                token.span.start,
                &format!("unexpected token {:?}", other),
            )),
        }
    }

    /// Parse the `.seg[sel].seg...` tail of a property reference.
    fn parse_property_ref(
        &mut self,
        base: RefBase,
        base_span: Span,
    ) -> Result<Expr, ExpressionError> {
        self.expect(&TokenKind::Dot)?;

        let mut segments = Vec::new();
        let mut span = base_span;
        loop {
            let (name, name_span) = self.expect_identifier()?;
            span = span.merge(name_span);

            let selector = if self.check(&TokenKind::LBracket) {
                self.advance();
                let selector = match self.current().kind {
                    TokenKind::Star => {
                        self.advance();
                        Selector::All
                    }
                    TokenKind::Number(n) => {
                        if n.fract() != 0.0 || n < 0.0 {
                            return Err(self.error(
                                ParseErrorCode::UnexpectedToken,
                                self.current().span.start,
                                "index selector must be a non-negative integer",
                            ));
                        }
                        self.advance();
                        Selector::Index(n as usize)
                    }
                    _ => {
                        return Err(self.error(
                            ParseErrorCode::UnexpectedToken,
                            self.current().span.start,
                            "expected '*' or an index inside '[]'",
                        ));
                    }
                };
                let close = self.expect(&TokenKind::RBracket)?;
                span = span.merge(close);
                selector
            } else {
                Selector::One
            };

            segments.push(PathSegment { name, selector });

            if self.check(&TokenKind::Dot) {
                self.advance();
            } else {
                break;
            }
        }

        Ok(Expr::PropertyRef {
            base,
            segments,
            span,
        })
    }

    /// Parse a function call; a bare identifier that is not followed by an
    /// argument list is not a valid expression.
    fn parse_call(&mut self, name: String, name_span: Span) -> Result<Expr, ExpressionError> {
        if !self.check(&TokenKind::LParen) {
            return Err(self.error(
                ParseErrorCode::UnexpectedToken,
                name_span.start,
                &format!(
                    "bare identifier '{}'; property references use '#{}' or '@self.{}'",
                    name, name, name
                ),
            ));
        }
        self.advance();

        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if self.check(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let close = self.expect(&TokenKind::RParen)?;

        Ok(Expr::Call {
            name,
            args,
            span: name_span.merge(close),
        })
    }

    // ========================================================================
    // Token plumbing
    // ========================================================================

    fn current(&self) -> &Token {
        // The token stream always ends with Eof, so pos stays in bounds.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Span, ExpressionError> {
        let token = self.current();
        if &token.kind == kind {
            let span = token.span;
            self.advance();
            Ok(span)
        } else if token.kind == TokenKind::Eof {
            Err(self.error(
                ParseErrorCode::UnexpectedEnd,
                token.span.start,
                &format!("expected {:?}, found end of expression", kind),
            ))
        } else {
            Err(self.error(
                ParseErrorCode::UnexpectedToken,
                token.span.start,
                &format!("expected {:?}, found {:?}", kind, token.kind),
            ))
        }
    }

    fn expect_identifier(&mut self) -> Result<(String, Span), ExpressionError> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok((name, token.span))
            }
            TokenKind::Eof => Err(self.error(
                ParseErrorCode::UnexpectedEnd,
                token.span.start,
                "expected an identifier, found end of expression",
            )),
            other => Err(self.error(
                ParseErrorCode::UnexpectedToken,
                token.span.start,
                &format!("expected an identifier, found {:?}", other),
            )),
        }
    }

    fn expect_eof(&mut self) -> Result<(), ExpressionError> {
        let token = self.current();
        if token.kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error(
                ParseErrorCode::UnexpectedToken,
                token.span.start,
                &format!("trailing input: {:?}", token.kind),
            ))
        }
    }

    fn error(&self, code: ParseErrorCode, offset: usize, message: &str) -> ExpressionError {
        ExpressionError::Parse {
            code,
            offset,
            message: message.to_string(),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let span = left.span().merge(right.span());
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
        span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Expr {
        parse(source).unwrap_or_else(|e| panic!("parse of {:?} failed: {}", source, e))
    }

    #[test]
    fn test_multiplication_binds_tighter_than_addition() {
        let expr = parse_ok("1 + 2 * 3");
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => match *right {
                Expr::Binary {
                    op: BinaryOp::Mul, ..
                } => {}
                other => panic!("right side should be the product, got {:?}", other),
            },
            other => panic!("expected top-level addition, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_binds_tighter_than_and() {
        let expr = parse_ok("#a > 5 && #b < 10");
        match expr {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
                ..
            } => {
                assert!(matches!(
                    *left,
                    Expr::Binary {
                        op: BinaryOp::Gt,
                        ..
                    }
                ));
                assert!(matches!(
                    *right,
                    Expr::Binary {
                        op: BinaryOp::Lt,
                        ..
                    }
                ));
            }
            other => panic!("expected top-level &&, got {:?}", other),
        }
    }

    #[test]
    fn test_grouping_overrides_precedence() {
        let expr = parse_ok("(1 + 2) * 3");
        match expr {
            Expr::Binary {
                op: BinaryOp::Mul,
                left,
                ..
            } => {
                assert!(matches!(
                    *left,
                    Expr::Binary {
                        op: BinaryOp::Add,
                        ..
                    }
                ));
            }
            other => panic!("expected top-level product, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_binds_tighter_than_multiplication() {
        let expr = parse_ok("-#x * 2");
        match expr {
            Expr::Binary {
                op: BinaryOp::Mul,
                left,
                ..
            } => {
                assert!(matches!(
                    *left,
                    Expr::Unary {
                        op: UnaryOp::Neg,
                        ..
                    }
                ));
            }
            other => panic!("expected (-#x) * 2, got {:?}", other),
        }
    }

    #[test]
    fn test_shorthand_identifier() {
        let expr = parse_ok("#price");
        match expr {
            Expr::Identifier { name, .. } => assert_eq!(name, "price"),
            other => panic!("expected identifier, got {:?}", other),
        }
    }

    #[test]
    fn test_self_path_with_segments() {
        let expr = parse_ok("@self.parent.category.markup");
        match expr {
            Expr::PropertyRef {
                base: RefBase::Current,
                segments,
                ..
            } => {
                let names: Vec<&str> = segments.iter().map(|s| s.name.as_str()).collect();
                assert_eq!(names, vec!["parent", "category", "markup"]);
                assert!(segments.iter().all(|s| s.selector == Selector::One));
            }
            other => panic!("expected property reference, got {:?}", other),
        }
    }

    #[test]
    fn test_collection_and_index_selectors() {
        let expr = parse_ok("@self.items[*].price");
        match expr {
            Expr::PropertyRef { segments, .. } => {
                assert_eq!(segments[0].selector, Selector::All);
                assert_eq!(segments[1].selector, Selector::One);
            }
            other => panic!("expected property reference, got {:?}", other),
        }

        let expr = parse_ok("@self.items[2].price");
        match expr {
            Expr::PropertyRef { segments, .. } => {
                assert_eq!(segments[0].selector, Selector::Index(2));
            }
            other => panic!("expected property reference, got {:?}", other),
        }
    }

    #[test]
    fn test_entity_ref_base() {
        let expr = parse_ok("@{550e8400-e29b-41d4-a716-446655440000}.name");
        match expr {
            Expr::PropertyRef {
                base: RefBase::Entity(id),
                ..
            } => {
                assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
            }
            other => panic!("expected entity-based reference, got {:?}", other),
        }
    }

    #[test]
    fn test_function_call() {
        let expr = parse_ok("SUM(@self.items[*].price)");
        match expr {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "SUM");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_calls_and_args() {
        let expr = parse_ok("IF(#qty > 0, ROUND(#price * #qty, 2), null)");
        match expr {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "IF");
                assert_eq!(args.len(), 3);
                assert!(matches!(args[2], Expr::Literal { value: None, .. }));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_literals() {
        assert!(matches!(
            parse_ok("null"),
            Expr::Literal { value: None, .. }
        ));
        match parse_ok("'hi'") {
            Expr::Literal { value: Some(v), .. } => assert_eq!(v.as_text(), Some("hi")),
            other => panic!("expected text literal, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_end() {
        let err = parse("1 +").expect_err("should fail");
        assert!(matches!(
            err,
            ExpressionError::Parse {
                code: ParseErrorCode::UnexpectedEnd,
                ..
            }
        ));
    }

    #[test]
    fn test_bare_identifier_rejected() {
        let err = parse("price").expect_err("should fail");
        assert!(matches!(
            err,
            ExpressionError::Parse {
                code: ParseErrorCode::UnexpectedToken,
                ..
            }
        ));
    }

    #[test]
    fn test_trailing_input_rejected() {
        let err = parse("1 2").expect_err("should fail");
        match err {
            ExpressionError::Parse { code, offset, .. } => {
                assert_eq!(code, ParseErrorCode::UnexpectedToken);
                assert_eq!(offset, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_error_offsets_are_byte_positions() {
        let err = parse("1 + )").expect_err("should fail");
        match err {
            ExpressionError::Parse { offset, .. } => assert_eq!(offset, 4),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
