//! Trellis Expression Engine
//!
//! The expression language computed properties are written in: property
//! references (`#price`, `@self.parent.category.markup`,
//! `@{uuid}.name`, `[*]` collection traversal), literals, the usual
//! boolean/comparison/arithmetic operators, and a function library
//! (`SUM`, `IF`, `CONCAT`, ...).
//!
//! The pipeline is: source text → [`lexer`] tokens → [`parser`] AST →
//! either [`deps::extract_dependencies`] (at property-registration time) or
//! [`eval`] against a pre-loaded [`eval::EvalContext`] (at computation
//! time). The whole crate is pure CPU; the evaluator never touches storage.

pub mod lexer;
pub mod parser;
pub mod deps;
pub mod eval;
pub mod functions;

pub use deps::extract_dependencies;
pub use eval::{evaluate, EvalContext, EvalOutcome, MAX_EVAL_DEPTH};
pub use lexer::{Lexer, Span, Token, TokenKind};
pub use parser::{parse, BinaryOp, Expr, PathSegment, RefBase, Selector, UnaryOp};
