//! Error taxonomy for Trellis operations
//!
//! Every error the kernel can surface is tagged with one of the stable
//! SCREAMING_SNAKE codes via [`TrellisError::code`], which the API layer
//! maps onto HTTP statuses. Business errors carry enough structure for the
//! `details` map of an error response.

use crate::{Cardinality, EntityId};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

// ============================================================================
// EXPRESSION ERRORS
// ============================================================================

/// Codes for expression parse failures. Every parse error carries one of
/// these plus a byte offset into the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorCode {
    UnexpectedToken,
    UnexpectedEnd,
    InvalidNumber,
    InvalidUuid,
    InvalidEscape,
    UnterminatedString,
}

impl ParseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorCode::UnexpectedToken => "UNEXPECTED_TOKEN",
            ParseErrorCode::UnexpectedEnd => "UNEXPECTED_END",
            ParseErrorCode::InvalidNumber => "INVALID_NUMBER",
            ParseErrorCode::InvalidUuid => "INVALID_UUID",
            ParseErrorCode::InvalidEscape => "INVALID_ESCAPE",
            ParseErrorCode::UnterminatedString => "UNTERMINATED_STRING",
        }
    }
}

/// Expression pipeline errors: lexing, parsing, and evaluation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Invalid expression at offset {offset}: {message} [{}]", code.as_str())]
    Parse {
        code: ParseErrorCode,
        offset: usize,
        message: String,
    },

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Maximum evaluation depth exceeded ({max})")]
    MaxDepthExceeded { max: usize },

    #[error("Circular dependency: {chain}")]
    CircularDependency { chain: String },

    #[error("Domain error in {function}: {reason}")]
    DomainError { function: String, reason: String },
}

// ============================================================================
// STORAGE ERRORS
// ============================================================================

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("Broken reference to entity {entity_id}: {reason}")]
    ReferenceBroken { entity_id: EntityId, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("Storage internal error: {reason}")]
    Internal { reason: String },
}

// ============================================================================
// VALIDATION ERRORS
// ============================================================================

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Cardinality violation on {relationship_type}: {cardinality}")]
    CardinalityViolation {
        relationship_type: String,
        cardinality: Cardinality,
    },

    #[error("Relationship type not registered: {relationship_type}")]
    SchemaNotRegistered { relationship_type: String },

    #[error("Self-referencing relationship on entity {entity_id}")]
    SelfReference { entity_id: EntityId },
}

// ============================================================================
// ACCESS ERRORS
// ============================================================================

/// Authorization and tenancy errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AccessError {
    #[error("Permission denied: {action}")]
    PermissionDenied { action: String },

    #[error("Tenant mismatch: {reason}")]
    TenantMismatch { reason: String },
}

// ============================================================================
// MASTER ERROR TYPE
// ============================================================================

/// Master error type for all Trellis operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrellisError {
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Access error: {0}")]
    Access(#[from] AccessError),
}

impl TrellisError {
    /// The stable taxonomy code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            TrellisError::Expression(e) => match e {
                ExpressionError::Parse { .. } => "INVALID_EXPRESSION",
                ExpressionError::TypeMismatch { .. } => "TYPE_MISMATCH",
                ExpressionError::DivisionByZero => "DIVISION_BY_ZERO",
                ExpressionError::UnknownFunction { .. } => "UNKNOWN_FUNCTION",
                ExpressionError::MaxDepthExceeded { .. } => "MAX_DEPTH_EXCEEDED",
                ExpressionError::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
                ExpressionError::DomainError { .. } => "DOMAIN_ERROR",
            },
            TrellisError::Storage(e) => match e {
                StorageError::NotFound { .. } => "NOT_FOUND",
                StorageError::AlreadyExists { .. } => "ALREADY_EXISTS",
                StorageError::VersionConflict { .. } => "VERSION_CONFLICT",
                StorageError::ReferenceBroken { .. } => "REFERENCE_BROKEN",
                StorageError::DeadlineExceeded => "DEADLINE_EXCEEDED",
                StorageError::TransactionFailed { .. } | StorageError::Internal { .. } => {
                    "INTERNAL_ERROR"
                }
            },
            TrellisError::Validation(_) => "VALIDATION_ERROR",
            TrellisError::Access(e) => match e {
                AccessError::PermissionDenied { .. } => "PERMISSION_DENIED",
                AccessError::TenantMismatch { .. } => "TENANT_MISMATCH",
            },
        }
    }

    /// Structured details for the error response body, when the variant has
    /// anything structured to say.
    pub fn details(&self) -> Option<JsonValue> {
        match self {
            TrellisError::Expression(ExpressionError::Parse { code, offset, .. }) => Some(json!({
                "parse_code": code.as_str(),
                "position": offset,
            })),
            TrellisError::Storage(StorageError::VersionConflict { expected, actual }) => {
                Some(json!({
                    "expected_version": expected,
                    "actual_version": actual,
                }))
            }
            TrellisError::Storage(StorageError::NotFound { kind, id }) => Some(json!({
                "kind": kind,
                "id": id,
                // For endpoint lookups the kind doubles as the request
                // field that named the missing record.
                "field": kind,
            })),
            TrellisError::Validation(ValidationError::CardinalityViolation {
                relationship_type,
                cardinality,
            }) => Some(json!({
                "relationship_type": relationship_type,
                "cardinality": cardinality.as_str(),
            })),
            TrellisError::Validation(ValidationError::RequiredFieldMissing { field })
            | TrellisError::Validation(ValidationError::InvalidValue { field, .. }) => {
                Some(json!({ "field": field }))
            }
            _ => None,
        }
    }

    /// Convenience constructor for not-found errors.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        TrellisError::Storage(StorageError::NotFound {
            kind,
            id: id.to_string(),
        })
    }
}

/// Result type alias for Trellis operations.
pub type TrellisResult<T> = Result<T, TrellisError>;
