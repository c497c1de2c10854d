//! Standard error type for all entity access operations.
//!
//! One error layer: **AccessError**, carrying a machine-readable
//! [`ErrorCode`], a human-readable message and optional structured context.
//!
//! # Propagation Rule
//!
//! Nothing at this layer recovers or retries. Failures raised by the
//! backing store (e.g. `STORE_UNAVAILABLE`) reach the caller unchanged;
//! the `retryable` flag only tells a higher-level collaborator whether a
//! retry could succeed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Error returned by every fallible repository, catalog and store operation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct AccessError {
    /// Error code (machine-readable)
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Additional context (parameter names, expected shapes, query names)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, serde_json::Value>>,

    /// Could the same call succeed if repeated later?
    pub retryable: bool,
}

impl AccessError {
    /// Create a new error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            retryable: code.is_typically_retryable(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let context = self.context.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            context.insert(key.into(), v);
        }
        self
    }

    /// Set retryable flag
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Look up a context value.
    pub fn context_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.as_ref().and_then(|c| c.get(key))
    }

    /// Check the error code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    // ═══════════════════════════════════════════════════════════
    // Common error constructors
    // ═══════════════════════════════════════════════════════════

    /// The named query is not registered in the catalog
    pub fn query_not_found(query_name: &str) -> Self {
        Self::new(
            ErrorCode::QueryNotFound,
            format!("Named query not found: {}", query_name),
        )
        .with_context("query", query_name)
    }

    /// Supplied arguments do not satisfy the declared parameters
    pub fn parameter_mismatch(query_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParameterMismatch, message).with_context("query", query_name)
    }

    /// Connectivity or resource failure in the backing store
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StoreUnavailable, message)
    }

    /// A query descriptor failed validation at build or registration time
    pub fn invalid_query(query_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidQuery, message).with_context("query", query_name)
    }

    /// A query with this name is already registered
    pub fn duplicate_query(query_name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateQuery,
            format!("Named query already registered: {}", query_name),
        )
        .with_context("query", query_name)
    }

    /// No entity with this identifier or key is known
    pub fn entity_not_found(key: impl std::fmt::Debug) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("Entity {:?} not found", key),
        )
    }

    /// An entity with this primary key or identifier is already attached or stored
    pub fn entity_exists(key: impl std::fmt::Debug) -> Self {
        Self::new(
            ErrorCode::EntityExists,
            format!("Entity {:?} already exists", key),
        )
    }

    /// A write was attempted inside a read-only scope
    pub fn read_only_violation(operation: &str) -> Self {
        Self::new(
            ErrorCode::ReadOnlyViolation,
            format!("{} is not allowed in a read-only scope", operation),
        )
        .with_context("operation", operation)
    }

    /// More than one row matched a single-instance lookup
    pub fn non_unique_result(query_name: &str, rows: usize) -> Self {
        Self::new(
            ErrorCode::NonUniqueResult,
            format!("Named query {} returned {} rows, expected at most one", query_name, rows),
        )
        .with_context("query", query_name)
        .with_context("rows", rows)
    }

    /// Internal error (bug)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl Default for AccessError {
    fn default() -> Self {
        Self::new(ErrorCode::Internal, "Unknown error")
    }
}

/// Error codes for entity access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ═══════════════════════════════════════════════════════
    // QUERY ERRORS
    // ═══════════════════════════════════════════════════════
    /// Named query not registered
    QueryNotFound,

    /// Arguments do not match the declared parameters
    ParameterMismatch,

    /// Query descriptor rejected at build/registration time
    InvalidQuery,

    /// Query name already taken
    DuplicateQuery,

    /// Several rows matched a single-instance lookup (opt-in policy only)
    NonUniqueResult,

    // ═══════════════════════════════════════════════════════
    // ENTITY ERRORS
    // ═══════════════════════════════════════════════════════
    /// Entity not attached and not stored
    EntityNotFound,

    /// Entity already attached or stored
    EntityExists,

    /// Write attempted in a read-only scope
    ReadOnlyViolation,

    // ═══════════════════════════════════════════════════════
    // STORE ERRORS
    // ═══════════════════════════════════════════════════════
    /// Backing store unreachable
    StoreUnavailable,

    /// Internal error (bug)
    Internal,
}

impl ErrorCode {
    /// Check if this error is typically retryable
    pub fn is_typically_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::QueryNotFound => "QUERY_NOT_FOUND",
            Self::ParameterMismatch => "PARAMETER_MISMATCH",
            Self::InvalidQuery => "INVALID_QUERY",
            Self::DuplicateQuery => "DUPLICATE_QUERY",
            Self::NonUniqueResult => "NON_UNIQUE_RESULT",
            Self::EntityNotFound => "ENTITY_NOT_FOUND",
            Self::EntityExists => "ENTITY_EXISTS",
            Self::ReadOnlyViolation => "READ_ONLY_VIOLATION",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

impl From<serde_json::Error> for AccessError {
    fn from(e: serde_json::Error) -> Self {
        AccessError::new(ErrorCode::Internal, format!("JSON error: {}", e))
    }
}

/// Result type alias for entity access operations
pub type AccessResult<T> = Result<T, AccessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_not_found() {
        let err = AccessError::query_not_found("Person.byAge");
        assert_eq!(err.code, ErrorCode::QueryNotFound);
        assert!(!err.retryable);
        assert!(err.message.contains("Person.byAge"));
        assert_eq!(err.context_value("query").unwrap(), "Person.byAge");
    }

    #[test]
    fn test_error_with_context() {
        let err = AccessError::parameter_mismatch("q", "wrong count")
            .with_context("expected", 2)
            .with_context("provided", 1);

        assert_eq!(err.context_value("expected").unwrap(), 2);
        assert_eq!(err.context_value("provided").unwrap(), 1);
        assert_eq!(err.to_string(), "[PARAMETER_MISMATCH] wrong count");
    }

    #[test]
    fn test_store_unavailable_is_retryable() {
        assert!(AccessError::store_unavailable("down").retryable);
        assert!(!AccessError::read_only_violation("flush").retryable);
        assert!(!AccessError::store_unavailable("down").retryable(false).retryable);
    }

    #[test]
    fn test_error_serialization() {
        let err = AccessError::duplicate_query("q");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("DUPLICATE_QUERY"));

        let recovered: AccessError = serde_json::from_str(&json).unwrap();
        assert_eq!(recovered.code, ErrorCode::DuplicateQuery);
    }
}
