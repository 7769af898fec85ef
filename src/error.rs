//! Engine Error Types
//!
//! Three error classes, matching how failures are handled:
//!
//! - **User errors**: malformed expressions, out-of-range indices, invalid
//!   step sizes. Fatal, user-readable, tagged with a stable identifier for
//!   log correlation. Never retried.
//! - **Internal consistency errors**: the optimizer produced a type mismatch,
//!   an index node carried the wrong tag byte, a free variable escaped
//!   normalization. These are engine bugs and abort with maximal diagnostic
//!   context.
//! - **Resource errors**: file-open or decode failures, carrying path/offset
//!   context.
//!
//! No error in this crate is caught and suppressed; every failure path
//! terminates the current evaluation unit.

use std::io;
use thiserror::Error;

/// Stable error identifiers attached to user-facing failures.
///
/// These strings are load-bearing: they appear in logs on every layer that
/// touches a failed evaluation and must never be renamed.
pub mod error_id {
    /// Array or stream index out of bounds
    pub const ARRAY_INDEX: &str = "locus.user.array_index";
    /// Integer division by zero
    pub const DIV_BY_ZERO: &str = "locus.user.div_by_zero";
    /// `StreamRange` with a zero step
    pub const RANGE_STEP: &str = "locus.user.range_step";
    /// Type mismatch at IR construction
    pub const TYPE_ERROR: &str = "locus.user.type_error";
    /// Explicit `Die` node reached during evaluation
    pub const DIE: &str = "locus.user.die";
    /// Zipped streams declared same-length but were not
    pub const ZIP_LENGTH: &str = "locus.user.zip_length";
    /// Index writer handed keys out of order
    pub const UNSORTED_KEYS: &str = "locus.user.unsorted_keys";
}

/// Errors produced by the execution core
#[derive(Error, Debug)]
pub enum EngineError {
    /// User error: bad input expression or data. Carries a stable identifier
    /// from [`error_id`] for cross-layer log correlation.
    #[error("[{id}] {message}")]
    User {
        /// Stable identifier (see [`error_id`])
        id: &'static str,
        /// Human-readable description
        message: String,
    },

    /// Internal consistency error: a bug in the engine itself.
    #[error("internal error in {context}: {detail}")]
    Internal {
        /// Which component detected the inconsistency
        context: &'static str,
        /// Diagnostic detail (offending sub-tree, computed values)
        detail: String,
    },

    /// Resource error with path context
    #[error("resource error at {path}: {detail}")]
    Resource {
        /// File path involved
        path: String,
        /// Byte offset, if the failure is positional
        offset: Option<u64>,
        /// What went wrong
        detail: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Binary codec error (node payloads, aggregator snapshots)
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// JSON error (index metadata)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Construct a user error with a stable identifier
    pub fn user(id: &'static str, message: impl Into<String>) -> Self {
        EngineError::User {
            id,
            message: message.into(),
        }
    }

    /// Construct an internal consistency error
    pub fn internal(context: &'static str, detail: impl Into<String>) -> Self {
        EngineError::Internal {
            context,
            detail: detail.into(),
        }
    }

    /// Construct a resource error with optional offset context
    pub fn resource(path: impl Into<String>, offset: Option<u64>, detail: impl Into<String>) -> Self {
        EngineError::Resource {
            path: path.into(),
            offset,
            detail: detail.into(),
        }
    }

    /// True for errors that indicate an engine bug rather than bad input
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::Internal { .. })
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
