//! Error types for the shapedb storage and query core.
//!
//! One workspace-wide error enum with structured variants, each mapping to a
//! stable numeric [`ErrorCode`] suitable for direct passthrough to a REST
//! error body. Lookup-style "not found" conditions are normal outcomes and
//! are returned as `Option::None` by the APIs that allow it; the variants
//! here are for hard failures.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ShapeDbError>;

/// Primary error type for shapedb operations.
#[derive(Error, Debug)]
pub enum ShapeDbError {
    // === Resource errors ===
    /// Allocation failure. Always propagated immediately, never swallowed.
    #[error("out of memory")]
    OutOfMemory,

    /// A durable write did not complete.
    #[error("write failed: {detail}")]
    WriteFailed { detail: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lookup / naming errors ===
    /// A collection, shape, attribute or index is absent where the contract
    /// requires it to exist.
    #[error("{what} not found: '{name}'")]
    NotFound { what: &'static str, name: String },

    /// A creation conflicted with an existing name.
    #[error("duplicate name: '{name}'")]
    DuplicateName { name: String },

    /// A creation conflicted with an existing identifier.
    #[error("duplicate identifier: {id}")]
    DuplicateIdentifier { id: u64 },

    // === Structural errors ===
    /// A collection failed to reopen. Blocks all further use of that
    /// collection until manual intervention.
    #[error("collection '{name}' is corrupted: {detail}")]
    CorruptedCollection { name: String, detail: String },

    /// A configuration value was rejected before any state change.
    #[error("invalid configuration: {detail}")]
    InvalidConfiguration { detail: String },

    // === Query errors ===
    /// The query was killed via its cancellation flag.
    #[error("query killed")]
    QueryKilled,

    /// The query was aborted because an operator could not complete its
    /// contract.
    #[error("query aborted: {detail}")]
    QueryAborted { detail: String },

    /// An operation was invoked in a state that does not permit it.
    #[error("invalid state: {detail}")]
    InvalidState { detail: String },

    /// The enclosing write transaction was rolled back.
    #[error("transaction {tid} aborted")]
    TransactionAborted { tid: u64 },

    /// An aggregate operator observed group keys out of sort order. The
    /// planner must place a sort upstream of every collect.
    #[error("aggregate input not sorted by group key at row {row}")]
    GroupOrderViolated { row: usize },

    /// Item blocks with differing register counts were combined.
    #[error("register count mismatch: expected {expected}, got {actual}")]
    RegisterMismatch { expected: usize, actual: usize },
}

/// Stable numeric codes, one per error family.
///
/// These are part of the wire contract: the REST layer forwards them
/// verbatim, so values must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    OutOfMemory = 32,
    WriteFailed = 33,
    Io = 34,
    NotFound = 40,
    DuplicateName = 41,
    DuplicateIdentifier = 42,
    CorruptedCollection = 43,
    InvalidConfiguration = 44,
    QueryKilled = 50,
    QueryAborted = 51,
    InvalidState = 52,
    TransactionAborted = 53,
    GroupOrderViolated = 54,
    RegisterMismatch = 55,
}

impl ShapeDbError {
    /// Map this error to its stable numeric code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::WriteFailed { .. } => ErrorCode::WriteFailed,
            Self::Io(_) => ErrorCode::Io,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::DuplicateName { .. } => ErrorCode::DuplicateName,
            Self::DuplicateIdentifier { .. } => ErrorCode::DuplicateIdentifier,
            Self::CorruptedCollection { .. } => ErrorCode::CorruptedCollection,
            Self::InvalidConfiguration { .. } => ErrorCode::InvalidConfiguration,
            Self::QueryKilled => ErrorCode::QueryKilled,
            Self::QueryAborted { .. } => ErrorCode::QueryAborted,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            Self::GroupOrderViolated { .. } => ErrorCode::GroupOrderViolated,
            Self::RegisterMismatch { .. } => ErrorCode::RegisterMismatch,
        }
    }

    /// Whether this error denotes a missing entity rather than a failure.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Shorthand for a [`ShapeDbError::NotFound`] for a collection.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            what: "collection",
            name: name.into(),
        }
    }

    /// Shorthand for a [`ShapeDbError::WriteFailed`].
    pub fn write_failed(detail: impl Into<String>) -> Self {
        Self::WriteFailed {
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`ShapeDbError::QueryAborted`].
    pub fn aborted(detail: impl Into<String>) -> Self {
        Self::QueryAborted {
            detail: detail.into(),
        }
    }

    /// Shorthand for a [`ShapeDbError::InvalidState`].
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::InvalidState {
            detail: detail.into(),
        }
    }
}
