//! Error types for the filter engine.

use crate::{chain::UpstreamError, kind::FilterId, spec::MAX_TOPICS};
use serde::Serialize;

/// JSON-RPC code for a generic server-side failure.
const DEFAULT_ERROR_CODE: i64 = -32000;
/// JSON-RPC code for invalid method parameters.
const INVALID_PARAMS_CODE: i64 = -32602;
/// JSON-RPC code for an unknown method.
const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// A log filter payload that is structurally unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFilter {
    /// `blockHash` was combined with `fromBlock` or `toBlock`.
    #[error("cannot specify both blockHash and fromBlock/toBlock, choose one or the other")]
    BlockHashWithRange,
    /// More topic slots than a log can carry.
    #[error("too many topic slots: {0} (max {MAX_TOPICS})")]
    TooManyTopics(usize),
    /// Explicit `fromBlock` is above explicit `toBlock`.
    #[error("fromBlock {from} is greater than toBlock {to}")]
    InvertedRange {
        /// Requested start block.
        from: u64,
        /// Requested end block.
        to: u64,
    },
    /// The payload could not be decoded.
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// Failure reported by a [`FilterStore`] backend.
///
/// [`FilterStore`]: crate::FilterStore
#[derive(Debug, thiserror::Error)]
#[error("filter store: {0}")]
pub struct StoreError(#[source] Box<dyn core::error::Error + Send + Sync>);

impl StoreError {
    /// Wrap a backend error.
    pub fn new(err: impl Into<Box<dyn core::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// Errors surfaced by [`FilterEngine`] operations.
///
/// Fan-out failures never appear here. They are logged by the fan-out
/// workers and do not reach the block-ingestion caller.
///
/// [`FilterEngine`]: crate::FilterEngine
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// No filter is registered under this ID.
    #[error("filter not found: {0}")]
    NotFound(FilterId),
    /// The ID is not one this engine could have issued.
    #[error("filter not found: {0}")]
    UnknownId(String),
    /// The registration payload is malformed.
    #[error("invalid filter payload: {0}")]
    InvalidFilterPayload(#[from] InvalidFilter),
    /// The requested feature is not implemented.
    #[error("not supported yet: {0}")]
    Unsupported(&'static str),
    /// A chain-state or pool query failed.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] UpstreamError),
    /// The filter store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The filter exists but is of another kind.
    #[error("filter {id} is not a {expected} filter")]
    KindMismatch {
        /// The filter ID.
        id: FilterId,
        /// The kind the operation requires.
        expected: &'static str,
    },
    /// The resolved block range is wider than allowed.
    #[error("query exceeds max block range ({max})")]
    RangeTooLarge {
        /// The configured maximum range.
        max: u64,
    },
    /// RPC parameters could not be decoded.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The RPC method is not served by the filter engine.
    #[error("method not found: {0}")]
    MethodNotFound(String),
    /// A response could not be serialized.
    #[error("failed to serialize response: {0}")]
    Serialization(serde_json::Error),
}

impl FilterError {
    /// The JSON-RPC error code for this error.
    pub const fn code(&self) -> i64 {
        match self {
            Self::InvalidFilterPayload(_) | Self::InvalidParams(_) => INVALID_PARAMS_CODE,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND_CODE,
            _ => DEFAULT_ERROR_CODE,
        }
    }

    /// True if this is a [`FilterError::NotFound`] or
    /// [`FilterError::UnknownId`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::UnknownId(_))
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl From<FilterError> for ErrorPayload {
    fn from(err: FilterError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}
