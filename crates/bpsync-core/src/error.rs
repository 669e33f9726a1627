//! Core error types.
//!
//! Only conditions that abort a whole invocation live here. Failures of
//! individual resource operations are classified into
//! [`ImportError`](crate::sync::ImportError)s and collected instead.

use crate::api::ApiError;
use crate::resource::ResourceKind;
use thiserror::Error;

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The baseline state of the target could not be fetched.
    #[error("failed to fetch current {kind} state: {source}")]
    CurrentState {
        /// Kind being listed.
        kind: ResourceKind,
        /// Underlying collaborator failure.
        #[source]
        source: ApiError,
    },

    /// A migration source could not be collected.
    #[error("failed to collect {kind} from source: {source}")]
    Collect {
        /// Kind being listed.
        kind: ResourceKind,
        /// Underlying collaborator failure.
        #[source]
        source: ApiError,
    },

    /// The run was cancelled before the baseline fetch completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for engine entry points.
pub type Result<T> = std::result::Result<T, Error>;
