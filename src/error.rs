//! Error types for the arena and its wrapper.
//!
//! One enum per concern, `thiserror` throughout. Substrate-level failures
//! ([`SubstrateError`](crate::substrate::SubstrateError)) are carried as the
//! *source* of [`AllocError::OutOfMemory`] rather than surfaced as a distinct
//! public kind: from the caller's point of view there is exactly one hard
//! allocation failure, and the chain explains why.

use thiserror::Error;

use crate::substrate::SubstrateError;

/// Errors surfaced by the allocator's public API.
#[derive(Error, Debug)]
pub enum AllocError {
    /// Growth (including the one reclamation-assisted retry) could not
    /// satisfy the request.
    #[error(
        "out of device memory: could not grow by {requested} bytes \
         ({reserved} bytes already reserved)"
    )]
    OutOfMemory {
        /// Aligned size of the request that failed.
        requested: usize,
        /// Bytes reserved from the substrate at the time of failure.
        reserved: usize,
        /// The substrate failure that caused this, when there was one.
        #[source]
        source: Option<SubstrateError>,
    },

    /// The arena was constructed with an unusable configuration.
    #[error("invalid arena configuration: {0}")]
    InvalidConfig(String),

    /// A previous caller panicked while holding the arena lock.
    ///
    /// The arena state may be mid-mutation; refusing further calls is the
    /// only safe answer.
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for AllocError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AllocError::LockPoisoned(err.to_string())
    }
}

/// Result alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;
