//! Error types for the provider adapters and the confirmation tracker.

use thiserror::Error;

/// Failure reported by a chain provider adapter.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The connection to the node is gone or could not be established.
    #[error("provider disconnected: {0}")]
    Disconnected(String),

    /// The node answered with an error, or the answer could not be decoded.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The transaction hash could not be turned into a chain hash.
    #[error("invalid transaction hash '{0}'")]
    InvalidHash(String),
}

/// Errors surfaced by [`ConfirmationTracker`](crate::tracker::ConfirmationTracker).
#[derive(Debug, Error)]
pub enum TrackerError {
    /// No chain provider is attached, or it refused the block subscription.
    #[error("chain provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A single receipt or block-number fetch failed.
    #[error("failed to fetch chain data for {hash}: {source}")]
    TransientFetch {
        hash: String,
        #[source]
        source: ProviderError,
    },

    /// Tearing down the block listener failed.
    #[error("block listener teardown failed: {0}")]
    ListenerTeardown(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Alias for `std::result::Result<T, TrackerError>`.
pub type Result<T> = std::result::Result<T, TrackerError>;
