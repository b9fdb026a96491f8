//! Tracks submitted transactions until they reach a target confirmation
//! depth or fail.
//!
//! A [`TransactionRegistry`] holds what is being tracked; a
//! [`ConfirmationTracker`] keeps one block subscription open on a
//! [`ChainProvider`] and settles registry entries as blocks arrive.

pub mod config;
pub mod error;
pub mod provider;
pub mod registry;
pub mod tracker;

pub use config::TrackerConfig;
pub use error::{ProviderError, TrackerError};
pub use provider::{BlockStream, ChainProvider, EthersProvider, MockProvider, Receipt};
pub use registry::{
    ConfirmedCallback, FailedCallback, FailureReason, RegistryEvent, TransactionRegistry,
    TransactionSnapshot, TxStatus,
};
pub use tracker::{ConfirmationTracker, ManualCheck};
