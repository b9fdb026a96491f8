//! Chain provider adapters.
//!
//! The tracker only needs three things from a chain: a receipt lookup, the
//! current block number, and a stream of new block numbers. Dropping the
//! stream ends the subscription.

pub mod ethers_ws;
pub mod mock;

pub use ethers_ws::EthersProvider;
pub use mock::MockProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::error::ProviderResult;

/// New block numbers, in the order the node announces them.
pub type BlockStream = BoxStream<'static, u64>;

/// The parts of a transaction receipt the tracker cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub transaction_hash: String,
    /// Block the transaction was mined in.
    pub block_number: Option<u64>,
    /// `false` when execution reverted.
    pub success: bool,
}

#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// `Ok(None)` means not mined yet.
    async fn transaction_receipt(&self, hash: &str) -> ProviderResult<Option<Receipt>>;

    async fn block_number(&self) -> ProviderResult<u64>;

    /// Subscribe to new blocks.
    async fn subscribe_blocks(&self) -> ProviderResult<BlockStream>;

    /// Label used in log lines.
    fn name(&self) -> &str;
}
