//! Ethereum JSON-RPC adapter over a WebSocket connection.
//!
//! Block notifications come from `eth_subscribe("newHeads")`. The ethers
//! subscription stream borrows its provider, so a small forwarding task owns
//! the subscription and feeds block numbers into a channel; the tracker gets
//! the receiving half. When the tracker drops its stream the forwarder sees
//! the closed channel, unsubscribes and exits.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::H256;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use super::{BlockStream, ChainProvider, Receipt};
use crate::error::{ProviderError, ProviderResult};

pub struct EthersProvider {
    provider: Arc<Provider<Ws>>,
    url: String,
}

impl EthersProvider {
    /// Open a WebSocket connection to `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> ProviderResult<Self> {
        log::info!("[PROVIDER] Connecting to {} ...", url);
        let provider = Provider::<Ws>::connect(url)
            .await
            .map_err(|e| ProviderError::Disconnected(format!("{url}: {e}")))?;
        log::info!("[PROVIDER] Connected to {}", url);

        Ok(Self {
            provider: Arc::new(provider),
            url: url.to_string(),
        })
    }
}

fn parse_hash(hash: &str) -> ProviderResult<H256> {
    hash.parse::<H256>()
        .map_err(|_| ProviderError::InvalidHash(hash.to_string()))
}

fn rpc_error(e: ethers::providers::ProviderError) -> ProviderError {
    ProviderError::Rpc(e.to_string())
}

#[async_trait]
impl ChainProvider for EthersProvider {
    async fn transaction_receipt(&self, hash: &str) -> ProviderResult<Option<Receipt>> {
        let tx_hash = parse_hash(hash)?;
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_error)?;

        log::trace!("[PROVIDER] receipt for {}: {:?}", hash, receipt.as_ref().map(|r| r.status));

        Ok(receipt.map(|r| Receipt {
            transaction_hash: format!("{:?}", r.transaction_hash),
            block_number: r.block_number.map(|n| n.as_u64()),
            // Receipts without a status field predate EIP-658 and carry no
            // revert information.
            success: r.status.map_or(true, |s| s.as_u64() == 1),
        }))
    }

    async fn block_number(&self) -> ProviderResult<u64> {
        let number = self.provider.get_block_number().await.map_err(rpc_error)?;
        Ok(number.as_u64())
    }

    async fn subscribe_blocks(&self) -> ProviderResult<BlockStream> {
        let provider = Arc::clone(&self.provider);
        let url = self.url.clone();
        let (tx, rx) = mpsc::unbounded_channel::<u64>();
        let (ready_tx, ready_rx) = oneshot::channel::<ProviderResult<()>>();

        tokio::spawn(async move {
            let mut heads = match provider.subscribe_blocks().await {
                Ok(heads) => {
                    let _ = ready_tx.send(Ok(()));
                    heads
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(rpc_error(e)));
                    return;
                }
            };
            log::debug!("[PROVIDER] newHeads subscription open on {}", url);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    head = heads.next() => match head {
                        Some(block) => {
                            let Some(number) = block.number else {
                                log::trace!("[PROVIDER] head without number, skipping");
                                continue;
                            };
                            if tx.send(number.as_u64()).is_err() {
                                break;
                            }
                        }
                        None => {
                            log::warn!("[PROVIDER] newHeads stream from {} ended", url);
                            break;
                        }
                    },
                }
            }

            match heads.unsubscribe().await {
                Ok(_) => log::debug!("[PROVIDER] newHeads subscription closed on {}", url),
                Err(e) => log::warn!("[PROVIDER] unsubscribe on {} failed: {}", url, e),
            }
        });

        ready_rx
            .await
            .map_err(|_| ProviderError::Disconnected("subscription task exited".into()))??;

        let blocks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|number| (number, rx))
        });
        Ok(blocks.boxed())
    }

    fn name(&self) -> &str {
        &self.url
    }
}
