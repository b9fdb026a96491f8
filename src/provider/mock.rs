use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{BlockStream, ChainProvider, Receipt};
use crate::error::{ProviderError, ProviderResult};

/// Pure in-memory chain for tests and offline demos.
///
/// Receipts are scripted per hash, blocks are announced with
/// [`mine_block`](Self::mine_block), and failures can be injected per hash or
/// for the whole provider.
pub struct MockProvider {
    state: Mutex<MockState>,
}

struct MockState {
    available: bool,
    current_block: u64,
    receipts: HashMap<String, Receipt>,
    failing: HashSet<String>,
    subscribers: Vec<mpsc::UnboundedSender<u64>>,
    subscribe_calls: usize,
    receipt_calls: HashMap<String, usize>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                available: true,
                current_block: 0,
                receipts: HashMap::new(),
                failing: HashSet::new(),
                subscribers: Vec::new(),
                subscribe_calls: 0,
                receipt_calls: HashMap::new(),
            }),
        }
    }

    /// A provider that refuses every call, like a missing wallet extension.
    pub fn unavailable() -> Self {
        let mock = Self::new();
        mock.set_available(false);
        mock
    }

    /// Going unavailable also ends every open block stream.
    pub fn set_available(&self, available: bool) {
        let mut s = self.lock();
        s.available = available;
        if !available {
            s.subscribers.clear();
        }
    }

    pub fn set_receipt(&self, hash: &str, block_number: u64, success: bool) {
        self.lock().receipts.insert(
            hash.to_string(),
            Receipt {
                transaction_hash: hash.to_string(),
                block_number: Some(block_number),
                success,
            },
        );
    }

    pub fn clear_receipt(&self, hash: &str) {
        self.lock().receipts.remove(hash);
    }

    /// Make receipt lookups for `hash` fail until [`recover`](Self::recover).
    pub fn fail_receipt(&self, hash: &str) {
        self.lock().failing.insert(hash.to_string());
    }

    pub fn recover(&self, hash: &str) {
        self.lock().failing.remove(hash);
    }

    /// Move the chain head without announcing it.
    pub fn set_block_number(&self, block: u64) {
        self.lock().current_block = block;
    }

    /// Move the chain head and announce it to every open subscription.
    pub fn mine_block(&self, block: u64) {
        let mut s = self.lock();
        s.current_block = block;
        s.subscribers.retain(|tx| tx.send(block).is_ok());
        log::trace!("[MOCK] mined block {} ({} listeners)", block, s.subscribers.len());
    }

    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    /// Subscriptions whose stream has not been dropped.
    pub fn active_subscriptions(&self) -> usize {
        self.lock().subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn receipt_calls(&self, hash: &str) -> usize {
        self.lock().receipt_calls.get(hash).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(s: &MockState) -> ProviderResult<()> {
        if s.available {
            Ok(())
        } else {
            Err(ProviderError::Disconnected("mock provider is offline".into()))
        }
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn transaction_receipt(&self, hash: &str) -> ProviderResult<Option<Receipt>> {
        let mut s = self.lock();
        Self::ensure_available(&s)?;
        *s.receipt_calls.entry(hash.to_string()).or_default() += 1;
        if s.failing.contains(hash) {
            return Err(ProviderError::Rpc(format!("injected failure for {hash}")));
        }
        Ok(s.receipts.get(hash).cloned())
    }

    async fn block_number(&self) -> ProviderResult<u64> {
        let s = self.lock();
        Self::ensure_available(&s)?;
        Ok(s.current_block)
    }

    async fn subscribe_blocks(&self) -> ProviderResult<BlockStream> {
        let mut s = self.lock();
        Self::ensure_available(&s)?;
        s.subscribe_calls += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        s.subscribers.push(tx);

        let blocks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|number| (number, rx))
        });
        Ok(blocks.boxed())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announces_blocks_to_subscribers() {
        let mock = MockProvider::new();
        let mut blocks = mock.subscribe_blocks().await.unwrap();

        mock.mine_block(7);
        mock.mine_block(8);

        assert_eq!(blocks.next().await, Some(7));
        assert_eq!(blocks.next().await, Some(8));
        assert_eq!(mock.block_number().await.unwrap(), 8);
        assert_eq!(mock.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn dropping_stream_ends_subscription() {
        let mock = MockProvider::new();
        let blocks = mock.subscribe_blocks().await.unwrap();
        assert_eq!(mock.active_subscriptions(), 1);

        drop(blocks);
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn offline_provider_refuses_calls() {
        let mock = MockProvider::unavailable();
        assert!(mock.subscribe_blocks().await.is_err());
        assert!(mock.block_number().await.is_err());
        assert!(mock.transaction_receipt("0xabc").await.is_err());
    }

    #[tokio::test]
    async fn scripted_receipts_and_failures() {
        let mock = MockProvider::new();
        assert_eq!(mock.transaction_receipt("0xabc").await.unwrap(), None);

        mock.set_receipt("0xabc", 100, true);
        let receipt = mock.transaction_receipt("0xabc").await.unwrap().unwrap();
        assert_eq!(receipt.block_number, Some(100));
        assert!(receipt.success);

        mock.fail_receipt("0xabc");
        assert!(mock.transaction_receipt("0xabc").await.is_err());
        mock.recover("0xabc");
        assert!(mock.transaction_receipt("0xabc").await.is_ok());
        assert_eq!(mock.receipt_calls("0xabc"), 4);
    }
}
