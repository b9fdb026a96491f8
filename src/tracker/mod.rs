//! Confirmation tracker.
//!
//! Owns at most one block subscription and uses it to move every pending
//! registry entry to a terminal state:
//!
//! 1. **Listen**: one `newHeads`-style stream per tracker, shared by all
//!    tracked transactions.
//! 2. **Pass**: on each block, check every pending entry concurrently against
//!    its receipt ([`logic::evaluate`]).
//! 3. **Settle**: run the matching callback once, then purge the entry after
//!    the grace period.
//!
//! Entries that stay pending past the configured ceiling fail with
//! [`FailureReason::TimedOut`].

pub mod logic;
mod listener;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::TrackerConfig;
use crate::error::{ProviderError, Result, TrackerError};
use crate::provider::{ChainProvider, Receipt};
use crate::registry::{
    ConfirmedCallback, FailedCallback, FailureReason, TransactionRegistry, TransactionSnapshot,
    TxStatus,
};

use logic::Verdict;

/// Outcome of [`ConfirmationTracker::check_manually`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualCheck {
    pub receipt: Option<Receipt>,
    pub current_block: u64,
}

impl ManualCheck {
    /// Depth of a successful receipt at `current_block`.
    pub fn confirmations(&self) -> Option<u64> {
        self.receipt
            .as_ref()
            .filter(|r| r.success)
            .map(|r| logic::confirmations_at(self.current_block, r.block_number))
    }
}

/// State shared between the tracker handle, the listener task and its passes.
pub(crate) struct Shared {
    registry: Arc<TransactionRegistry>,
    config: TrackerConfig,
    provider: RwLock<Option<Arc<dyn ChainProvider>>>,
    listening: AtomicBool,
}

impl Shared {
    fn provider(&self) -> Option<Arc<dyn ChainProvider>> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One sweep over every pending entry for `block`.
    async fn run_pass(&self, provider: Arc<dyn ChainProvider>, block: u64) {
        let pending = self.registry.pending();
        if pending.is_empty() {
            log::trace!("[TRACKER] block #{}: nothing pending", block);
            return;
        }

        log::debug!(
            "[TRACKER] block #{}: checking {} pending transaction(s)",
            block,
            pending.len()
        );
        join_all(
            pending
                .into_iter()
                .map(|entry| self.check_entry(provider.as_ref(), entry, block)),
        )
        .await;
    }

    /// Check only the entries that are past their ceiling. Runs on a timer so
    /// a stalled chain still releases its waiters.
    async fn expire_overdue(&self, provider: Arc<dyn ChainProvider>) {
        let timeout = self.config.confirmation_timeout();
        let overdue: Vec<_> = self
            .registry
            .pending()
            .into_iter()
            .filter(|e| logic::is_overdue(e.added_at.elapsed(), timeout))
            .collect();
        if overdue.is_empty() {
            return;
        }

        let block = match provider.block_number().await {
            Ok(block) => block,
            Err(e) => {
                log::warn!(
                    "[TRACKER] block number unavailable for timeout check ({}), using #{}",
                    e,
                    self.registry.current_block_number()
                );
                self.registry.current_block_number()
            }
        };

        log::debug!("[TRACKER] {} transaction(s) past their ceiling", overdue.len());
        join_all(
            overdue
                .into_iter()
                .map(|entry| self.check_entry(provider.as_ref(), entry, block)),
        )
        .await;
    }

    async fn check_entry(
        &self,
        provider: &dyn ChainProvider,
        entry: TransactionSnapshot,
        block: u64,
    ) {
        let overdue = logic::is_overdue(entry.added_at.elapsed(), self.config.confirmation_timeout());

        let receipt = match provider.transaction_receipt(&entry.hash).await {
            Ok(receipt) => receipt,
            Err(source) => {
                let err = TrackerError::TransientFetch {
                    hash: entry.hash.clone(),
                    source,
                };
                log::warn!("[TRACKER] {}", err);
                if overdue {
                    self.time_out(&entry, entry.confirmations);
                }
                return;
            }
        };

        let verdict = self.apply(&entry, receipt.as_ref(), block);
        if overdue && !verdict.is_terminal() {
            self.time_out(&entry, entry.confirmations.max(verdict.confirmations()));
        }
    }

    /// Push one receipt observation into the registry.
    fn apply(&self, entry: &TransactionSnapshot, receipt: Option<&Receipt>, block: u64) -> Verdict {
        let verdict = logic::evaluate(receipt, block, entry.target_confirmations);
        log::trace!("[TRACKER] {} at #{}: {:?}", entry.hash, block, verdict);

        match verdict {
            Verdict::NotMined => {}
            Verdict::Pending { confirmations } => {
                self.registry
                    .record_confirmations(&entry.hash, Some(entry.generation), confirmations);
            }
            Verdict::Confirmed { confirmations } => {
                self.registry
                    .record_confirmations(&entry.hash, Some(entry.generation), confirmations);
                self.confirm(entry, confirmations);
            }
            Verdict::Reverted => {
                self.fail(entry, FailureReason::Reverted);
            }
        }
        verdict
    }

    fn confirm(&self, entry: &TransactionSnapshot, confirmations: u64) -> bool {
        let Some(settlement) =
            self.registry
                .settle_confirmed(&entry.hash, entry.generation, confirmations)
        else {
            return false;
        };

        log::info!(
            "[TRACKER] {} confirmed ({}/{} confirmations)",
            entry.hash,
            confirmations,
            entry.target_confirmations
        );
        if let Some(on_confirmed) = settlement.callback {
            on_confirmed(&entry.hash);
        }
        self.schedule_removal(entry.hash.clone(), settlement.generation);
        true
    }

    fn fail(&self, entry: &TransactionSnapshot, reason: FailureReason) -> bool {
        let Some(settlement) = self
            .registry
            .settle_failed(&entry.hash, entry.generation, reason.clone())
        else {
            return false;
        };

        log::info!("[TRACKER] {} failed: {}", entry.hash, reason);
        if let Some(on_failed) = settlement.callback {
            on_failed(&entry.hash, &reason);
        }
        self.schedule_removal(entry.hash.clone(), settlement.generation);
        true
    }

    fn time_out(&self, entry: &TransactionSnapshot, confirmations: u64) {
        self.fail(
            entry,
            FailureReason::TimedOut {
                confirmations,
                target: entry.target_confirmations,
                waited_secs: entry.added_at.elapsed().as_secs(),
            },
        );
    }

    fn schedule_removal(&self, hash: String, generation: u64) {
        let registry = Arc::clone(&self.registry);
        let grace = self.config.grace_period();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.remove_if_generation(&hash, generation);
        });
    }
}

/// Clears the listening flag unless disarmed, so an abandoned or panicking
/// `start_listening` never leaves it set without a session.
struct ListeningGuard<'a> {
    flag: &'a AtomicBool,
    armed: bool,
}

impl<'a> ListeningGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

/// A running listener task and the handle that stops it.
struct ListenerSession {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Drives registry entries to `Confirmed` or `Failed` from new-block
/// notifications.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tx_confirmation_tracker::{ConfirmationTracker, MockProvider, TrackerConfig, TransactionRegistry};
/// # async fn demo() -> tx_confirmation_tracker::error::Result<()> {
/// let registry = Arc::new(TransactionRegistry::new());
/// let tracker = ConfirmationTracker::new(Arc::clone(&registry), TrackerConfig::default())
///     .with_provider(Arc::new(MockProvider::new()));
///
/// tracker.track("0xabc", Some(2), None, None);
/// tracker.start_listening().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConfirmationTracker {
    shared: Arc<Shared>,
    session: Mutex<Option<ListenerSession>>,
}

impl ConfirmationTracker {
    pub fn new(registry: Arc<TransactionRegistry>, config: TrackerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                config,
                provider: RwLock::new(None),
                listening: AtomicBool::new(false),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn with_provider(self, provider: Arc<dyn ChainProvider>) -> Self {
        self.attach_provider(provider);
        self
    }

    /// Used by the next `start_listening` and `check_manually`. A running
    /// listener keeps the provider it was started with.
    pub fn attach_provider(&self, provider: Arc<dyn ChainProvider>) {
        log::info!("[TRACKER] provider attached: {}", provider.name());
        *self
            .shared
            .provider
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    pub fn detach_provider(&self) -> Option<Arc<dyn ChainProvider>> {
        let previous = self
            .shared
            .provider
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(provider) = &previous {
            log::info!("[TRACKER] provider detached: {}", provider.name());
        }
        previous
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    pub fn is_listening(&self) -> bool {
        self.shared.listening.load(Ordering::SeqCst)
    }

    pub fn current_block_number(&self) -> u64 {
        self.shared.registry.current_block_number()
    }

    /// Register `hash` with the registry. `None` uses the configured default
    /// target.
    pub fn track(
        &self,
        hash: impl Into<String>,
        target_confirmations: Option<u64>,
        on_confirmed: Option<ConfirmedCallback>,
        on_failed: Option<FailedCallback>,
    ) -> u64 {
        let target =
            target_confirmations.unwrap_or(self.shared.config.default_target_confirmations);
        self.shared
            .registry
            .add_transaction(hash, target, on_confirmed, on_failed)
    }

    /// Settle a pending entry by hand.
    ///
    /// A terminal status goes through the same transition as a pass: the
    /// matching callback runs once and the entry is purged after the grace
    /// period. Returns `false` when the entry is absent, already terminal, or
    /// `status` is `Pending`.
    pub fn set_status(&self, hash: &str, status: TxStatus) -> bool {
        let Some(entry) = self.shared.registry.get(hash) else {
            return false;
        };
        if entry.status.is_terminal() || !status.is_terminal() {
            log::debug!(
                "[TRACKER] ignoring status change of {} from {} to {}",
                hash,
                entry.status,
                status
            );
            return false;
        }

        match status {
            TxStatus::Confirmed => self.shared.confirm(&entry, entry.confirmations),
            TxStatus::Failed => self.shared.fail(&entry, FailureReason::Manual),
            TxStatus::Pending => false,
        }
    }

    /// Subscribe to new blocks and start driving pending entries.
    ///
    /// Does nothing when a listener is already running. On error nothing
    /// changes: no subscription is kept and `is_listening` stays false.
    pub async fn start_listening(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        if let Some(active) = session.take() {
            if self.is_listening() && !active.task.is_finished() {
                log::debug!("[TRACKER] already listening");
                *session = Some(active);
                return Ok(());
            }
            // The previous listener lost its stream; collect it first.
            if let Err(e) = active.task.await {
                log::warn!("[TRACKER] {}", TrackerError::ListenerTeardown(e.to_string()));
            }
        }

        let provider = self.shared.provider().ok_or_else(|| {
            TrackerError::ProviderUnavailable("no chain provider attached".to_string())
        })?;

        let blocks = provider.subscribe_blocks().await.map_err(|e| {
            TrackerError::ProviderUnavailable(format!(
                "{} refused the block subscription: {e}",
                provider.name()
            ))
        })?;
        let baseline = provider.block_number().await.map_err(|e| {
            TrackerError::ProviderUnavailable(format!(
                "{} did not report a block number: {e}",
                provider.name()
            ))
        })?;

        self.shared.registry.set_current_block_number(baseline);
        let listening = ListeningGuard::raise(&self.shared.listening);
        log::info!(
            "[TRACKER] listening for blocks on {} (baseline #{})",
            provider.name(),
            baseline
        );

        // Transactions mined before we subscribed.
        self.shared.run_pass(Arc::clone(&provider), baseline).await;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listener::run(
            Arc::clone(&self.shared),
            provider,
            blocks,
            shutdown_rx,
        ));
        *session = Some(ListenerSession { shutdown, task });
        listening.disarm();
        Ok(())
    }

    /// Drop the block subscription. Pending entries stay in the registry and
    /// resume on the next `start_listening`.
    pub async fn stop_listening(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            log::debug!("[TRACKER] stop requested but not listening");
            self.shared.listening.store(false, Ordering::SeqCst);
            return;
        };

        // The listener may already be gone when its stream ended.
        let _ = active.shutdown.send(());
        if let Err(e) = active.task.await {
            log::warn!("[TRACKER] {}", TrackerError::ListenerTeardown(e.to_string()));
        }

        self.shared.listening.store(false, Ordering::SeqCst);
        log::info!("[TRACKER] stopped listening");
    }

    /// Check one hash right now, outside the block cadence.
    ///
    /// A tracked pending entry goes through the same transitions as in a
    /// pass. Unlike a pass, fetch errors are returned.
    pub async fn check_manually(&self, hash: &str) -> Result<ManualCheck> {
        let provider = self.shared.provider().ok_or_else(|| {
            TrackerError::ProviderUnavailable("no chain provider attached".to_string())
        })?;
        let fetch_error = |source: ProviderError| TrackerError::TransientFetch {
            hash: hash.to_string(),
            source,
        };

        let receipt = provider
            .transaction_receipt(hash)
            .await
            .map_err(fetch_error)?;
        let current_block = provider.block_number().await.map_err(fetch_error)?;

        match self.shared.registry.get(hash) {
            Some(entry) if entry.status == TxStatus::Pending => {
                self.shared.apply(&entry, receipt.as_ref(), current_block);
            }
            Some(entry) => {
                log::debug!("[TRACKER] manual check of {} ({}): no change", hash, entry.status);
            }
            None => log::debug!("[TRACKER] manual check of untracked {}", hash),
        }

        Ok(ManualCheck {
            receipt,
            current_block,
        })
    }
}
