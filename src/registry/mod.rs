//! Transaction registry.
//!
//! Process-wide map from transaction hash to tracking record. The registry
//! owns no network resources or timers: the [`ConfirmationTracker`] is its
//! only writer for status and confirmations, and also settles entries by
//! hand through [`ConfirmationTracker::set_status`]. Callers add and remove
//! entries and otherwise only read snapshots or listen to [`RegistryEvent`]s.
//!
//! # Invariants
//! * At most one entry per hash. Re-adding a hash overwrites it.
//! * `Pending` is the only non-terminal status. Once an entry is `Confirmed`
//!   or `Failed` its status and confirmation count never change again.
//! * Each callback is stored as an `Option` and taken at the terminal
//!   transition, so it runs at most once.
//!
//! Every read and mutation happens under one `Mutex` guard; callbacks and
//! event publication run after the guard is dropped.
//!
//! [`ConfirmationTracker`]: crate::tracker::ConfirmationTracker
//! [`ConfirmationTracker::set_status`]: crate::tracker::ConfirmationTracker::set_status

mod types;


pub use types::{
    progress_percent, ConfirmedCallback, FailedCallback, FailureReason, RegistryEvent,
    TransactionSnapshot, TxStatus,
};
pub(crate) use types::Settlement;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::time::Instant;

use types::TrackedTransaction;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct TransactionRegistry {
    entries: Mutex<HashMap<String, TrackedTransaction>>,
    current_block: AtomicU64,
    next_generation: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            current_block: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
            events,
        }
    }

    /// Start tracking `hash`, replacing any existing entry for it.
    ///
    /// The entry starts `Pending` with zero confirmations. A target of `0` is
    /// raised to `1`. Returns the generation of the new entry.
    pub fn add_transaction(
        &self,
        hash: impl Into<String>,
        target_confirmations: u64,
        on_confirmed: Option<ConfirmedCallback>,
        on_failed: Option<FailedCallback>,
    ) -> u64 {
        let hash = hash.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let target = target_confirmations.max(1);

        let replaced = self.lock().insert(
            hash.clone(),
            TrackedTransaction {
                hash: hash.clone(),
                status: TxStatus::Pending,
                confirmations: 0,
                target_confirmations: target,
                failure: None,
                added_at: Instant::now(),
                generation,
                on_confirmed,
                on_failed,
            },
        );

        if replaced.is_some() {
            log::debug!("[REGISTRY] replaced entry for {}", hash);
        }
        log::info!("[REGISTRY] tracking {} (target {} confirmations)", hash, target);
        self.publish(RegistryEvent::Added { hash });
        generation
    }

    /// Stop tracking `hash`. Returns `false` if it was not tracked.
    pub fn remove_transaction(&self, hash: &str) -> bool {
        let removed = self.lock().remove(hash).is_some();
        if removed {
            log::debug!("[REGISTRY] removed {}", hash);
            self.publish(RegistryEvent::Removed {
                hash: hash.to_string(),
            });
        }
        removed
    }

    /// Record `confirmations` for a pending entry.
    ///
    /// Ignored when the entry is absent, terminal, or already has a higher
    /// count: overlapping passes may report an older block late.
    pub fn update_confirmations(&self, hash: &str, confirmations: u64) -> bool {
        self.record_confirmations(hash, None, confirmations)
    }

    pub fn get(&self, hash: &str) -> Option<TransactionSnapshot> {
        self.lock().get(hash).map(TrackedTransaction::snapshot)
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<TransactionSnapshot> {
        let mut all: Vec<_> = self.lock().values().map(TrackedTransaction::snapshot).collect();
        all.sort_by_key(|s| s.generation);
        all
    }

    /// Pending entries, oldest first.
    pub fn pending(&self) -> Vec<TransactionSnapshot> {
        let mut pending: Vec<_> = self
            .lock()
            .values()
            .filter(|e| e.is_pending())
            .map(TrackedTransaction::snapshot)
            .collect();
        pending.sort_by_key(|s| s.generation);
        pending
    }

    pub fn status_of(&self, hash: &str) -> Option<TxStatus> {
        self.lock().get(hash).map(|e| e.status)
    }

    pub fn is_confirmed(&self, hash: &str) -> bool {
        self.status_of(hash) == Some(TxStatus::Confirmed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn current_block_number(&self) -> u64 {
        self.current_block.load(Ordering::SeqCst)
    }

    pub fn set_current_block_number(&self, block: u64) {
        self.current_block.store(block, Ordering::SeqCst);
        self.publish(RegistryEvent::NewBlock(block));
    }

    /// Receive every change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ================================
    // Tracker transitions
    // ================================

    /// Like [`update_confirmations`](Self::update_confirmations), optionally
    /// pinned to one entry generation.
    pub(crate) fn record_confirmations(
        &self,
        hash: &str,
        generation: Option<u64>,
        confirmations: u64,
    ) -> bool {
        let changed = {
            let mut entries = self.lock();
            match entries.get_mut(hash) {
                Some(entry)
                    if entry.is_pending()
                        && generation.map_or(true, |g| g == entry.generation)
                        && confirmations > entry.confirmations =>
                {
                    entry.confirmations = confirmations;
                    true
                }
                _ => false,
            }
        };

        if changed {
            log::debug!("[REGISTRY] {} now has {} confirmation(s)", hash, confirmations);
            self.publish(RegistryEvent::Updated {
                hash: hash.to_string(),
                confirmations,
            });
        }
        changed
    }

    /// `Pending -> Confirmed` for the given generation. Returns `None` when
    /// the entry is gone, replaced, or already terminal.
    pub(crate) fn settle_confirmed(
        &self,
        hash: &str,
        generation: u64,
        confirmations: u64,
    ) -> Option<Settlement<ConfirmedCallback>> {
        let settlement = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(hash)
                .filter(|e| e.is_pending() && e.generation == generation)?;
            entry.confirmations = entry.confirmations.max(confirmations);
            entry.status = TxStatus::Confirmed;
            Settlement {
                generation,
                callback: entry.on_confirmed.take(),
            }
        };

        self.publish(RegistryEvent::Confirmed {
            hash: hash.to_string(),
        });
        Some(settlement)
    }

    /// `Pending -> Failed` for the given generation.
    pub(crate) fn settle_failed(
        &self,
        hash: &str,
        generation: u64,
        reason: FailureReason,
    ) -> Option<Settlement<FailedCallback>> {
        let settlement = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(hash)
                .filter(|e| e.is_pending() && e.generation == generation)?;
            entry.status = TxStatus::Failed;
            entry.failure = Some(reason.clone());
            Settlement {
                generation,
                callback: entry.on_failed.take(),
            }
        };

        self.publish(RegistryEvent::Failed {
            hash: hash.to_string(),
            reason,
        });
        Some(settlement)
    }

    /// Grace-period cleanup: remove `hash` only if it is still the same entry.
    pub(crate) fn remove_if_generation(&self, hash: &str, generation: u64) -> bool {
        let removed = {
            let mut entries = self.lock();
            match entries.get(hash) {
                Some(entry) if entry.generation == generation => {
                    entries.remove(hash);
                    true
                }
                _ => false,
            }
        };

        if removed {
            log::debug!("[REGISTRY] purged settled entry {}", hash);
            self.publish(RegistryEvent::Removed {
                hash: hash.to_string(),
            });
        }
        removed
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedTransaction>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
