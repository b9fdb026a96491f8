use std::fmt;

use tokio::time::Instant;

use serde::{Deserialize, Serialize};

/// Fired once when a transaction reaches its target depth.
pub type ConfirmedCallback = Box<dyn FnOnce(&str) + Send>;

/// Fired once when a transaction reverts or times out.
pub type FailedCallback = Box<dyn FnOnce(&str, &FailureReason) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a tracked transaction ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Mined, but execution reverted.
    Reverted,
    /// Settled by hand through `ConfirmationTracker::set_status`.
    Manual,
    /// Still below target when the confirmation ceiling elapsed.
    TimedOut {
        confirmations: u64,
        target: u64,
        waited_secs: u64,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Reverted => f.write_str("Transaction failed on chain"),
            FailureReason::Manual => f.write_str("Transaction marked as failed"),
            FailureReason::TimedOut {
                confirmations,
                target,
                waited_secs,
            } => write!(
                f,
                "Transaction not confirmed after {waited_secs}s ({confirmations}/{target} confirmations)"
            ),
        }
    }
}

/// Progress toward the target depth, as shown by a progress bar.
pub fn progress_percent(confirmations: u64, target: u64) -> u8 {
    if target == 0 {
        return 100;
    }
    let pct = confirmations.saturating_mul(100) / target;
    pct.min(100) as u8
}

/// A registry entry. Callbacks live here and are never handed to observers.
pub(crate) struct TrackedTransaction {
    pub hash: String,
    pub status: TxStatus,
    pub confirmations: u64,
    pub target_confirmations: u64,
    pub failure: Option<FailureReason>,
    pub added_at: Instant,
    pub generation: u64,
    pub on_confirmed: Option<ConfirmedCallback>,
    pub on_failed: Option<FailedCallback>,
}

impl TrackedTransaction {
    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            hash: self.hash.clone(),
            status: self.status,
            confirmations: self.confirmations,
            target_confirmations: self.target_confirmations,
            progress_percent: progress_percent(self.confirmations, self.target_confirmations),
            failure: self.failure.clone(),
            added_at: self.added_at,
            generation: self.generation,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }
}

impl fmt::Debug for TrackedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedTransaction")
            .field("hash", &self.hash)
            .field("status", &self.status)
            .field("confirmations", &self.confirmations)
            .field("target_confirmations", &self.target_confirmations)
            .field("failure", &self.failure)
            .field("generation", &self.generation)
            .field("on_confirmed", &self.on_confirmed.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .finish()
    }
}

/// Read-only view of a tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSnapshot {
    pub hash: String,
    pub status: TxStatus,
    pub confirmations: u64,
    pub target_confirmations: u64,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip)]
    pub added_at: Instant,
    #[serde(skip)]
    pub generation: u64,
}

/// Change notification published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added { hash: String },
    Updated { hash: String, confirmations: u64 },
    Confirmed { hash: String },
    Failed { hash: String, reason: FailureReason },
    Removed { hash: String },
    NewBlock(u64),
}

/// Result of a terminal transition: the entry generation plus the callback
/// that was taken out of the entry, to be run once the lock is released.
pub(crate) struct Settlement<C> {
    pub generation: u64,
    pub callback: Option<C>,
}
