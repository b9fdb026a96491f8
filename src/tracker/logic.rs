//! Confirmation decisions.
//!
//! Pure functions: no network, no locks, no clock reads. Given what the
//! chain reported, decide what should happen to one tracked transaction.

use std::time::Duration;

use crate::provider::Receipt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No receipt yet.
    NotMined,
    /// Mined and successful, still below target.
    Pending { confirmations: u64 },
    /// Mined, successful and at or above target.
    Confirmed { confirmations: u64 },
    /// Mined, execution reverted.
    Reverted,
}

impl Verdict {
    pub fn is_terminal(self) -> bool {
        matches!(self, Verdict::Confirmed { .. } | Verdict::Reverted)
    }

    /// Confirmations known after this verdict.
    pub fn confirmations(self) -> u64 {
        match self {
            Verdict::Pending { confirmations } | Verdict::Confirmed { confirmations } => {
                confirmations
            }
            Verdict::NotMined | Verdict::Reverted => 0,
        }
    }
}

/// `max(0, current - mined + 1)`. A receipt without a block number counts as
/// mined in the current block.
pub fn confirmations_at(current_block: u64, mined_block: Option<u64>) -> u64 {
    let mined = mined_block.unwrap_or(current_block);
    if mined > current_block {
        0
    } else {
        (current_block - mined).saturating_add(1)
    }
}

pub fn evaluate(receipt: Option<&Receipt>, current_block: u64, target: u64) -> Verdict {
    let Some(receipt) = receipt else {
        return Verdict::NotMined;
    };

    if !receipt.success {
        return Verdict::Reverted;
    }

    let confirmations = confirmations_at(current_block, receipt.block_number);
    if confirmations >= target {
        Verdict::Confirmed { confirmations }
    } else {
        Verdict::Pending { confirmations }
    }
}

/// Whether an entry that has been pending for `age` is past its ceiling.
pub fn is_overdue(age: Duration, timeout: Duration) -> bool {
    age >= timeout
}
