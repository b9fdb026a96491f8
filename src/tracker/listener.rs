//! The block listener task.
//!
//! Reads the provider's block stream and spawns one confirmation pass per
//! block, so a slow receipt lookup never holds back the next notification.
//! A timer releases entries past their ceiling when blocks stop arriving.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::Shared;
use crate::provider::{BlockStream, ChainProvider};

pub(super) async fn run(
    shared: Arc<Shared>,
    provider: Arc<dyn ChainProvider>,
    mut blocks: BlockStream,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut expiry = tokio::time::interval(shared.config.timeout_check_interval());
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick would fire immediately; start_listening already ran a pass.
    expiry.reset();

    let mut passes = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::debug!("[TRACKER] listener shutting down");
                break;
            }

            next = blocks.next() => match next {
                Some(block) => {
                    log::debug!("[TRACKER] new block #{}", block);
                    shared.registry.set_current_block_number(block);

                    let shared = Arc::clone(&shared);
                    let provider = Arc::clone(&provider);
                    passes.spawn(async move { shared.run_pass(provider, block).await });
                }
                None => {
                    log::warn!("[TRACKER] block stream from {} ended", provider.name());
                    break;
                }
            },

            _ = expiry.tick() => {
                let shared = Arc::clone(&shared);
                let provider = Arc::clone(&provider);
                passes.spawn(async move { shared.expire_overdue(provider).await });
            }

            Some(finished) = passes.join_next(), if !passes.is_empty() => {
                if let Err(e) = finished {
                    log::error!("[TRACKER] confirmation pass aborted: {}", e);
                }
            }
        }
    }

    shared.listening.store(false, Ordering::SeqCst);
    // In-flight passes finish on their own; every transition they make is
    // still gated on the entry being pending.
    passes.detach_all();
    drop(blocks);
    log::info!("[TRACKER] block subscription on {} closed", provider.name());
}
