use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};

use tx_confirmation_tracker::{
    ConfirmationTracker, EthersProvider, FailureReason, RegistryEvent, TrackerConfig,
    TransactionRegistry, TransactionSnapshot,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// WebSocket endpoint of an Ethereum JSON-RPC node.
    #[arg(long, env = "TRACKER_RPC_URL", default_value = "ws://127.0.0.1:8545")]
    rpc_url: String,

    /// JSON file with tracker settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds a settled transaction stays visible.
    #[arg(long)]
    grace_secs: Option<u64>,

    /// Seconds before a pending transaction is given up on.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print snapshots as JSON lines instead of progress bars.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track transactions until every one of them is confirmed or failed.
    Watch {
        #[arg(required = true)]
        hashes: Vec<String>,

        /// Confirmations required (defaults to the configured target).
        #[arg(short = 'c', long)]
        confirmations: Option<u64>,
    },
    /// Fetch one receipt and the current block.
    Check { hash: String },
}

enum Outcome {
    Confirmed(String),
    Failed(String, FailureReason),
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    println!("[MAIN] Connecting to {}", args.rpc_url);
    let provider = EthersProvider::connect(&args.rpc_url)
        .await
        .with_context(|| format!("Failed to connect to {}", args.rpc_url))?;

    let registry = Arc::new(TransactionRegistry::new());
    let tracker = ConfirmationTracker::new(Arc::clone(&registry), config)
        .with_provider(Arc::new(provider));

    match args.command {
        Command::Watch {
            hashes,
            confirmations,
        } => run_watch(&tracker, hashes, confirmations, args.json).await,
        Command::Check { hash } => run_check(&tracker, &hash, args.json).await,
    }
}

fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(secs) = args.grace_secs {
        config = config.with_grace_period(secs);
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_confirmation_timeout(secs);
    }
    log::debug!("[CLI] config: {:?}", config);
    Ok(config)
}

async fn run_watch(
    tracker: &ConfirmationTracker,
    mut hashes: Vec<String>,
    confirmations: Option<u64>,
    json: bool,
) -> Result<()> {
    let mut seen = HashSet::new();
    hashes.retain(|h| seen.insert(h.clone()));

    let t0 = Instant::now();
    let mut events = tracker.registry().subscribe();
    let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();

    for hash in &hashes {
        let confirmed_tx = outcome_tx.clone();
        let failed_tx = outcome_tx.clone();
        tracker.track(
            hash.clone(),
            confirmations,
            Some(Box::new(move |hash: &str| {
                let _ = confirmed_tx.send(Outcome::Confirmed(hash.to_string()));
            })),
            Some(Box::new(move |hash: &str, reason: &FailureReason| {
                let _ = failed_tx.send(Outcome::Failed(hash.to_string(), reason.clone()));
            })),
        );
    }
    drop(outcome_tx);

    tracker
        .start_listening()
        .await
        .context("Failed to start the block listener")?;
    println!(
        "[WATCH] Tracking {} transaction(s) to {} confirmation(s) from block #{}",
        tracker.registry().len(),
        confirmations.unwrap_or(tracker.config().default_target_confirmations),
        tracker.current_block_number()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut remaining = hashes.len();
    let mut confirmed = Vec::new();
    let mut failed = Vec::new();

    while remaining > 0 {
        tokio::select! {
            outcome = outcomes.recv() => match outcome {
                Some(Outcome::Confirmed(hash)) => {
                    remaining -= 1;
                    confirmed.push((hash, t0.elapsed()));
                }
                Some(Outcome::Failed(hash, reason)) => {
                    remaining -= 1;
                    failed.push((hash, reason));
                }
                None => break,
            },

            event = events.recv() => match event {
                Ok(event) => render(tracker.registry(), &event, json)?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[CLI] skipped {} registry events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = &mut ctrl_c => {
                println!("[WATCH] Interrupted");
                break;
            }
        }
    }

    tracker.stop_listening().await;

    println!("-----------------------------------");
    for (hash, elapsed) in &confirmed {
        println!("confirmed  {}  after {:?}", hash, elapsed);
    }
    for (hash, reason) in &failed {
        println!("failed     {}  {}", hash, reason);
    }
    if remaining > 0 {
        println!("unsettled  {} transaction(s)", remaining);
    }
    println!("-----------------------------------");

    if !failed.is_empty() {
        bail!("{} transaction(s) failed", failed.len());
    }
    Ok(())
}

fn render(registry: &TransactionRegistry, event: &RegistryEvent, json: bool) -> Result<()> {
    let hash = match event {
        RegistryEvent::NewBlock(block) => {
            if !json {
                println!("[BLOCK] #{}", block);
            }
            return Ok(());
        }
        RegistryEvent::Removed { .. } => return Ok(()),
        RegistryEvent::Added { hash }
        | RegistryEvent::Updated { hash, .. }
        | RegistryEvent::Confirmed { hash }
        | RegistryEvent::Failed { hash, .. } => hash,
    };

    let Some(snapshot) = registry.get(hash) else {
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string(&snapshot)?);
    } else {
        println!("{}", progress_line(&snapshot));
    }
    Ok(())
}

fn progress_line(s: &TransactionSnapshot) -> String {
    let filled = usize::from(s.progress_percent) / 5;
    let mut line = format!(
        "[{:<20}] {:>3}% {} {}/{} {}",
        "#".repeat(filled),
        s.progress_percent,
        s.hash,
        s.confirmations,
        s.target_confirmations,
        s.status
    );
    if let Some(reason) = &s.failure {
        line.push_str(&format!(" ({})", reason));
    }
    line
}

async fn run_check(tracker: &ConfirmationTracker, hash: &str, json: bool) -> Result<()> {
    let check = tracker
        .check_manually(hash)
        .await
        .with_context(|| format!("Failed to check {}", hash))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&check)?);
        return Ok(());
    }

    println!("-----------------------------------");
    println!("Transaction:    {}", hash);
    println!("Current block:  {}", check.current_block);
    match &check.receipt {
        None => println!("Receipt:        not mined yet"),
        Some(receipt) => {
            println!(
                "Mined in block: {}",
                receipt
                    .block_number
                    .map(|b| b.to_string())
                    .unwrap_or("-".into())
            );
            println!(
                "Execution:      {}",
                if receipt.success { "success" } else { "reverted" }
            );
        }
    }
    if let Some(confirmations) = check.confirmations() {
        println!("Confirmations:  {}", confirmations);
    }
    println!("-----------------------------------");
    Ok(())
}
