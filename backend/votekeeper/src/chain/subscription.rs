//! Polling log subscription.
//!
//! HTTP JSON-RPC nodes do not push logs, so a background task scans block
//! ranges of at most `batch_blocks` and forwards decoded logs in order.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied while the node is unreachable, up to
//!   [`MAX_BACKOFF_SECS`] seconds.
//! * A range is only marked as scanned once its logs were fetched, so no block
//!   is skipped after an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ContractFailure, VotingContract};
use crate::events::LoggedEvent;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const CHANNEL_CAPACITY: usize = 256;

/// Stream of decoded voting-contract logs. Dropping it stops the poller.
pub struct LogSubscription {
    rx: mpsc::Receiver<LoggedEvent>,
    cancel: CancellationToken,
}

impl LogSubscription {
    pub(crate) fn spawn(
        contract: Arc<dyn VotingContract>,
        from_block: u64,
        poll_interval: Duration,
        batch_blocks: u64,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(poll_logs(
            contract,
            from_block,
            poll_interval,
            batch_blocks.max(1),
            tx,
            cancel.clone(),
        ));
        Self { rx, cancel }
    }

    /// Next log, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<LoggedEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_logs(
    contract: Arc<dyn VotingContract>,
    mut next_block: u64,
    poll_interval: Duration,
    batch_blocks: u64,
    tx: mpsc::Sender<LoggedEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF_SECS;

    loop {
        let wait = match scan_range(contract.as_ref(), next_block, batch_blocks).await {
            Ok(Scan {
                logs,
                next,
                caught_up,
            }) => {
                backoff = INITIAL_BACKOFF_SECS;
                if !logs.is_empty() {
                    debug!("forwarding {} logs from blocks {next_block}..{next}", logs.len());
                }
                for log in logs {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(log) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                next_block = next;
                if caught_up {
                    poll_interval
                } else {
                    Duration::ZERO
                }
            }
            Err(e) => {
                warn!("log poll failed (will retry in {backoff}s): {e}");
                let wait = Duration::from_secs(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                wait
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

struct Scan {
    logs: Vec<LoggedEvent>,
    /// First block not yet scanned.
    next: u64,
    caught_up: bool,
}

async fn scan_range(
    contract: &dyn VotingContract,
    from_block: u64,
    batch_blocks: u64,
) -> Result<Scan, ContractFailure> {
    let latest = contract.latest_block().await?;
    if latest < from_block {
        return Ok(Scan {
            logs: Vec::new(),
            next: from_block,
            caught_up: true,
        });
    }
    let to_block = latest.min(from_block.saturating_add(batch_blocks - 1));
    let logs = contract.logs(from_block, to_block).await?;
    Ok(Scan {
        logs,
        next: to_block + 1,
        caught_up: to_block == latest,
    })
}
