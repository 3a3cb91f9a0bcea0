//! Long-running background task that follows the voting contract's logs and
//! mirrors them into the database.
//!
//! Every decoded log lands in `chain_events`. `VoteRevealed` logs are also
//! written to the vote ledger, so votes cast from other clients show up in
//! ledger tallies too. Inserts are idempotent and the block cursor is stored
//! after each log, so a restart replays at most one block.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::chain::ChainGateway;
use crate::config::Config;
use crate::db;
use crate::events::{ContractEvent, LoggedEvent, NewVote};
use crate::types::{address_hex, tx_hash_hex};

pub struct IndexerState {
    pub pool: SqlitePool,
    pub gateway: Arc<ChainGateway>,
    pub config: Config,
}

/// Spawn the indexer loop as a background [`tokio`] task.
pub async fn run(state: Arc<IndexerState>) {
    let contract = state
        .config
        .voting_system_address
        .map(|a| address_hex(&a))
        .unwrap_or_else(|| "dev chain".to_string());
    info!("Indexer starting, voting contract: {contract}");

    // Load the cursor from the DB; fall back to config start_block.
    let last_block = db::get_last_block(&state.pool).await.unwrap_or(0);
    let from_block = if last_block > 0 {
        last_block as u64
    } else {
        state.config.start_block
    };
    info!("Resuming from block {from_block}");

    let mut subscription = state.gateway.subscribe(
        from_block,
        Duration::from_secs(state.config.log_poll_secs),
        state.config.log_batch_blocks,
    );
    while let Some(logged) = subscription.next().await {
        if let Err(e) = store(&state.pool, &logged).await {
            error!("Indexer store error: {e}");
        }
    }
    warn!("Log subscription closed; indexer stopped");
}

/// Persist one log and advance the cursor to its block.
pub async fn store(pool: &SqlitePool, logged: &LoggedEvent) -> crate::errors::Result<()> {
    let inserted = db::insert_chain_events(pool, &[logged.to_row()]).await?;
    if inserted == 0 {
        debug!(
            "{} in block {} already stored",
            logged.event.kind().as_str(),
            logged.block_number
        );
    }

    if let ContractEvent::VoteRevealed {
        event_id,
        voter,
        candidate_id,
    } = &logged.event
    {
        let vote = NewVote {
            voter_id: address_hex(voter),
            event_id: *event_id,
            candidate_id: *candidate_id,
            block_address: tx_hash_hex(&logged.tx_hash),
        };
        if db::insert_vote_if_absent(pool, &vote).await? {
            info!(
                "Mirrored reveal by {} for event {event_id} into the ledger",
                vote.voter_id
            );
        }
    }

    db::save_cursor(pool, logged.block_number as i64).await?;
    Ok(())
}
