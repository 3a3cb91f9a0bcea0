//! Database layer: migrations, queries and cursor management.

use std::collections::HashMap;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{ReconciliationError, Result};
use crate::events::{ChainEventRecord, NewChainEvent, NewVote, VoteRecord};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Single-connection in-memory database with migrations applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

/// Read the last block the indexer stored logs from.
/// Returns `0` when no cursor has been persisted yet.
pub async fn get_last_block(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_block FROM indexer_cursor WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

pub async fn save_cursor(pool: &SqlitePool, last_block: i64) -> Result<()> {
    sqlx::query("UPDATE indexer_cursor SET last_block = ?1 WHERE id = 1")
        .bind(last_block)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Chain log mirror
// ─────────────────────────────────────────────────────────

/// Persist a batch of decoded logs. Logs already stored for the same
/// transaction are silently ignored so replaying a block range is harmless.
pub async fn insert_chain_events(pool: &SqlitePool, events: &[NewChainEvent]) -> Result<usize> {
    let mut count = 0usize;
    for ev in events {
        let rows_affected = sqlx::query(
            r#"
            INSERT OR IGNORE INTO chain_events
                (kind, event_id, actor, candidate_id, detail, block_number, tx_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&ev.kind)
        .bind(ev.event_id)
        .bind(&ev.actor)
        .bind(ev.candidate_id)
        .bind(&ev.detail)
        .bind(ev.block_number)
        .bind(&ev.tx_hash)
        .execute(pool)
        .await?
        .rows_affected();

        count += rows_affected as usize;
    }
    Ok(count)
}

/// Logs for one voting event, oldest first.
pub async fn get_chain_events_for_event(
    pool: &SqlitePool,
    event_id: u64,
) -> Result<Vec<ChainEventRecord>> {
    let rows = sqlx::query_as::<_, ChainEventRecord>(
        r#"
        SELECT id, kind, event_id, actor, candidate_id, detail, block_number,
               tx_hash, created_at
        FROM   chain_events
        WHERE  event_id = ?1
        ORDER  BY block_number ASC, id ASC
        "#,
    )
    .bind(event_id as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_all_chain_events(pool: &SqlitePool) -> Result<Vec<ChainEventRecord>> {
    let rows = sqlx::query_as::<_, ChainEventRecord>(
        r#"
        SELECT id, kind, event_id, actor, candidate_id, detail, block_number,
               tx_hash, created_at
        FROM   chain_events
        ORDER  BY block_number ASC, id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Vote ledger
// ─────────────────────────────────────────────────────────

/// Insert a vote; a second vote by the same voter in the same event is
/// reported as [`ReconciliationError::Duplicate`].
pub async fn insert_vote(
    pool: &SqlitePool,
    vote: &NewVote,
) -> std::result::Result<VoteRecord, ReconciliationError> {
    let result = sqlx::query_as::<_, VoteRecord>(
        r#"
        INSERT INTO votes (voter_id, event_id, candidate_id, block_address)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id, voter_id, event_id, candidate_id, block_address, created_at
        "#,
    )
    .bind(&vote.voter_id)
    .bind(vote.event_id as i64)
    .bind(vote.candidate_id as i64)
    .bind(&vote.block_address)
    .fetch_one(pool)
    .await;

    match result {
        Ok(record) => Ok(record),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(ReconciliationError::Duplicate {
                voter_id: vote.voter_id.clone(),
                event_id: vote.event_id,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Insert a vote unless the voter already has one for the event.
/// Returns whether a row was written.
pub async fn insert_vote_if_absent(pool: &SqlitePool, vote: &NewVote) -> Result<bool> {
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO votes (voter_id, event_id, candidate_id, block_address)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(&vote.voter_id)
    .bind(vote.event_id as i64)
    .bind(vote.candidate_id as i64)
    .bind(&vote.block_address)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected > 0)
}

pub async fn get_votes_for_event(pool: &SqlitePool, event_id: u64) -> Result<Vec<VoteRecord>> {
    let rows = sqlx::query_as::<_, VoteRecord>(
        r#"
        SELECT id, voter_id, event_id, candidate_id, block_address, created_at
        FROM   votes
        WHERE  event_id = ?1
        ORDER  BY created_at ASC, id ASC
        "#,
    )
    .bind(event_id as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per-candidate vote counts for one event.
pub async fn vote_counts(
    pool: &SqlitePool,
    event_id: u64,
) -> std::result::Result<HashMap<u64, u64>, sqlx::Error> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT candidate_id, COUNT(*)
        FROM   votes
        WHERE  event_id = ?1
        GROUP  BY candidate_id
        "#,
    )
    .bind(event_id as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(candidate, count)| (candidate as u64, count as u64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(voter: &str, event_id: u64, candidate_id: u64) -> NewVote {
        NewVote {
            voter_id: voter.to_string(),
            event_id,
            candidate_id,
            block_address: format!("0x{voter}{event_id}"),
        }
    }

    #[tokio::test]
    async fn cursor_starts_at_zero_and_persists() {
        let pool = memory_pool().await;
        assert_eq!(get_last_block(&pool).await.unwrap(), 0);
        save_cursor(&pool, 42).await.unwrap();
        assert_eq!(get_last_block(&pool).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn one_vote_per_voter_per_event() {
        let pool = memory_pool().await;
        let record = insert_vote(&pool, &vote("alice", 1, 2)).await.unwrap();
        assert_eq!(record.voter_id, "alice");
        assert_eq!(record.candidate_id, 2);

        let err = insert_vote(&pool, &vote("alice", 1, 3)).await.unwrap_err();
        assert!(matches!(err, ReconciliationError::Duplicate { event_id: 1, .. }));

        // Same voter, other event is fine.
        insert_vote(&pool, &vote("alice", 2, 3)).await.unwrap();
        assert!(!insert_vote_if_absent(&pool, &vote("alice", 2, 1)).await.unwrap());
        assert!(insert_vote_if_absent(&pool, &vote("bob", 2, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn counts_group_by_candidate() {
        let pool = memory_pool().await;
        for (voter, candidate) in [("a", 1), ("b", 1), ("c", 2)] {
            insert_vote(&pool, &vote(voter, 5, candidate)).await.unwrap();
        }
        insert_vote(&pool, &vote("d", 6, 1)).await.unwrap();

        let counts = vote_counts(&pool, 5).await.unwrap();
        assert_eq!(counts.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&1));
        assert_eq!(get_votes_for_event(&pool, 5).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn chain_event_replay_is_ignored() {
        let pool = memory_pool().await;
        let row = NewChainEvent {
            kind: "event_created".into(),
            event_id: 1,
            actor: Some("0xabc".into()),
            candidate_id: None,
            detail: Some("Council".into()),
            block_number: 3,
            tx_hash: "0x01".into(),
        };
        assert_eq!(insert_chain_events(&pool, &[row.clone()]).await.unwrap(), 1);
        assert_eq!(insert_chain_events(&pool, &[row]).await.unwrap(), 0);
        assert_eq!(get_chain_events_for_event(&pool, 1).await.unwrap().len(), 1);
        assert!(get_chain_events_for_event(&pool, 2).await.unwrap().is_empty());
    }
}
