//! Off-chain vote ledger.
//!
//! The ledger mirrors votes for fast display and auditing. It is never
//! authoritative: when it disagrees with the chain, the chain wins. Both
//! backends speak the same shapes as the HTTP surface served by
//! [`crate::api`], so a daemon can use another daemon as its ledger.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::db;
use crate::errors::ReconciliationError;
use crate::events::{NewVote, VoteRecord};

pub const VOTER_ID_HEADER: &str = "x-voter-id";

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record_vote(&self, vote: &NewVote) -> Result<VoteRecord, ReconciliationError>;
    /// Vote count per candidate id.
    async fn tally(&self, event_id: u64) -> Result<HashMap<u64, u64>, ReconciliationError>;
}

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

/// Body of `POST /votes`; the voter id travels in the `x-voter-id` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteCastRequest {
    pub event_id: u64,
    pub candidate_id: u64,
    pub block_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteCastResponse {
    pub data: VoteRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateVoteCount {
    pub candidate_id: u64,
    pub vote_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventVotesResponse {
    pub event_id: u64,
    pub count: usize,
    pub summary: Vec<CandidateVoteCount>,
    pub votes: Vec<VoteRecord>,
}

#[derive(Debug, Deserialize)]
struct LedgerErrorBody {
    error: String,
}

/// Sorted per-candidate summary of a count map.
pub fn summarize(counts: &HashMap<u64, u64>) -> Vec<CandidateVoteCount> {
    let mut summary: Vec<_> = counts
        .iter()
        .map(|(&candidate_id, &vote_count)| CandidateVoteCount {
            candidate_id,
            vote_count,
        })
        .collect();
    summary.sort_by_key(|c| c.candidate_id);
    summary
}

// ─────────────────────────────────────────────────────────
// SQLite backend
// ─────────────────────────────────────────────────────────

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn record_vote(&self, vote: &NewVote) -> Result<VoteRecord, ReconciliationError> {
        db::insert_vote(&self.pool, vote).await
    }

    async fn tally(&self, event_id: u64) -> Result<HashMap<u64, u64>, ReconciliationError> {
        Ok(db::vote_counts(&self.pool, event_id).await?)
    }
}

// ─────────────────────────────────────────────────────────
// HTTP backend
// ─────────────────────────────────────────────────────────

pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn rejection(resp: reqwest::Response) -> ReconciliationError {
        let status = resp.status().as_u16();
        let message = match resp.json::<LedgerErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => "no error body".to_string(),
        };
        ReconciliationError::Rejected { status, message }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn record_vote(&self, vote: &NewVote) -> Result<VoteRecord, ReconciliationError> {
        let resp = self
            .client
            .post(format!("{}/votes", self.base_url))
            .header(VOTER_ID_HEADER, &vote.voter_id)
            .json(&VoteCastRequest {
                event_id: vote.event_id,
                candidate_id: vote.candidate_id,
                block_address: vote.block_address.clone(),
            })
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => {
                let body: VoteCastResponse = resp.json().await?;
                debug!("ledger recorded vote {}", body.data.id);
                Ok(body.data)
            }
            StatusCode::CONFLICT => Err(ReconciliationError::Duplicate {
                voter_id: vote.voter_id.clone(),
                event_id: vote.event_id,
            }),
            _ => Err(Self::rejection(resp).await),
        }
    }

    async fn tally(&self, event_id: u64) -> Result<HashMap<u64, u64>, ReconciliationError> {
        let resp = self
            .client
            .get(format!("{}/events/{event_id}/votes", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::rejection(resp).await);
        }
        let body: EventVotesResponse = resp.json().await?;
        Ok(body
            .summary
            .into_iter()
            .map(|c| (c.candidate_id, c.vote_count))
            .collect())
    }
}
