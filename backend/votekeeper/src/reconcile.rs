//! Chain/ledger reconciliation.
//!
//! Displayed tallies merge three sources in strict precedence: the chain
//! count when it could be read, else the ledger count, else whatever was
//! shown before. Every entry carries the [`TallySource`] it came from so an
//! optimistic or ledger-backed number is never mistaken for a confirmed one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::chain::ChainGateway;
use crate::errors::ReconciliationError;
use crate::events::{NewVote, VoteRecord};
use crate::ledger::Ledger;
use crate::types::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TallySource {
    Chain,
    Ledger,
    Optimistic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyEntry {
    pub candidate_id: u64,
    pub name: String,
    pub votes: u64,
    pub source: TallySource,
}

/// Displayed tally of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub entries: Vec<TallyEntry>,
    pub total_votes: u64,
    pub total_source: TallySource,
}

impl Default for Tally {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            total_votes: 0,
            total_source: TallySource::Chain,
        }
    }
}

/// Bounded backoff used after a reveal while waiting for the chain to
/// reflect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRow {
    pub candidate_id: u64,
    pub name: String,
    pub chain_votes: Option<u64>,
    pub ledger_votes: Option<u64>,
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub event_id: u64,
    pub chain_readable: bool,
    pub ledger_readable: bool,
    pub synced: bool,
    pub rows: Vec<SyncRow>,
}

pub struct Reconciler {
    gateway: Arc<ChainGateway>,
    ledger: Arc<dyn Ledger>,
}

impl Reconciler {
    pub fn new(gateway: Arc<ChainGateway>, ledger: Arc<dyn Ledger>) -> Self {
        Self { gateway, ledger }
    }

    /// Mirror a confirmed vote into the ledger.
    pub async fn record_vote_attempt(
        &self,
        voter_id: &str,
        event_id: u64,
        candidate_id: u64,
        block_address: &str,
    ) -> Result<VoteRecord, ReconciliationError> {
        let vote = NewVote {
            voter_id: voter_id.to_string(),
            event_id,
            candidate_id,
            block_address: block_address.to_string(),
        };
        let record = self.ledger.record_vote(&vote).await?;
        info!("ledger recorded vote for event {event_id} by {voter_id}");
        Ok(record)
    }

    /// Merge chain and ledger counts over `current`. Performs one chain read;
    /// the ledger is only consulted when some candidate is missing from it.
    pub async fn reconcile_tally(&self, event_id: u64, current: &[TallyEntry]) -> Vec<TallyEntry> {
        let chain = match self.gateway.try_fetch_candidates(event_id).await {
            Ok(candidates) => Some(candidates),
            Err(e) => {
                warn!("chain tally for event {event_id} unavailable: {e}");
                None
            }
        };

        let needs_ledger = match &chain {
            Some(candidates) => current
                .iter()
                .any(|entry| !candidates.iter().any(|c| c.id == entry.candidate_id)),
            None => true,
        };
        let ledger = if needs_ledger {
            match self.ledger.tally(event_id).await {
                Ok(counts) => Some(counts),
                Err(e) => {
                    warn!("ledger tally for event {event_id} unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        merge_tally(current, chain.as_deref(), ledger.as_ref())
    }

    /// [`Reconciler::reconcile_tally`] plus the event-wide total.
    pub async fn reconcile(&self, event_id: u64, current: &Tally) -> Tally {
        let entries = self.reconcile_tally(event_id, &current.entries).await;
        match self.gateway.try_fetch_event(event_id).await {
            Ok(event) => Tally {
                entries,
                total_votes: event.total_votes,
                total_source: TallySource::Chain,
            },
            Err(_) if entries.is_empty() => current.clone(),
            Err(_) => {
                let total_votes = entries.iter().map(|e| e.votes).sum();
                let total_source = weakest_source(&entries);
                Tally {
                    entries,
                    total_votes,
                    total_source,
                }
            }
        }
    }

    /// Poll the chain until `candidate_id` shows at least `expected` votes.
    pub async fn await_chain_tally(
        &self,
        event_id: u64,
        candidate_id: u64,
        expected: u64,
        policy: RefreshPolicy,
    ) -> Option<Vec<Candidate>> {
        let mut delay = policy.initial_delay;
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(delay).await;
            match self.gateway.try_fetch_candidates(event_id).await {
                Ok(candidates) => {
                    let seen = candidates
                        .iter()
                        .find(|c| c.id == candidate_id)
                        .map_or(0, |c| c.vote_count);
                    if seen >= expected {
                        return Some(candidates);
                    }
                }
                Err(e) => warn!("tally refresh attempt {attempt} failed: {e}"),
            }
            delay *= 2;
        }
        warn!(
            "chain tally for event {event_id} did not reach {expected} votes for candidate {candidate_id} after {} attempts",
            policy.max_attempts
        );
        None
    }

    /// Side-by-side chain and ledger counts.
    pub async fn sync_report(&self, event_id: u64) -> SyncReport {
        let chain = self.gateway.try_fetch_candidates(event_id).await.ok();
        let ledger = self.ledger.tally(event_id).await.ok();

        let mut rows: Vec<SyncRow> = Vec::new();
        if let Some(candidates) = &chain {
            for c in candidates {
                rows.push(SyncRow {
                    candidate_id: c.id,
                    name: c.name.clone(),
                    chain_votes: Some(c.vote_count),
                    ledger_votes: None,
                    synced: false,
                });
            }
        }
        if let Some(counts) = &ledger {
            for (&candidate_id, &votes) in counts {
                match rows.iter_mut().find(|r| r.candidate_id == candidate_id) {
                    Some(row) => row.ledger_votes = Some(votes),
                    None => rows.push(SyncRow {
                        candidate_id,
                        name: String::new(),
                        chain_votes: None,
                        ledger_votes: Some(votes),
                        synced: false,
                    }),
                }
            }
        }
        for row in &mut rows {
            if ledger.is_some() && row.ledger_votes.is_none() {
                row.ledger_votes = Some(0);
            }
            row.synced = row.chain_votes.is_some() && row.chain_votes == row.ledger_votes;
        }
        rows.sort_by_key(|r| r.candidate_id);

        let synced = chain.is_some() && ledger.is_some() && rows.iter().all(|r| r.synced);
        SyncReport {
            event_id,
            chain_readable: chain.is_some(),
            ledger_readable: ledger.is_some(),
            synced,
            rows,
        }
    }
}

/// Per candidate: chain count if present, else the ledger count (zero when a
/// readable ledger has none), else the previous value. Chain candidates
/// missing from `current` are appended; so are ledger-only candidates when
/// the chain could not be read.
pub fn merge_tally(
    current: &[TallyEntry],
    chain: Option<&[Candidate]>,
    ledger: Option<&HashMap<u64, u64>>,
) -> Vec<TallyEntry> {
    let mut merged: Vec<TallyEntry> = current
        .iter()
        .map(|entry| {
            let on_chain = chain.and_then(|cs| cs.iter().find(|c| c.id == entry.candidate_id));
            if let Some(c) = on_chain {
                return TallyEntry {
                    candidate_id: c.id,
                    name: c.name.clone(),
                    votes: c.vote_count,
                    source: TallySource::Chain,
                };
            }
            match ledger {
                Some(counts) => TallyEntry {
                    votes: counts.get(&entry.candidate_id).copied().unwrap_or(0),
                    source: TallySource::Ledger,
                    ..entry.clone()
                },
                None => entry.clone(),
            }
        })
        .collect();

    match (chain, ledger) {
        (Some(candidates), _) => {
            for c in candidates {
                if !merged.iter().any(|e| e.candidate_id == c.id) {
                    merged.push(TallyEntry {
                        candidate_id: c.id,
                        name: c.name.clone(),
                        votes: c.vote_count,
                        source: TallySource::Chain,
                    });
                }
            }
        }
        (None, Some(counts)) => {
            let mut extra: Vec<(u64, u64)> = counts
                .iter()
                .filter(|(id, _)| !merged.iter().any(|e| e.candidate_id == **id))
                .map(|(&id, &votes)| (id, votes))
                .collect();
            extra.sort_unstable();
            merged.extend(extra.into_iter().map(|(candidate_id, votes)| TallyEntry {
                candidate_id,
                name: String::new(),
                votes,
                source: TallySource::Ledger,
            }));
        }
        (None, None) => {}
    }
    merged
}

/// Weakest source among `entries`: optimistic, then ledger, then chain.
fn weakest_source(entries: &[TallyEntry]) -> TallySource {
    if entries.iter().any(|e| e.source == TallySource::Optimistic) {
        TallySource::Optimistic
    } else if entries.iter().any(|e| e.source == TallySource::Ledger) {
        TallySource::Ledger
    } else {
        TallySource::Chain
    }
}
