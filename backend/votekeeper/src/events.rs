//! Canonical log types emitted by the voting contract, plus the database row
//! shapes the ledger stores them in.

use ethers::types::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::types::{address_hex, tx_hash_hex};

/// All recognised log kinds from the voting contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A voting event was created (`EventCreated`).
    EventCreated,
    /// A candidate was registered on an event (`CandidateAdded`).
    CandidateAdded,
    /// A voter stored a commitment (`VoteCommitted`).
    VoteCommitted,
    /// A voter revealed a matching commitment (`VoteRevealed`).
    VoteRevealed,
    /// A log from this contract that we don't recognise yet.
    Unknown,
}

impl EventKind {
    /// Parse the Solidity event name into an [`EventKind`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "EventCreated" => Self::EventCreated,
            "CandidateAdded" => Self::CandidateAdded,
            "VoteCommitted" => Self::VoteCommitted,
            "VoteRevealed" => Self::VoteRevealed,
            _ => Self::Unknown,
        }
    }

    /// Return a short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventCreated => "event_created",
            Self::CandidateAdded => "candidate_added",
            Self::VoteCommitted => "vote_committed",
            Self::VoteRevealed => "vote_revealed",
            Self::Unknown => "unknown",
        }
    }
}

/// A decoded voting-contract log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractEvent {
    EventCreated {
        event_id: u64,
        name: String,
        creator: Address,
    },
    CandidateAdded {
        event_id: u64,
        candidate_id: u64,
        name: String,
    },
    VoteCommitted {
        event_id: u64,
        voter: Address,
    },
    VoteRevealed {
        event_id: u64,
        voter: Address,
        candidate_id: u64,
    },
}

impl ContractEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EventCreated { .. } => EventKind::EventCreated,
            Self::CandidateAdded { .. } => EventKind::CandidateAdded,
            Self::VoteCommitted { .. } => EventKind::VoteCommitted,
            Self::VoteRevealed { .. } => EventKind::VoteRevealed,
        }
    }

    pub fn event_id(&self) -> u64 {
        match self {
            Self::EventCreated { event_id, .. }
            | Self::CandidateAdded { event_id, .. }
            | Self::VoteCommitted { event_id, .. }
            | Self::VoteRevealed { event_id, .. } => *event_id,
        }
    }
}

/// A decoded log together with where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub block_number: u64,
    pub tx_hash: TxHash,
    pub event: ContractEvent,
}

impl LoggedEvent {
    /// Flatten into the row stored in `chain_events`.
    pub fn to_row(&self) -> NewChainEvent {
        let (actor, candidate_id, detail) = match &self.event {
            ContractEvent::EventCreated { name, creator, .. } => {
                (Some(address_hex(creator)), None, Some(name.clone()))
            }
            ContractEvent::CandidateAdded {
                candidate_id, name, ..
            } => (None, Some(*candidate_id as i64), Some(name.clone())),
            ContractEvent::VoteCommitted { voter, .. } => (Some(address_hex(voter)), None, None),
            ContractEvent::VoteRevealed {
                voter,
                candidate_id,
                ..
            } => (Some(address_hex(voter)), Some(*candidate_id as i64), None),
        };

        NewChainEvent {
            kind: self.event.kind().as_str().to_string(),
            event_id: self.event.event_id() as i64,
            actor,
            candidate_id,
            detail,
            block_number: self.block_number as i64,
            tx_hash: tx_hash_hex(&self.tx_hash),
        }
    }
}

/// A decoded log ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChainEvent {
    pub kind: String,
    pub event_id: i64,
    pub actor: Option<String>,
    pub candidate_id: Option<i64>,
    pub detail: Option<String>,
    pub block_number: i64,
    pub tx_hash: String,
}

/// A log row as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChainEventRecord {
    pub id: i64,
    pub kind: String,
    pub event_id: i64,
    pub actor: Option<String>,
    pub candidate_id: Option<i64>,
    pub detail: Option<String>,
    pub block_number: i64,
    pub tx_hash: String,
    pub created_at: i64,
}

/// A vote about to be recorded in the off-chain ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVote {
    pub voter_id: String,
    pub event_id: u64,
    pub candidate_id: u64,
    /// Hash of the transaction that carried the vote.
    pub block_address: String,
}

/// One off-chain vote record. Advisory: the chain holds the real tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub id: i64,
    pub voter_id: String,
    pub event_id: i64,
    pub candidate_id: i64,
    pub block_address: String,
    pub created_at: i64,
}
