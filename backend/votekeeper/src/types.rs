//! # Types
//!
//! Strongly-typed records for everything read from or written to the voting
//! contract. Raw contract values (`uint256`) are range-checked into these
//! types at the chain boundary, so the rest of the crate never handles an
//! unvalidated value.
//!
//! A [`VotingEvent`] can only be built around a valid [`Schedule`], so its
//! `start < commit_end < reveal_deadline` ordering holds everywhere.

use ethers::types::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::events::ContractEvent;
use crate::phase::{resolve_phase, Phase, Schedule};

/// Reveal window used when the creator does not pick one (48 hours).
pub const DEFAULT_REVEAL_DURATION_SECS: u64 = 48 * 60 * 60;

/// Authoritative on-chain voting event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingEvent {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub creator: Address,
    pub schedule: Schedule,
    /// Commit acceptance can be paused independently of the time window.
    pub is_active: bool,
    pub total_votes: u64,
    pub candidate_ids: Vec<u64>,
}

impl VotingEvent {
    pub fn phase_at(&self, now: u64) -> Phase {
        resolve_phase(&self.schedule, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: u64,
    pub name: String,
    pub event_id: u64,
    pub vote_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitState {
    pub has_committed: bool,
    pub has_revealed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub winner_id: u64,
    pub winner_name: String,
    pub winner_votes: u64,
    pub total_votes: u64,
    /// Winner share of total votes, two decimals; `0.0` when nobody voted.
    pub percentage: f64,
}

impl Winner {
    pub fn new(winner_id: u64, winner_name: String, winner_votes: u64, total_votes: u64) -> Self {
        let percentage = if total_votes == 0 {
            0.0
        } else {
            (winner_votes as f64 / total_votes as f64 * 10_000.0).round() / 100.0
        };
        Self {
            winner_id,
            winner_name,
            winner_votes,
            total_votes,
            percentage,
        }
    }
}

/// Parameters for a new on-chain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    pub name: String,
    pub description: String,
    pub start_time: u64,
    /// End of the commit phase.
    pub end_time: u64,
    #[serde(default, rename = "revealDurationSecs")]
    pub reveal_duration: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEvent {
    pub event_id: u64,
    pub tx_hash: TxHash,
}

/// What a submitted transaction was for; used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Approve,
    Commit,
    Reveal,
    CreateEvent,
    AddCandidates,
}

/// A transaction accepted by the node but not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTx {
    pub tx_hash: TxHash,
    pub kind: TxKind,
}

/// Confirmed transaction with its voting-contract logs already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub events: Vec<ContractEvent>,
}

/// `0x…` hex form used in logs, the ledger and API payloads.
pub fn tx_hash_hex(hash: &TxHash) -> String {
    format!("{hash:#x}")
}

/// Lowercase `0x…` address form used as the ledger voter id.
pub fn address_hex(address: &Address) -> String {
    format!("{address:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winner_percentage_rounds_to_two_decimals() {
        let w = Winner::new(1, "Ada".into(), 1, 3);
        assert_eq!(w.percentage, 33.33);
        assert_eq!(Winner::new(1, "Ada".into(), 0, 0).percentage, 0.0);
    }

    #[test]
    fn hex_forms_are_prefixed_and_lowercase() {
        let address = Address::repeat_byte(0xAB);
        assert_eq!(address_hex(&address), format!("0x{}", "ab".repeat(20)));
        let hash = TxHash::repeat_byte(0x01);
        assert_eq!(tx_hash_hex(&hash), format!("0x{}", "01".repeat(32)));
    }

    #[test]
    fn draft_accepts_optional_reveal_duration() {
        let draft: EventDraft = serde_json::from_value(serde_json::json!({
            "name": "Council",
            "description": "",
            "startTime": 10,
            "endTime": 20
        }))
        .unwrap();
        assert_eq!(draft.reveal_duration, None);
    }
}
