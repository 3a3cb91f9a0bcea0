//! Access to the voting and token contracts.
//!
//! [`VotingContract`] is the raw function-call surface of the two contracts,
//! returning `uint256` values untouched. [`ChainGateway`] sits on top: it
//! range-checks every value into the crate's typed records, validates
//! preconditions before asking a signer for anything, and classifies reverts.
//!
//! Two implementations of the surface exist: [`evm::EvmContract`] talks to a
//! real JSON-RPC node via `ethers`, [`dev::DevChain`] executes the same rules
//! in-process for local runs and tests.

pub mod dev;
pub mod evm;
pub mod gateway;
pub mod subscription;

use async_trait::async_trait;
use ethers::types::{Address, TxHash, U256};
use thiserror::Error;

use crate::events::LoggedEvent;
use crate::phase::Schedule;
use crate::types::{Candidate, TxReceipt, VotingEvent};

pub use gateway::ChainGateway;

/// Failure reported by a contract backend, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractFailure {
    #[error("rpc unreachable: {0}")]
    Unreachable(String),

    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("signer rejected the transaction: {0}")]
    Rejected(String),

    #[error("transaction dropped: {0}")]
    Dropped(String),

    #[error("no signer attached")]
    NoSigner,

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// `getEvent` result as returned by the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub id: U256,
    pub name: String,
    pub description: String,
    pub creator: Address,
    pub start_time: U256,
    pub end_time: U256,
    pub reveal_deadline: U256,
    pub is_active: bool,
    pub total_votes: U256,
    pub candidate_ids: Vec<U256>,
}

/// One element of `getEventCandidates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub id: U256,
    pub name: String,
    pub event_id: U256,
    pub vote_count: U256,
    pub exists: bool,
}

/// `getWinner` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWinner {
    pub winner_id: U256,
    pub winner_name: String,
    pub winner_votes: U256,
    pub total_votes: U256,
}

/// Function surface of the voting system contract and its VOTE token.
///
/// Write methods return as soon as the node accepts the transaction;
/// [`VotingContract::wait_for_receipt`] waits for it to be mined.
#[async_trait]
pub trait VotingContract: Send + Sync {
    async fn get_event(&self, event_id: u64) -> Result<RawEvent, ContractFailure>;
    async fn get_event_candidates(&self, event_id: u64)
        -> Result<Vec<RawCandidate>, ContractFailure>;
    async fn get_winner(&self, event_id: u64) -> Result<RawWinner, ContractFailure>;
    async fn vote_token_cost(&self) -> Result<U256, ContractFailure>;
    async fn has_committed(&self, voter: Address, event_id: u64) -> Result<bool, ContractFailure>;
    async fn has_revealed(&self, voter: Address, event_id: u64) -> Result<bool, ContractFailure>;

    async fn balance_of(&self, owner: Address) -> Result<U256, ContractFailure>;
    /// Allowance granted by `owner` to the voting system contract.
    async fn allowance(&self, owner: Address) -> Result<U256, ContractFailure>;
    /// `approve(votingSystem, amount)` on the token, sent by `from`.
    async fn approve(&self, from: Address, amount: U256) -> Result<TxHash, ContractFailure>;

    async fn commit_vote(
        &self,
        from: Address,
        event_id: u64,
        commit_hash: [u8; 32],
    ) -> Result<TxHash, ContractFailure>;
    async fn reveal_vote(
        &self,
        from: Address,
        event_id: u64,
        candidate_id: u64,
        secret: [u8; 32],
    ) -> Result<TxHash, ContractFailure>;
    async fn create_event(
        &self,
        from: Address,
        name: &str,
        description: &str,
        start_time: u64,
        end_time: u64,
        reveal_duration: u64,
    ) -> Result<TxHash, ContractFailure>;
    async fn add_candidates(
        &self,
        from: Address,
        event_id: u64,
        names: &[String],
    ) -> Result<TxHash, ContractFailure>;

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ContractFailure>;
    async fn latest_block(&self) -> Result<u64, ContractFailure>;
    /// Decoded voting-contract logs in `[from_block, to_block]`.
    async fn logs(&self, from_block: u64, to_block: u64)
        -> Result<Vec<LoggedEvent>, ContractFailure>;
}

// ─────────────────────────────────────────────────────────
// Boundary conversions
// ─────────────────────────────────────────────────────────

pub(crate) fn to_u64(value: U256, field: &str) -> Result<u64, ContractFailure> {
    u64::try_from(value)
        .map_err(|_| ContractFailure::Malformed(format!("{field} out of range: {value}")))
}

pub(crate) fn to_u128(value: U256, field: &str) -> Result<u128, ContractFailure> {
    u128::try_from(value)
        .map_err(|_| ContractFailure::Malformed(format!("{field} out of range: {value}")))
}

impl TryFrom<RawEvent> for VotingEvent {
    type Error = ContractFailure;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let id = to_u64(raw.id, "event id")?;
        let start = to_u64(raw.start_time, "startTime")?;
        let end = to_u64(raw.end_time, "endTime")?;
        let deadline = to_u64(raw.reveal_deadline, "revealDeadline")?;
        let schedule = Schedule::new(start, end, deadline).ok_or_else(|| {
            ContractFailure::Malformed(format!(
                "event {id} has unordered schedule {start}/{end}/{deadline}"
            ))
        })?;
        let candidate_ids = raw
            .candidate_ids
            .into_iter()
            .map(|c| to_u64(c, "candidate id"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(VotingEvent {
            id,
            name: raw.name,
            description: raw.description,
            creator: raw.creator,
            schedule,
            is_active: raw.is_active,
            total_votes: to_u64(raw.total_votes, "totalVotes")?,
            candidate_ids,
        })
    }
}

impl TryFrom<RawCandidate> for Candidate {
    type Error = ContractFailure;

    fn try_from(raw: RawCandidate) -> Result<Self, Self::Error> {
        Ok(Candidate {
            id: to_u64(raw.id, "candidate id")?,
            name: raw.name,
            event_id: to_u64(raw.event_id, "candidate eventId")?,
            vote_count: to_u64(raw.vote_count, "voteCount")?,
        })
    }
}
