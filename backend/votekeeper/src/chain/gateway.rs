//! Typed gateway over a [`VotingContract`].
//!
//! Reads come in two flavours. `try_*` methods return every failure;
//! `fetch_*` methods log the failure and hand back a default so a display
//! path never aborts on a flaky node. Writes always validate their
//! preconditions with fresh strict reads before anything is signed, and are
//! split into submit and [`ChainGateway::confirm`] so callers decide how long
//! to wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use tracing::{debug, info, warn};

use super::subscription::LogSubscription;
use super::{to_u128, to_u64, ContractFailure, VotingContract};
use crate::clock::Clock;
use crate::codec::{compute_commitment, Secret};
use crate::errors::GatewayError;
use crate::events::ContractEvent;
use crate::phase::Phase;
use crate::types::{
    tx_hash_hex, Candidate, CommitState, CreatedEvent, EventDraft, SubmittedTx, TxKind,
    TxReceipt, VotingEvent, Winner, DEFAULT_REVEAL_DURATION_SECS,
};

const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_millis(200);

pub struct ChainGateway {
    contract: Arc<dyn VotingContract>,
    clock: Arc<dyn Clock>,
}

impl ChainGateway {
    pub fn new(contract: Arc<dyn VotingContract>, clock: Arc<dyn Clock>) -> Self {
        Self { contract, clock }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Run a read, retrying only when the node is unreachable.
    async fn read<T, F, Fut>(&self, what: &str, op: F) -> Result<T, ContractFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ContractFailure>>,
    {
        let mut delay = READ_BACKOFF;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(ContractFailure::Unreachable(e)) if attempt < READ_ATTEMPTS => {
                    warn!("{what} failed (attempt {attempt}/{READ_ATTEMPTS}): {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Strict reads
    // ─────────────────────────────────────────────────────────

    pub async fn try_fetch_event(&self, event_id: u64) -> Result<VotingEvent, GatewayError> {
        let raw = self
            .read("getEvent", || self.contract.get_event(event_id))
            .await
            .map_err(|f| read_failure(f, event_id))?;
        VotingEvent::try_from(raw).map_err(|f| read_failure(f, event_id))
    }

    /// Candidates of an event, skipping slots the contract marks as absent.
    pub async fn try_fetch_candidates(&self, event_id: u64) -> Result<Vec<Candidate>, GatewayError> {
        let raw = self
            .read("getEventCandidates", || {
                self.contract.get_event_candidates(event_id)
            })
            .await
            .map_err(|f| read_failure(f, event_id))?;
        raw.into_iter()
            .filter(|c| c.exists)
            .map(|c| Candidate::try_from(c).map_err(|f| read_failure(f, event_id)))
            .collect()
    }

    pub async fn try_fetch_vote_cost(&self) -> Result<u128, GatewayError> {
        let raw = self
            .read("voteTokenCost", || self.contract.vote_token_cost())
            .await
            .map_err(|f| read_failure(f, 0))?;
        to_u128(raw, "voteTokenCost").map_err(|f| read_failure(f, 0))
    }

    pub async fn try_fetch_commit_state(
        &self,
        voter: Address,
        event_id: u64,
    ) -> Result<CommitState, GatewayError> {
        let has_committed = self
            .read("hasCommitted", || self.contract.has_committed(voter, event_id))
            .await
            .map_err(|f| read_failure(f, event_id))?;
        let has_revealed = self
            .read("hasRevealed", || self.contract.has_revealed(voter, event_id))
            .await
            .map_err(|f| read_failure(f, event_id))?;
        Ok(CommitState {
            has_committed,
            has_revealed,
        })
    }

    pub async fn try_fetch_balance(&self, owner: Address) -> Result<u128, GatewayError> {
        let raw = self
            .read("balanceOf", || self.contract.balance_of(owner))
            .await
            .map_err(|f| read_failure(f, 0))?;
        to_u128(raw, "balance").map_err(|f| read_failure(f, 0))
    }

    pub async fn try_fetch_allowance(&self, owner: Address) -> Result<u128, GatewayError> {
        let raw = self
            .read("allowance", || self.contract.allowance(owner))
            .await
            .map_err(|f| read_failure(f, 0))?;
        to_u128(raw, "allowance").map_err(|f| read_failure(f, 0))
    }

    pub async fn try_fetch_winner(&self, event_id: u64) -> Result<Winner, GatewayError> {
        let raw = self
            .read("getWinner", || self.contract.get_winner(event_id))
            .await
            .map_err(|f| read_failure(f, event_id))?;
        let convert = || -> Result<Winner, ContractFailure> {
            Ok(Winner::new(
                to_u64(raw.winner_id, "winnerId")?,
                raw.winner_name.clone(),
                to_u64(raw.winner_votes, "winnerVotes")?,
                to_u64(raw.total_votes, "totalVotes")?,
            ))
        };
        convert().map_err(|f| read_failure(f, event_id))
    }

    // ─────────────────────────────────────────────────────────
    // Lenient reads
    // ─────────────────────────────────────────────────────────

    pub async fn fetch_event(&self, event_id: u64) -> Option<VotingEvent> {
        match self.try_fetch_event(event_id).await {
            Ok(event) => Some(event),
            Err(GatewayError::EventNotFound(_)) => {
                debug!("event {event_id} not found on chain");
                None
            }
            Err(e) => {
                warn!("reading event {event_id} failed: {e}");
                None
            }
        }
    }

    pub async fn fetch_candidates(&self, event_id: u64) -> Vec<Candidate> {
        self.try_fetch_candidates(event_id)
            .await
            .unwrap_or_else(|e| {
                warn!("reading candidates of event {event_id} failed: {e}");
                Vec::new()
            })
    }

    pub async fn fetch_vote_cost(&self) -> u128 {
        self.try_fetch_vote_cost().await.unwrap_or_else(|e| {
            warn!("reading vote cost failed: {e}");
            0
        })
    }

    pub async fn fetch_commit_state(&self, voter: Address, event_id: u64) -> CommitState {
        self.try_fetch_commit_state(voter, event_id)
            .await
            .unwrap_or_else(|e| {
                warn!("reading commit state for event {event_id} failed: {e}");
                CommitState::default()
            })
    }

    pub async fn fetch_balance(&self, owner: Address) -> u128 {
        self.try_fetch_balance(owner).await.unwrap_or_else(|e| {
            warn!("reading VOTE balance failed: {e}");
            0
        })
    }

    pub async fn fetch_winner(&self, event_id: u64) -> Option<Winner> {
        match self.try_fetch_winner(event_id).await {
            Ok(winner) => Some(winner),
            Err(e) => {
                warn!("reading winner of event {event_id} failed: {e}");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────

    pub async fn submit_approval(
        &self,
        owner: Address,
        amount: u128,
    ) -> Result<SubmittedTx, GatewayError> {
        let tx_hash = self
            .contract
            .approve(owner, U256::from(amount))
            .await
            .map_err(|f| submit_failure(f, TxKind::Approve, 0, None))?;
        info!("approval submitted: {}", tx_hash_hex(&tx_hash));
        Ok(SubmittedTx {
            tx_hash,
            kind: TxKind::Approve,
        })
    }

    /// Validate and submit a commitment for `candidate_id` under `secret`.
    pub async fn submit_commit(
        &self,
        voter: Address,
        event_id: u64,
        candidate_id: u64,
        secret: &Secret,
    ) -> Result<SubmittedTx, GatewayError> {
        self.check_commit(voter, event_id)
            .await
            .map_err(GatewayError::in_write_path)?;

        let commitment = compute_commitment(candidate_id, secret);
        let tx_hash = self
            .contract
            .commit_vote(voter, event_id, commitment.0)
            .await
            .map_err(|f| submit_failure(f, TxKind::Commit, event_id, Some(candidate_id)))?;
        info!(
            "commit submitted for event {event_id}: {}",
            tx_hash_hex(&tx_hash)
        );
        Ok(SubmittedTx {
            tx_hash,
            kind: TxKind::Commit,
        })
    }

    async fn check_commit(&self, voter: Address, event_id: u64) -> Result<(), GatewayError> {
        self.check_commit_window(voter, event_id).await?;

        let required = self.try_fetch_vote_cost().await?;
        let balance = self.try_fetch_balance(voter).await?;
        if balance < required {
            return Err(GatewayError::InsufficientBalance { balance, required });
        }
        let allowance = self.try_fetch_allowance(voter).await?;
        if allowance < required {
            return Err(GatewayError::AllowanceRequired {
                allowance,
                required,
            });
        }
        Ok(())
    }

    /// Checks that `voter` may commit on `event_id` now, independent of funds.
    pub async fn check_commit_window(
        &self,
        voter: Address,
        event_id: u64,
    ) -> Result<(), GatewayError> {
        let event = self.try_fetch_event(event_id).await?;
        if event.phase_at(self.now()) != Phase::CommitPhase {
            return Err(GatewayError::PhaseViolation {
                required: Phase::CommitPhase,
            });
        }
        if !event.is_active {
            return Err(GatewayError::EventInactive(event_id));
        }
        if self
            .try_fetch_commit_state(voter, event_id)
            .await?
            .has_committed
        {
            return Err(GatewayError::AlreadyCommitted);
        }
        Ok(())
    }

    pub async fn submit_reveal(
        &self,
        voter: Address,
        event_id: u64,
        candidate_id: u64,
        secret: &Secret,
    ) -> Result<SubmittedTx, GatewayError> {
        self.check_reveal(voter, event_id)
            .await
            .map_err(GatewayError::in_write_path)?;

        let tx_hash = self
            .contract
            .reveal_vote(voter, event_id, candidate_id, *secret.as_bytes())
            .await
            .map_err(|f| submit_failure(f, TxKind::Reveal, event_id, Some(candidate_id)))?;
        info!(
            "reveal submitted for event {event_id}: {}",
            tx_hash_hex(&tx_hash)
        );
        Ok(SubmittedTx {
            tx_hash,
            kind: TxKind::Reveal,
        })
    }

    async fn check_reveal(&self, voter: Address, event_id: u64) -> Result<(), GatewayError> {
        let event = self.try_fetch_event(event_id).await?;
        if event.phase_at(self.now()) != Phase::RevealPhase {
            return Err(GatewayError::PhaseViolation {
                required: Phase::RevealPhase,
            });
        }
        let state = self.try_fetch_commit_state(voter, event_id).await?;
        if !state.has_committed {
            return Err(GatewayError::NoCommitment);
        }
        if state.has_revealed {
            return Err(GatewayError::AlreadyRevealed);
        }
        Ok(())
    }

    /// Wait until `tx` is mined. `None` waits indefinitely.
    pub async fn confirm(
        &self,
        tx: &SubmittedTx,
        timeout: Option<Duration>,
    ) -> Result<TxReceipt, GatewayError> {
        let wait = self.contract.wait_for_receipt(tx.tx_hash);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                GatewayError::ConfirmationTimeout {
                    tx_hash: tx_hash_hex(&tx.tx_hash),
                    waited_secs: limit.as_secs(),
                }
            })?,
            None => wait.await,
        };

        let receipt = outcome.map_err(|f| {
            GatewayError::TransactionFailed(format!(
                "{:?} transaction {}: {f}",
                tx.kind,
                tx_hash_hex(&tx.tx_hash)
            ))
        })?;
        if !receipt.success {
            return Err(GatewayError::TransactionFailed(format!(
                "{:?} transaction {} reverted on chain",
                tx.kind,
                tx_hash_hex(&tx.tx_hash)
            )));
        }
        info!(
            "{:?} transaction {} confirmed in block {}",
            tx.kind,
            tx_hash_hex(&tx.tx_hash),
            receipt.block_number
        );
        Ok(receipt)
    }

    /// Create an event and resolve its id from the `EventCreated` log.
    pub async fn create_event(
        &self,
        creator: Address,
        draft: &EventDraft,
        timeout: Option<Duration>,
    ) -> Result<CreatedEvent, GatewayError> {
        if draft.end_time <= draft.start_time {
            return Err(GatewayError::InvalidSchedule {
                start: draft.start_time,
                end: draft.end_time,
            });
        }
        let reveal_duration = draft
            .reveal_duration
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_REVEAL_DURATION_SECS);

        let tx_hash = self
            .contract
            .create_event(
                creator,
                &draft.name,
                &draft.description,
                draft.start_time,
                draft.end_time,
                reveal_duration,
            )
            .await
            .map_err(|f| submit_failure(f, TxKind::CreateEvent, 0, None))?;
        let tx = SubmittedTx {
            tx_hash,
            kind: TxKind::CreateEvent,
        };
        let receipt = self.confirm(&tx, timeout).await?;
        let event_id = created_event_id(&receipt)?;
        info!("event {event_id} created ({})", tx_hash_hex(&tx_hash));
        Ok(CreatedEvent { event_id, tx_hash })
    }

    pub async fn add_candidates(
        &self,
        creator: Address,
        event_id: u64,
        names: &[String],
        timeout: Option<Duration>,
    ) -> Result<TxReceipt, GatewayError> {
        let names = validate_candidate_names(names)?;
        let tx_hash = self
            .contract
            .add_candidates(creator, event_id, &names)
            .await
            .map_err(|f| submit_failure(f, TxKind::AddCandidates, event_id, None))?;
        let tx = SubmittedTx {
            tx_hash,
            kind: TxKind::AddCandidates,
        };
        self.confirm(&tx, timeout).await
    }

    /// Stream decoded voting-contract logs starting at `from_block`.
    pub fn subscribe(
        &self,
        from_block: u64,
        poll_interval: Duration,
        batch_blocks: u64,
    ) -> LogSubscription {
        LogSubscription::spawn(
            self.contract.clone(),
            from_block,
            poll_interval,
            batch_blocks,
        )
    }
}

fn created_event_id(receipt: &TxReceipt) -> Result<u64, GatewayError> {
    let mut ids = receipt.events.iter().filter_map(|e| match e {
        ContractEvent::EventCreated { event_id, .. } => Some(*event_id),
        _ => None,
    });
    let first = ids.next().ok_or_else(|| GatewayError::EventIdUnresolvable {
        tx_hash: tx_hash_hex(&receipt.tx_hash),
    })?;
    let extra = ids.count();
    if extra > 0 {
        warn!(
            "transaction {} emitted {} EventCreated logs; using event {first}",
            tx_hash_hex(&receipt.tx_hash),
            extra + 1
        );
    }
    Ok(first)
}

fn validate_candidate_names(names: &[String]) -> Result<Vec<String>, GatewayError> {
    if names.is_empty() {
        return Err(GatewayError::InvalidCandidates(
            "at least one candidate is required".into(),
        ));
    }
    let mut cleaned: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::InvalidCandidates(
                "candidate names cannot be blank".into(),
            ));
        }
        if cleaned.iter().any(|n| n == name) {
            return Err(GatewayError::InvalidCandidates(format!(
                "duplicate candidate name {name}"
            )));
        }
        cleaned.push(name.to_string());
    }
    Ok(cleaned)
}

fn read_failure(failure: ContractFailure, event_id: u64) -> GatewayError {
    match failure {
        ContractFailure::Unreachable(e) => GatewayError::Unreachable(e),
        ContractFailure::Reverted(reason) if event_id != 0 => {
            debug!("read for event {event_id} reverted: {reason}");
            GatewayError::EventNotFound(event_id)
        }
        ContractFailure::Malformed(e) => GatewayError::Malformed(e),
        other => GatewayError::Malformed(other.to_string()),
    }
}

fn submit_failure(
    failure: ContractFailure,
    kind: TxKind,
    event_id: u64,
    candidate_id: Option<u64>,
) -> GatewayError {
    match failure {
        ContractFailure::Reverted(reason) => classify_revert(&reason, event_id, candidate_id),
        ContractFailure::NoSigner => GatewayError::SignerRequired(format!("{kind:?}")),
        ContractFailure::Rejected(e) => {
            GatewayError::TransactionFailed(format!("signer rejected {kind:?}: {e}"))
        }
        ContractFailure::Unreachable(e) | ContractFailure::Dropped(e) => {
            GatewayError::TransactionFailed(format!("{kind:?} not submitted: {e}"))
        }
        ContractFailure::Malformed(e) => GatewayError::Malformed(e),
    }
}

/// Map a contract revert reason onto the typed error it corresponds to.
pub(crate) fn classify_revert(
    reason: &str,
    event_id: u64,
    candidate_id: Option<u64>,
) -> GatewayError {
    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("already committed") {
        GatewayError::AlreadyCommitted
    } else if lowered.contains("already revealed") {
        GatewayError::AlreadyRevealed
    } else if lowered.contains("no commitment") || lowered.contains("not committed") {
        GatewayError::NoCommitment
    } else if lowered.contains("hash mismatch") || lowered.contains("invalid reveal") {
        GatewayError::HashMismatch
    } else if lowered.contains("not in commit phase") {
        GatewayError::PhaseViolation {
            required: Phase::CommitPhase,
        }
    } else if lowered.contains("not in reveal phase") {
        GatewayError::PhaseViolation {
            required: Phase::RevealPhase,
        }
    } else if lowered.contains("not active") {
        GatewayError::EventInactive(event_id)
    } else if lowered.contains("does not exist") && event_id != 0 {
        GatewayError::EventNotFound(event_id)
    } else if lowered.contains("invalid candidate") {
        GatewayError::UnknownCandidate {
            event_id,
            candidate_id: candidate_id.unwrap_or_default(),
        }
    } else if lowered.contains("end time") {
        GatewayError::InvalidSchedule { start: 0, end: 0 }
    } else if lowered.contains("duplicate candidate") {
        GatewayError::InvalidCandidates(reason.to_string())
    } else {
        GatewayError::TransactionFailed(format!("reverted: {reason}"))
    }
}
