//! In-process voting chain.
//!
//! Executes the voting contract's rules against in-memory state: every write
//! either reverts with a reason string and leaves state untouched, or mines a
//! one-transaction block, records a receipt and appends its logs. Time comes
//! from the injected [`Clock`], so tests drive phases with a `ManualClock`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, TxHash, U256};
use tracing::debug;

use super::{ContractFailure, RawCandidate, RawEvent, RawWinner, VotingContract};
use crate::clock::Clock;
use crate::codec::{compute_commitment, keccak256, Secret};
use crate::events::{ContractEvent, LoggedEvent};
use crate::types::TxReceipt;

/// One VOTE token, 18 decimals.
pub const ONE_TOKEN: u128 = 1_000_000_000_000_000_000;

const RECEIPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct EventState {
    name: String,
    description: String,
    creator: Address,
    start_time: u64,
    end_time: u64,
    reveal_deadline: u64,
    is_active: bool,
    total_votes: u64,
    candidates: Vec<CandidateState>,
}

#[derive(Debug, Clone)]
struct CandidateState {
    id: u64,
    name: String,
    vote_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Commitment {
    hash: [u8; 32],
    revealed: bool,
}

#[derive(Debug, Default)]
struct DevState {
    next_event_id: u64,
    events: BTreeMap<u64, EventState>,
    commitments: HashMap<(Address, u64), Commitment>,
    balances: HashMap<Address, U256>,
    allowances: HashMap<Address, U256>,
    vote_cost: U256,
    block: u64,
    nonce: u64,
    receipts: HashMap<TxHash, TxReceipt>,
    logs: Vec<LoggedEvent>,
    hold_confirmations: bool,
    offline: bool,
}

pub struct DevChain {
    state: Mutex<DevState>,
    clock: Arc<dyn Clock>,
    contract: Address,
}

impl DevChain {
    pub fn new(clock: Arc<dyn Clock>, vote_cost: u128) -> Self {
        let state = DevState {
            next_event_id: 1,
            vote_cost: U256::from(vote_cost),
            ..DevState::default()
        };
        Self {
            state: Mutex::new(state),
            clock,
            contract: Address::from_low_u64_be(0x7e57),
        }
    }

    /// Address the contract holds collected vote fees under.
    pub fn contract_address(&self) -> Address {
        self.contract
    }

    /// Mint VOTE tokens to `owner`.
    pub fn credit(&self, owner: Address, amount: u128) {
        let mut state = self.lock();
        let balance = state.balances.entry(owner).or_default();
        *balance = balance.saturating_add(U256::from(amount));
    }

    /// Simulate a node that refuses every request.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Keep submitted transactions unconfirmed until released.
    pub fn hold_confirmations(&self, hold: bool) {
        self.lock().hold_confirmations = hold;
    }

    /// Pause or resume commit acceptance for an event, as its creator would.
    pub fn set_event_active(&self, event_id: u64, active: bool) {
        if let Some(event) = self.lock().events.get_mut(&event_id) {
            event.is_active = active;
        }
    }

    /// Number of commitments stored for `event_id`.
    pub fn commitment_count(&self, event_id: u64) -> usize {
        self.lock()
            .commitments
            .keys()
            .filter(|(_, id)| *id == event_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, DevState> {
        // State is only mutated after every check passes, so a poisoned
        // guard still holds consistent data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn online(&self) -> Result<MutexGuard<'_, DevState>, ContractFailure> {
        let state = self.lock();
        if state.offline {
            return Err(ContractFailure::Unreachable(
                "dev chain is offline".to_string(),
            ));
        }
        Ok(state)
    }

    /// Run `op` as one transaction: revert leaves state untouched, success
    /// mines a block carrying the emitted logs.
    fn transact<F>(&self, op: F) -> Result<TxHash, ContractFailure>
    where
        F: FnOnce(&mut DevState, u64) -> Result<Vec<ContractEvent>, String>,
    {
        let now = self.clock.now();
        let mut state = self.online()?;
        let events = op(&mut *state, now).map_err(ContractFailure::Reverted)?;

        state.nonce += 1;
        state.block += 1;
        let tx_hash = TxHash::from(keccak256(&state.nonce.to_be_bytes()));
        let block_number = state.block;

        for event in &events {
            state.logs.push(LoggedEvent {
                block_number,
                tx_hash,
                event: event.clone(),
            });
        }
        state.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                block_number,
                success: true,
                events,
            },
        );
        debug!("dev chain mined block {block_number} ({tx_hash:#x})");
        Ok(tx_hash)
    }
}

impl DevState {
    fn event(&self, event_id: u64) -> Result<&EventState, String> {
        self.events
            .get(&event_id)
            .ok_or_else(|| "event does not exist".to_string())
    }

    fn debit_vote_cost(&mut self, voter: Address, contract: Address) -> Result<(), String> {
        let cost = self.vote_cost;
        let balance = self.balances.get(&voter).copied().unwrap_or_default();
        if balance < cost {
            return Err("insufficient balance".to_string());
        }
        let allowance = self.allowances.get(&voter).copied().unwrap_or_default();
        if allowance < cost {
            return Err("insufficient allowance".to_string());
        }
        self.balances.insert(voter, balance - cost);
        self.allowances.insert(voter, allowance - cost);
        let held = self.balances.entry(contract).or_default();
        *held = held.saturating_add(cost);
        Ok(())
    }
}

#[async_trait]
impl VotingContract for DevChain {
    async fn get_event(&self, event_id: u64) -> Result<RawEvent, ContractFailure> {
        let state = self.online()?;
        let event = state.event(event_id).map_err(ContractFailure::Reverted)?;
        Ok(RawEvent {
            id: U256::from(event_id),
            name: event.name.clone(),
            description: event.description.clone(),
            creator: event.creator,
            start_time: U256::from(event.start_time),
            end_time: U256::from(event.end_time),
            reveal_deadline: U256::from(event.reveal_deadline),
            is_active: event.is_active,
            total_votes: U256::from(event.total_votes),
            candidate_ids: event.candidates.iter().map(|c| U256::from(c.id)).collect(),
        })
    }

    async fn get_event_candidates(
        &self,
        event_id: u64,
    ) -> Result<Vec<RawCandidate>, ContractFailure> {
        let state = self.online()?;
        let event = state.event(event_id).map_err(ContractFailure::Reverted)?;
        Ok(event
            .candidates
            .iter()
            .map(|c| RawCandidate {
                id: U256::from(c.id),
                name: c.name.clone(),
                event_id: U256::from(event_id),
                vote_count: U256::from(c.vote_count),
                exists: true,
            })
            .collect())
    }

    async fn get_winner(&self, event_id: u64) -> Result<RawWinner, ContractFailure> {
        let state = self.online()?;
        let event = state.event(event_id).map_err(ContractFailure::Reverted)?;
        // First candidate wins ties, matching a strict `>` scan.
        let mut best: Option<&CandidateState> = None;
        for candidate in &event.candidates {
            if best.map_or(true, |b| candidate.vote_count > b.vote_count) {
                best = Some(candidate);
            }
        }
        let winner =
            best.ok_or_else(|| ContractFailure::Reverted("no candidates".to_string()))?;
        Ok(RawWinner {
            winner_id: U256::from(winner.id),
            winner_name: winner.name.clone(),
            winner_votes: U256::from(winner.vote_count),
            total_votes: U256::from(event.total_votes),
        })
    }

    async fn vote_token_cost(&self) -> Result<U256, ContractFailure> {
        Ok(self.online()?.vote_cost)
    }

    async fn has_committed(&self, voter: Address, event_id: u64) -> Result<bool, ContractFailure> {
        Ok(self.online()?.commitments.contains_key(&(voter, event_id)))
    }

    async fn has_revealed(&self, voter: Address, event_id: u64) -> Result<bool, ContractFailure> {
        Ok(self
            .online()?
            .commitments
            .get(&(voter, event_id))
            .map_or(false, |c| c.revealed))
    }

    async fn balance_of(&self, owner: Address) -> Result<U256, ContractFailure> {
        Ok(self
            .online()?
            .balances
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    async fn allowance(&self, owner: Address) -> Result<U256, ContractFailure> {
        Ok(self
            .online()?
            .allowances
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    async fn approve(&self, from: Address, amount: U256) -> Result<TxHash, ContractFailure> {
        self.transact(|state, _| {
            state.allowances.insert(from, amount);
            Ok(Vec::new())
        })
    }

    async fn commit_vote(
        &self,
        from: Address,
        event_id: u64,
        commit_hash: [u8; 32],
    ) -> Result<TxHash, ContractFailure> {
        let contract = self.contract;
        self.transact(|state, now| {
            let event = state.event(event_id)?;
            if !event.is_active {
                return Err("event is not active".to_string());
            }
            if now < event.start_time || now > event.end_time {
                return Err("not in commit phase".to_string());
            }
            if state.commitments.contains_key(&(from, event_id)) {
                return Err("already committed".to_string());
            }
            state.debit_vote_cost(from, contract)?;
            state.commitments.insert(
                (from, event_id),
                Commitment {
                    hash: commit_hash,
                    revealed: false,
                },
            );
            Ok(vec![ContractEvent::VoteCommitted {
                event_id,
                voter: from,
            }])
        })
    }

    async fn reveal_vote(
        &self,
        from: Address,
        event_id: u64,
        candidate_id: u64,
        secret: [u8; 32],
    ) -> Result<TxHash, ContractFailure> {
        self.transact(|state, now| {
            let event = state.event(event_id)?;
            if now <= event.end_time || now > event.reveal_deadline {
                return Err("not in reveal phase".to_string());
            }
            let commitment = state
                .commitments
                .get(&(from, event_id))
                .copied()
                .ok_or_else(|| "no commitment".to_string())?;
            if commitment.revealed {
                return Err("already revealed".to_string());
            }
            let recomputed = compute_commitment(candidate_id, &Secret::from_bytes(secret));
            if recomputed.0 != commitment.hash {
                return Err("hash mismatch".to_string());
            }

            let event = state
                .events
                .get_mut(&event_id)
                .ok_or_else(|| "event does not exist".to_string())?;
            let candidate = event
                .candidates
                .iter_mut()
                .find(|c| c.id == candidate_id)
                .ok_or_else(|| "invalid candidate".to_string())?;
            candidate.vote_count += 1;
            event.total_votes += 1;
            if let Some(stored) = state.commitments.get_mut(&(from, event_id)) {
                stored.revealed = true;
            }

            Ok(vec![ContractEvent::VoteRevealed {
                event_id,
                voter: from,
                candidate_id,
            }])
        })
    }

    async fn create_event(
        &self,
        from: Address,
        name: &str,
        description: &str,
        start_time: u64,
        end_time: u64,
        reveal_duration: u64,
    ) -> Result<TxHash, ContractFailure> {
        self.transact(|state, _| {
            if end_time <= start_time {
                return Err("end time must be after start time".to_string());
            }
            if reveal_duration == 0 {
                return Err("reveal duration must be positive".to_string());
            }
            let reveal_deadline = end_time
                .checked_add(reveal_duration)
                .ok_or_else(|| "reveal deadline overflows".to_string())?;

            let event_id = state.next_event_id;
            state.next_event_id += 1;
            state.events.insert(
                event_id,
                EventState {
                    name: name.to_string(),
                    description: description.to_string(),
                    creator: from,
                    start_time,
                    end_time,
                    reveal_deadline,
                    is_active: true,
                    total_votes: 0,
                    candidates: Vec::new(),
                },
            );
            Ok(vec![ContractEvent::EventCreated {
                event_id,
                name: name.to_string(),
                creator: from,
            }])
        })
    }

    async fn add_candidates(
        &self,
        from: Address,
        event_id: u64,
        names: &[String],
    ) -> Result<TxHash, ContractFailure> {
        self.transact(|state, now| {
            let event = state
                .events
                .get_mut(&event_id)
                .ok_or_else(|| "event does not exist".to_string())?;
            if event.creator != from {
                return Err("only the event creator can add candidates".to_string());
            }
            if now > event.end_time {
                return Err("commit phase is over".to_string());
            }
            if names.is_empty() {
                return Err("no candidates given".to_string());
            }
            for (i, name) in names.iter().enumerate() {
                let taken = event.candidates.iter().any(|c| &c.name == name)
                    || names[..i].contains(name);
                if taken {
                    return Err(format!("duplicate candidate name {name}"));
                }
            }

            let mut logs = Vec::with_capacity(names.len());
            for name in names {
                let candidate_id = event.candidates.len() as u64 + 1;
                event.candidates.push(CandidateState {
                    id: candidate_id,
                    name: name.clone(),
                    vote_count: 0,
                });
                logs.push(ContractEvent::CandidateAdded {
                    event_id,
                    candidate_id,
                    name: name.clone(),
                });
            }
            Ok(logs)
        })
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ContractFailure> {
        loop {
            {
                let state = self.online()?;
                if !state.hold_confirmations {
                    return state
                        .receipts
                        .get(&tx_hash)
                        .cloned()
                        .ok_or_else(|| ContractFailure::Dropped(format!("{tx_hash:#x}")));
                }
            }
            tokio::time::sleep(RECEIPT_POLL).await;
        }
    }

    async fn latest_block(&self) -> Result<u64, ContractFailure> {
        Ok(self.online()?.block)
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LoggedEvent>, ContractFailure> {
        Ok(self
            .online()?
            .logs
            .iter()
            .filter(|l| l.block_number >= from_block && l.block_number <= to_block)
            .cloned()
            .collect())
    }
}
