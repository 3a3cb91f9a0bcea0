//! JSON-RPC backend for [`VotingContract`], built on `ethers` bindings.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{Detokenize, RawLog};
use ethers::contract::{abigen, ContractCall, ContractError, EthLogDecode};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, PendingTransaction, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Filter, Log, TxHash, U256};
use tracing::{debug, warn};

use super::{to_u64, ContractFailure, RawCandidate, RawEvent, RawWinner, VotingContract};
use crate::errors::AppError;
use crate::events::{ContractEvent, LoggedEvent};
use crate::types::TxReceipt;

abigen!(
    VotingSystem,
    r#"[
        function getEvent(uint256 eventId) external view returns ((uint256,string,string,address,uint256,uint256,uint256,bool,uint256,uint256[]))
        function getEventCandidates(uint256 eventId) external view returns ((uint256,string,uint256,uint256,bool)[])
        function getWinner(uint256 eventId) external view returns (uint256, string, uint256, uint256)
        function voteTokenCost() external view returns (uint256)
        function hasCommitted(address voter, uint256 eventId) external view returns (bool)
        function hasRevealed(address voter, uint256 eventId) external view returns (bool)
        function commitVote(uint256 eventId, bytes32 commitHash) external
        function revealVote(uint256 eventId, uint256 candidateId, bytes32 secret) external
        function createEvent(string name, string description, uint256 startTime, uint256 endTime, uint256 revealDuration) external returns (uint256)
        function addCandidates(uint256 eventId, string[] candidateNames) external
        event EventCreated(uint256 indexed eventId, string name, address creator)
        event CandidateAdded(uint256 indexed eventId, uint256 candidateId, string name)
        event VoteCommitted(uint256 indexed eventId, address indexed voter)
        event VoteRevealed(uint256 indexed eventId, address indexed voter, uint256 candidateId)
    ]"#
);

abigen!(
    VoteToken,
    r#"[
        function balanceOf(address owner) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EvmContract {
    provider: Provider<Http>,
    voting: VotingSystem<Provider<Http>>,
    token: VoteToken<Provider<Http>>,
    signer: Option<Arc<SignerClient>>,
    voting_address: Address,
    token_address: Address,
}

impl EvmContract {
    pub fn connect(
        rpc_url: &str,
        chain_id: u64,
        voting_address: Address,
        token_address: Address,
        wallet: Option<LocalWallet>,
    ) -> Result<Self, AppError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| AppError::Config(format!("invalid RPC_URL {rpc_url}: {e}")))?;
        let reader = Arc::new(provider.clone());
        let signer = wallet.map(|wallet| {
            Arc::new(SignerMiddleware::new(
                provider.clone(),
                wallet.with_chain_id(chain_id),
            ))
        });

        Ok(Self {
            voting: VotingSystem::new(voting_address, reader.clone()),
            token: VoteToken::new(token_address, reader),
            provider,
            signer,
            voting_address,
            token_address,
        })
    }

    fn signer_for(&self, from: Address) -> Result<Arc<SignerClient>, ContractFailure> {
        let signer = self.signer.clone().ok_or(ContractFailure::NoSigner)?;
        if signer.address() != from {
            return Err(ContractFailure::Rejected(format!(
                "attached signer {:#x} cannot sign for {from:#x}",
                signer.address()
            )));
        }
        Ok(signer)
    }

    fn decode(&self, log: &Log) -> Option<ContractEvent> {
        if log.address != self.voting_address {
            return None;
        }
        let decoded = match VotingSystemEvents::decode_log(&RawLog::from(log.clone())) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("skipping undecodable voting log: {e}");
                return None;
            }
        };
        match contract_event(decoded) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("skipping voting log with out-of-range field: {e}");
                None
            }
        }
    }
}

fn contract_event(decoded: VotingSystemEvents) -> Result<ContractEvent, ContractFailure> {
    Ok(match decoded {
        VotingSystemEvents::EventCreatedFilter(e) => ContractEvent::EventCreated {
            event_id: to_u64(e.event_id, "eventId")?,
            name: e.name,
            creator: e.creator,
        },
        VotingSystemEvents::CandidateAddedFilter(e) => ContractEvent::CandidateAdded {
            event_id: to_u64(e.event_id, "eventId")?,
            candidate_id: to_u64(e.candidate_id, "candidateId")?,
            name: e.name,
        },
        VotingSystemEvents::VoteCommittedFilter(e) => ContractEvent::VoteCommitted {
            event_id: to_u64(e.event_id, "eventId")?,
            voter: e.voter,
        },
        VotingSystemEvents::VoteRevealedFilter(e) => ContractEvent::VoteRevealed {
            event_id: to_u64(e.event_id, "eventId")?,
            voter: e.voter,
            candidate_id: to_u64(e.candidate_id, "candidateId")?,
        },
    })
}

fn contract_failure<M: Middleware>(err: ContractError<M>) -> ContractFailure {
    if let Some(reason) = err.decode_revert::<String>() {
        return ContractFailure::Reverted(reason);
    }
    if err.is_revert() {
        return ContractFailure::Reverted(err.to_string());
    }
    match err {
        ContractError::ProviderError { e } => ContractFailure::Unreachable(e.to_string()),
        ContractError::MiddlewareError { e } => {
            let message = e.to_string();
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("rejected") || lowered.contains("denied") {
                ContractFailure::Rejected(message)
            } else {
                ContractFailure::Unreachable(message)
            }
        }
        other => ContractFailure::Malformed(other.to_string()),
    }
}

async fn submit<D: Detokenize>(
    call: ContractCall<SignerClient, D>,
) -> Result<TxHash, ContractFailure> {
    let pending = call.send().await.map_err(contract_failure)?;
    Ok(*pending)
}

#[async_trait]
impl VotingContract for EvmContract {
    async fn get_event(&self, event_id: u64) -> Result<RawEvent, ContractFailure> {
        let (
            id,
            name,
            description,
            creator,
            start_time,
            end_time,
            reveal_deadline,
            is_active,
            total_votes,
            candidate_ids,
        ) = self
            .voting
            .get_event(U256::from(event_id))
            .call()
            .await
            .map_err(contract_failure)?;
        Ok(RawEvent {
            id,
            name,
            description,
            creator,
            start_time,
            end_time,
            reveal_deadline,
            is_active,
            total_votes,
            candidate_ids,
        })
    }

    async fn get_event_candidates(
        &self,
        event_id: u64,
    ) -> Result<Vec<RawCandidate>, ContractFailure> {
        let rows = self
            .voting
            .get_event_candidates(U256::from(event_id))
            .call()
            .await
            .map_err(contract_failure)?;
        Ok(rows
            .into_iter()
            .map(|(id, name, event_id, vote_count, exists)| RawCandidate {
                id,
                name,
                event_id,
                vote_count,
                exists,
            })
            .collect())
    }

    async fn get_winner(&self, event_id: u64) -> Result<RawWinner, ContractFailure> {
        let (winner_id, winner_name, winner_votes, total_votes) = self
            .voting
            .get_winner(U256::from(event_id))
            .call()
            .await
            .map_err(contract_failure)?;
        Ok(RawWinner {
            winner_id,
            winner_name,
            winner_votes,
            total_votes,
        })
    }

    async fn vote_token_cost(&self) -> Result<U256, ContractFailure> {
        self.voting
            .vote_token_cost()
            .call()
            .await
            .map_err(contract_failure)
    }

    async fn has_committed(&self, voter: Address, event_id: u64) -> Result<bool, ContractFailure> {
        self.voting
            .has_committed(voter, U256::from(event_id))
            .call()
            .await
            .map_err(contract_failure)
    }

    async fn has_revealed(&self, voter: Address, event_id: u64) -> Result<bool, ContractFailure> {
        self.voting
            .has_revealed(voter, U256::from(event_id))
            .call()
            .await
            .map_err(contract_failure)
    }

    async fn balance_of(&self, owner: Address) -> Result<U256, ContractFailure> {
        self.token
            .balance_of(owner)
            .call()
            .await
            .map_err(contract_failure)
    }

    async fn allowance(&self, owner: Address) -> Result<U256, ContractFailure> {
        self.token
            .allowance(owner, self.voting_address)
            .call()
            .await
            .map_err(contract_failure)
    }

    async fn approve(&self, from: Address, amount: U256) -> Result<TxHash, ContractFailure> {
        let token = VoteToken::new(self.token_address, self.signer_for(from)?);
        submit(token.approve(self.voting_address, amount)).await
    }

    async fn commit_vote(
        &self,
        from: Address,
        event_id: u64,
        commit_hash: [u8; 32],
    ) -> Result<TxHash, ContractFailure> {
        let voting = VotingSystem::new(self.voting_address, self.signer_for(from)?);
        submit(voting.commit_vote(U256::from(event_id), commit_hash)).await
    }

    async fn reveal_vote(
        &self,
        from: Address,
        event_id: u64,
        candidate_id: u64,
        secret: [u8; 32],
    ) -> Result<TxHash, ContractFailure> {
        let voting = VotingSystem::new(self.voting_address, self.signer_for(from)?);
        submit(voting.reveal_vote(U256::from(event_id), U256::from(candidate_id), secret)).await
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
        let voting = VotingSystem::new(self.voting_address, self.signer_for(from)?);
        submit(voting.create_event(
            name.to_string(),
            description.to_string(),
            U256::from(start_time),
            U256::from(end_time),
            U256::from(reveal_duration),
        ))
        .await
    }

    async fn add_candidates(
        &self,
        from: Address,
        event_id: u64,
        names: &[String],
    ) -> Result<TxHash, ContractFailure> {
        let voting = VotingSystem::new(self.voting_address, self.signer_for(from)?);
        submit(voting.add_candidates(U256::from(event_id), names.to_vec())).await
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ContractFailure> {
        let receipt = PendingTransaction::new(tx_hash, &self.provider)
            .confirmations(1)
            .await
            .map_err(|e| ContractFailure::Unreachable(e.to_string()))?
            .ok_or_else(|| ContractFailure::Dropped(format!("{tx_hash:#x}")))?;

        let block_number = receipt
            .block_number
            .map(|n| n.as_u64())
            .ok_or_else(|| ContractFailure::Malformed("receipt without block number".into()))?;
        // Pre-Byzantium receipts carry no status field.
        let success = receipt.status.map_or(true, |s| s.as_u64() == 1);
        let events = receipt.logs.iter().filter_map(|l| self.decode(l)).collect();

        Ok(TxReceipt {
            tx_hash,
            block_number,
            success,
            events,
        })
    }

    async fn latest_block(&self) -> Result<u64, ContractFailure> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ContractFailure::Unreachable(e.to_string()))
    }

    async fn logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LoggedEvent>, ContractFailure> {
        let filter = Filter::new()
            .address(self.voting_address)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ContractFailure::Unreachable(e.to_string()))?;

        Ok(logs
            .iter()
            .filter_map(|log| {
                let block_number = log.block_number?.as_u64();
                let tx_hash = log.transaction_hash?;
                self.decode(log).map(|event| LoggedEvent {
                    block_number,
                    tx_hash,
                    event,
                })
            })
            .collect())
    }
}
