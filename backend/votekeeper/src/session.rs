//! Vote session orchestration.
//!
//! A [`VoteSession`] drives one voter through commit and reveal for one
//! event:
//!
//! ```text
//!   Idle ──commit──▶ Committing ──ok──▶ Committed ──reveal──▶ Revealing ──ok──▶ Revealed
//!     │                  │ err                                    │ err
//!     │                  ▼                                        ▼
//!     │                 Idle                                  Committed
//!     └─no wallet─▶ Blocked ──connected──▶ (continues)
//! ```
//!
//! At most one transaction is in flight per session; a second action while
//! one is pending fails with [`SessionError::ActionPending`] instead of
//! queueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ethers::types::{Address, U256};
use ethers::utils::format_ether;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::chain::ChainGateway;
use crate::codec::{compute_commitment, generate_secret, normalize_secret, Secret};
use crate::errors::{GatewayError, SessionError};
use crate::phase::{Phase, PhaseWatcher};
use crate::reconcile::{Reconciler, RefreshPolicy, Tally, TallyEntry, TallySource};
use crate::types::{address_hex, tx_hash_hex, CommitState, TxReceipt, VotingEvent};
use crate::vault::SecretVault;
use crate::wallet::Wallet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Blocked,
    Committing,
    Committed,
    Revealing,
    Revealed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// `None` waits for confirmations indefinitely.
    pub confirmation_timeout: Option<Duration>,
    pub refresh: RefreshPolicy,
    pub phase_poll: Duration,
}

/// Shared handles every session needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub gateway: Arc<ChainGateway>,
    pub vault: Arc<dyn SecretVault>,
    pub reconciler: Arc<Reconciler>,
    pub wallet: Arc<dyn Wallet>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub tx_hash: String,
    pub block_number: u64,
    pub commitment: String,
    /// Returned to the local caller for backup; never sent to the ledger.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealOutcome {
    pub tx_hash: String,
    pub block_number: u64,
    pub candidate_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelView {
    pub event_id: u64,
    pub event: Option<VotingEvent>,
    pub phase: Option<Phase>,
    pub state: SessionState,
    pub wallet: Option<String>,
    pub commit_state: CommitState,
    pub vote_cost: String,
    pub balance: Option<String>,
    pub has_stored_secret: bool,
    pub action: &'static str,
    pub tally: Tally,
}

/// Label of the panel's primary action button.
pub fn action_label(phase: Option<Phase>, is_active: bool, status: CommitState) -> &'static str {
    match phase {
        Some(Phase::CommitPhase) if !is_active => "Locked",
        Some(Phase::CommitPhase) if status.has_committed => "Voted",
        Some(Phase::CommitPhase) => "Vote",
        Some(Phase::RevealPhase) if !status.has_committed => "Need Vote",
        Some(Phase::RevealPhase) if status.has_revealed => "Revealed",
        Some(Phase::RevealPhase) => "Reveal Vote",
        _ => "Closed",
    }
}

/// VOTE amount with 18 decimals.
pub fn format_token(amount: u128) -> String {
    format_ether(U256::from(amount))
}

/// Connect `wallet` if it is not connected yet.
pub async fn connect_wallet(wallet: &dyn Wallet) -> Result<Address, SessionError> {
    if let Some(address) = wallet.address() {
        return Ok(address);
    }
    wallet
        .connect()
        .await
        .map_err(SessionError::AuthenticationRequired)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight flag when the action resolves, however it resolves.
struct PendingGuard<'a>(&'a AtomicBool);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct VoteSession {
    deps: SessionDeps,
    event_id: u64,
    state: Mutex<SessionState>,
    pending: AtomicBool,
    tally: Arc<Mutex<Tally>>,
    watcher: Mutex<Option<PhaseWatcher>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl VoteSession {
    pub fn new(deps: SessionDeps, event_id: u64) -> Self {
        Self {
            deps,
            event_id,
            state: Mutex::new(SessionState::Idle),
            pending: AtomicBool::new(false),
            tally: Arc::new(Mutex::new(Tally::default())),
            watcher: Mutex::new(None),
            refresh: Mutex::new(None),
        }
    }

    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    pub fn tally(&self) -> Tally {
        lock(&self.tally).clone()
    }

    fn begin(&self) -> Result<PendingGuard<'_>, SessionError> {
        self.pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SessionError::ActionPending)?;
        Ok(PendingGuard(&self.pending))
    }

    /// Load chain-side state: phase watcher, commit status and tally.
    pub async fn hydrate(&self) {
        let gateway = &self.deps.gateway;
        if let Some(event) = gateway.fetch_event(self.event_id).await {
            let watcher =
                PhaseWatcher::spawn(event.schedule, gateway.clock(), self.deps.settings.phase_poll);
            *lock(&self.watcher) = Some(watcher);
        }
        // Chain state is public, so a configured but unconnected key counts.
        if let Some(voter) = self.deps.wallet.known_address() {
            let status = gateway.fetch_commit_state(voter, self.event_id).await;
            self.absorb(status);
        }
        self.refresh_tally().await;
    }

    /// Move forward to match what the chain says this voter already did.
    fn absorb(&self, status: CommitState) {
        let mut state = lock(&self.state);
        *state = match *state {
            SessionState::Idle | SessionState::Blocked | SessionState::Committed
                if status.has_revealed =>
            {
                SessionState::Revealed
            }
            SessionState::Idle | SessionState::Blocked if status.has_committed => {
                SessionState::Committed
            }
            current => current,
        };
    }

    async fn ensure_wallet(&self) -> Result<Address, SessionError> {
        if let Some(address) = self.deps.wallet.address() {
            return Ok(address);
        }
        let previous = self.state();
        self.set_state(SessionState::Blocked);
        let address = connect_wallet(self.deps.wallet.as_ref()).await?;
        self.set_state(previous);
        Ok(address)
    }

    // ─────────────────────────────────────────────────────────
    // Commit
    // ─────────────────────────────────────────────────────────

    pub async fn commit(&self, candidate_id: u64) -> Result<CommitOutcome, SessionError> {
        let _guard = self.begin()?;
        let gateway = &self.deps.gateway;

        let event = gateway
            .try_fetch_event(self.event_id)
            .await
            .map_err(GatewayError::in_write_path)?;
        let phase = event.phase_at(gateway.now());
        if phase != Phase::CommitPhase || !event.is_active {
            return Err(SessionError::CommitPhaseClosed {
                phase,
                active: event.is_active,
            });
        }
        if matches!(
            self.state(),
            SessionState::Committed | SessionState::Revealing | SessionState::Revealed
        ) {
            return Err(GatewayError::AlreadyCommitted.into());
        }
        if !event.candidate_ids.contains(&candidate_id) {
            return Err(GatewayError::UnknownCandidate {
                event_id: self.event_id,
                candidate_id,
            }
            .into());
        }

        let voter = self.ensure_wallet().await?;
        self.set_state(SessionState::Committing);
        match self.run_commit(voter, candidate_id).await {
            Ok(outcome) => {
                self.set_state(SessionState::Committed);
                Ok(outcome)
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn run_commit(
        &self,
        voter: Address,
        candidate_id: u64,
    ) -> Result<CommitOutcome, SessionError> {
        let gateway = &self.deps.gateway;
        let timeout = self.deps.settings.confirmation_timeout;

        // Nothing is approved for a commit the chain would refuse anyway.
        gateway
            .check_commit_window(voter, self.event_id)
            .await
            .map_err(GatewayError::in_write_path)?;

        let required = gateway
            .try_fetch_vote_cost()
            .await
            .map_err(GatewayError::in_write_path)?;
        let balance = gateway
            .try_fetch_balance(voter)
            .await
            .map_err(GatewayError::in_write_path)?;
        if balance < required {
            return Err(GatewayError::InsufficientBalance { balance, required }.into());
        }
        let allowance = gateway
            .try_fetch_allowance(voter)
            .await
            .map_err(GatewayError::in_write_path)?;
        if allowance < required {
            info!("allowance {allowance} below vote cost {required}; approving");
            let approval = gateway.submit_approval(voter, required).await?;
            gateway.confirm(&approval, timeout).await?;
        }

        // A secret left behind by a timed-out commit may match a commitment
        // that landed later.
        let secret = match self.deps.vault.load(self.event_id).await {
            Some(stored) => {
                info!("reusing stored secret for event {}", self.event_id);
                stored
            }
            None => generate_secret(),
        };
        let tx = gateway
            .submit_commit(voter, self.event_id, candidate_id, &secret)
            .await?;
        let receipt = match gateway.confirm(&tx, timeout).await {
            Ok(receipt) => receipt,
            Err(e @ GatewayError::ConfirmationTimeout { .. }) => {
                // The commitment may still land; without the secret it
                // could never be revealed.
                self.deps.vault.persist(self.event_id, &secret).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        self.deps.vault.persist(self.event_id, &secret).await;

        let voter_id = address_hex(&voter);
        let tx_hash = tx_hash_hex(&tx.tx_hash);
        if let Err(e) = self
            .deps
            .reconciler
            .record_vote_attempt(&voter_id, self.event_id, candidate_id, &tx_hash)
            .await
        {
            warn!("vote for event {} not mirrored to ledger: {e}", self.event_id);
        }

        info!("commit confirmed for event {} ({tx_hash})", self.event_id);
        Ok(CommitOutcome {
            tx_hash,
            block_number: receipt.block_number,
            commitment: compute_commitment(candidate_id, &secret).to_hex(),
            secret: secret.to_hex(),
        })
    }

    // ─────────────────────────────────────────────────────────
    // Reveal
    // ─────────────────────────────────────────────────────────

    /// Reveal `candidate_id`. A non-blank `manual_secret` takes precedence
    /// over the stored one and is normalized first.
    pub async fn reveal(
        &self,
        candidate_id: u64,
        manual_secret: Option<&str>,
    ) -> Result<RevealOutcome, SessionError> {
        let _guard = self.begin()?;
        let gateway = &self.deps.gateway;

        if self.state() == SessionState::Revealed {
            return Err(GatewayError::AlreadyRevealed.into());
        }
        let event = gateway
            .try_fetch_event(self.event_id)
            .await
            .map_err(GatewayError::in_write_path)?;
        let phase = event.phase_at(gateway.now());
        if phase != Phase::RevealPhase {
            return Err(SessionError::RevealPhaseNotOpen { phase });
        }

        let secret = match manual_secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(input) => normalize_secret(input),
            None => self
                .deps
                .vault
                .load(self.event_id)
                .await
                .ok_or(SessionError::SecretMissing)?,
        };

        let voter = self.ensure_wallet().await?;
        let previous = self.state();
        self.set_state(SessionState::Revealing);
        match self.run_reveal(voter, candidate_id, &secret).await {
            Ok(receipt) => {
                self.deps.vault.clear(self.event_id).await;
                self.set_state(SessionState::Revealed);
                let expected = self.apply_optimistic(candidate_id);
                self.schedule_refresh(candidate_id, expected);
                Ok(RevealOutcome {
                    tx_hash: tx_hash_hex(&receipt.tx_hash),
                    block_number: receipt.block_number,
                    candidate_id,
                })
            }
            Err(e) => {
                self.set_state(previous);
                Err(e)
            }
        }
    }

    async fn run_reveal(
        &self,
        voter: Address,
        candidate_id: u64,
        secret: &Secret,
    ) -> Result<TxReceipt, SessionError> {
        let gateway = &self.deps.gateway;
        let tx = gateway
            .submit_reveal(voter, self.event_id, candidate_id, secret)
            .await?;
        let receipt = gateway
            .confirm(&tx, self.deps.settings.confirmation_timeout)
            .await?;
        info!(
            "reveal confirmed for event {} ({})",
            self.event_id,
            tx_hash_hex(&tx.tx_hash)
        );
        Ok(receipt)
    }

    /// Bump the displayed count for `candidate_id`; returns the new count.
    fn apply_optimistic(&self, candidate_id: u64) -> u64 {
        let mut tally = lock(&self.tally);
        let expected = match tally
            .entries
            .iter_mut()
            .find(|e| e.candidate_id == candidate_id)
        {
            Some(entry) => {
                entry.votes += 1;
                entry.source = TallySource::Optimistic;
                entry.votes
            }
            None => {
                tally.entries.push(TallyEntry {
                    candidate_id,
                    name: String::new(),
                    votes: 1,
                    source: TallySource::Optimistic,
                });
                1
            }
        };
        tally.total_votes += 1;
        tally.total_source = TallySource::Optimistic;
        expected
    }

    fn schedule_refresh(&self, candidate_id: u64, expected: u64) {
        let reconciler = self.deps.reconciler.clone();
        let tally = self.tally.clone();
        let policy = self.deps.settings.refresh;
        let event_id = self.event_id;

        let handle = tokio::spawn(async move {
            if reconciler
                .await_chain_tally(event_id, candidate_id, expected, policy)
                .await
                .is_none()
            {
                return;
            }
            let current = lock(&tally).clone();
            let fresh = reconciler.reconcile(event_id, &current).await;
            *lock(&tally) = fresh;
        });
        if let Some(previous) = lock(&self.refresh).replace(handle) {
            previous.abort();
        }
    }

    /// Wait for a pending post-reveal refresh, if any.
    pub async fn settle_refresh(&self) {
        let handle = lock(&self.refresh).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ─────────────────────────────────────────────────────────
    // Display and housekeeping
    // ─────────────────────────────────────────────────────────

    pub async fn refresh_tally(&self) -> Tally {
        let current = self.tally();
        let fresh = self
            .deps
            .reconciler
            .reconcile(self.event_id, &current)
            .await;
        *lock(&self.tally) = fresh.clone();
        fresh
    }

    pub async fn panel(&self) -> PanelView {
        let gateway = &self.deps.gateway;
        let event = gateway.fetch_event(self.event_id).await;
        // The watcher only covers reads that failed; a fresh event wins.
        let watched = lock(&self.watcher).as_ref().map(PhaseWatcher::current);
        let phase = event
            .as_ref()
            .map(|e| e.phase_at(gateway.now()))
            .or(watched);

        let voter = self.deps.wallet.address();
        let (commit_state, balance) = match voter {
            Some(voter) => {
                let status = gateway.fetch_commit_state(voter, self.event_id).await;
                self.absorb(status);
                let balance = gateway.fetch_balance(voter).await;
                (status, Some(format_token(balance)))
            }
            None => (CommitState::default(), None),
        };

        let state = self.state();
        let status = CommitState {
            has_committed: commit_state.has_committed
                || matches!(
                    state,
                    SessionState::Committed | SessionState::Revealing | SessionState::Revealed
                ),
            has_revealed: commit_state.has_revealed || state == SessionState::Revealed,
        };
        let is_active = event.as_ref().map_or(false, |e| e.is_active);

        let mut tally = self.tally();
        if tally.entries.is_empty() {
            tally = self.refresh_tally().await;
        }
        tally
            .entries
            .sort_by(|a, b| b.votes.cmp(&a.votes).then(a.candidate_id.cmp(&b.candidate_id)));

        PanelView {
            event_id: self.event_id,
            phase,
            state,
            wallet: voter.map(|v| address_hex(&v)),
            commit_state: status,
            vote_cost: format_token(gateway.fetch_vote_cost().await),
            balance,
            has_stored_secret: self.deps.vault.load(self.event_id).await.is_some(),
            action: action_label(phase, is_active, status),
            tally,
            event,
        }
    }

    /// True once the phase watcher has seen the event end.
    pub fn has_ended(&self) -> bool {
        lock(&self.watcher)
            .as_ref()
            .map_or(false, |w| w.current() == Phase::Ended)
    }

    /// Back to `Idle`; chain state is untouched and is picked up again by the
    /// next panel read.
    pub fn reset(&self) {
        self.set_state(SessionState::Idle);
    }

    /// Forget the stored secret for this event.
    pub async fn wipe_secret(&self) {
        self.deps.vault.clear(self.event_id).await;
        info!("stored secret for event {} wiped", self.event_id);
    }
}

impl Drop for VoteSession {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.refresh).take() {
            handle.abort();
        }
    }
}

/// Open sessions by event id.
pub struct Sessions {
    deps: SessionDeps,
    open: Mutex<HashMap<u64, Arc<VoteSession>>>,
}

impl Sessions {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.deps
    }

    /// Existing session for `event_id`, or a freshly hydrated one. Unknown
    /// events are refused; sessions whose event has ended are dropped.
    pub async fn open(&self, event_id: u64) -> Result<Arc<VoteSession>, SessionError> {
        let existing = {
            let mut open = lock(&self.open);
            open.retain(|_, session| !session.has_ended());
            open.get(&event_id).cloned()
        };
        if let Some(session) = existing {
            return Ok(session);
        }

        let session = Arc::new(VoteSession::new(self.deps.clone(), event_id));
        match self.deps.gateway.try_fetch_event(event_id).await {
            Ok(_) => {}
            Err(e @ GatewayError::EventNotFound(_)) => return Err(e.into()),
            Err(e) => {
                // Not cached: the caller's own chain read reports the failure.
                warn!("event {event_id} unreadable while opening a session: {e}");
                return Ok(session);
            }
        }
        session.hydrate().await;
        Ok(lock(&self.open)
            .entry(event_id)
            .or_insert(session)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::dev::{DevChain, ONE_TOKEN};
    use crate::chain::VotingContract;
    use crate::clock::ManualClock;
    use crate::db;
    use crate::ledger::SqliteLedger;
    use crate::types::EventDraft;
    use crate::vault::MemoryVault;
    use crate::wallet::KeyWallet;

    const T: u64 = 1_700_000_000;
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    struct Fixture {
        clock: Arc<ManualClock>,
        chain: Arc<DevChain>,
        vault: Arc<MemoryVault>,
        pool: sqlx::SqlitePool,
        voter: Address,
        session: Arc<VoteSession>,
    }

    /// Event 1: commit `[T, T+3600]`, reveal until `T+7200`, candidates 1
    /// and 2. The voter key is configured but the wallet starts disconnected.
    async fn fixture_with_key(key: Option<&str>) -> Fixture {
        let clock = Arc::new(ManualClock::new(T - 100));
        let chain = Arc::new(DevChain::new(clock.clone(), ONE_TOKEN));
        let gateway = Arc::new(ChainGateway::new(chain.clone(), clock.clone()));
        let creator = Address::repeat_byte(1);
        let draft = EventDraft {
            name: "Council".into(),
            description: String::new(),
            start_time: T,
            end_time: T + 3600,
            reveal_duration: Some(3600),
        };
        gateway.create_event(creator, &draft, None).await.unwrap();
        gateway
            .add_candidates(creator, 1, &["Ada".into(), "Grace".into()], None)
            .await
            .unwrap();

        let pool = db::memory_pool().await;
        let ledger = Arc::new(SqliteLedger::new(pool.clone()));
        let reconciler = Arc::new(Reconciler::new(gateway.clone(), ledger));
        let wallet = Arc::new(KeyWallet::from_key(key).unwrap());
        let voter = wallet.configured_address().unwrap_or_default();
        let vault = Arc::new(MemoryVault::new("voter"));

        let deps = SessionDeps {
            gateway,
            vault: vault.clone(),
            reconciler,
            wallet,
            settings: SessionSettings {
                confirmation_timeout: Some(Duration::from_millis(300)),
                refresh: RefreshPolicy {
                    max_attempts: 4,
                    initial_delay: Duration::from_millis(5),
                },
                phase_poll: Duration::from_secs(15),
            },
        };
        let session = Arc::new(VoteSession::new(deps, 1));
        session.hydrate().await;

        Fixture {
            clock,
            chain,
            vault,
            pool,
            voter,
            session,
        }
    }

    async fn fixture() -> Fixture {
        let f = fixture_with_key(Some(DEV_KEY)).await;
        f.chain.credit(f.voter, ONE_TOKEN);
        f
    }

    #[test]
    fn action_labels_follow_phase_and_status() {
        let none = CommitState::default();
        let committed = CommitState {
            has_committed: true,
            has_revealed: false,
        };
        let revealed = CommitState {
            has_committed: true,
            has_revealed: true,
        };
        assert_eq!(action_label(Some(Phase::CommitPhase), true, none), "Vote");
        assert_eq!(action_label(Some(Phase::CommitPhase), true, committed), "Voted");
        assert_eq!(action_label(Some(Phase::CommitPhase), false, none), "Locked");
        assert_eq!(action_label(Some(Phase::RevealPhase), true, none), "Need Vote");
        assert_eq!(action_label(Some(Phase::RevealPhase), true, committed), "Reveal Vote");
        assert_eq!(action_label(Some(Phase::RevealPhase), true, revealed), "Revealed");
        assert_eq!(action_label(Some(Phase::Ended), true, revealed), "Closed");
        assert_eq!(action_label(None, false, none), "Closed");
    }

    #[test]
    fn token_amounts_use_18_decimals() {
        assert_eq!(format_token(ONE_TOKEN), "1.000000000000000000");
        assert_eq!(format_token(ONE_TOKEN / 2), "0.500000000000000000");
    }

    #[tokio::test]
    async fn commit_without_key_is_blocked() {
        let f = fixture_with_key(None).await;
        f.clock.set(T + 1800);

        let err = f.session.commit(1).await.unwrap_err();
        assert!(matches!(err, SessionError::AuthenticationRequired(_)));
        assert_eq!(f.session.state(), SessionState::Blocked);

        f.session.reset();
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn commit_approves_stores_secret_and_mirrors_vote() {
        let f = fixture().await;
        f.clock.set(T + 1800);

        let outcome = f.session.commit(2).await.unwrap();
        assert_eq!(f.session.state(), SessionState::Committed);
        assert_eq!(f.chain.commitment_count(1), 1);
        assert_eq!(f.chain.balance_of(f.voter).await.unwrap(), U256::zero());

        let stored = f.vault.load(1).await.unwrap();
        assert_eq!(stored.to_hex(), outcome.secret);
        assert_eq!(compute_commitment(2, &stored).to_hex(), outcome.commitment);

        let votes = db::get_votes_for_event(&f.pool, 1).await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].voter_id, address_hex(&f.voter));
        assert_eq!(votes[0].block_address, outcome.tx_hash);
    }

    #[tokio::test]
    async fn commit_outside_window_touches_nothing() {
        let f = fixture().await;
        for now in [T - 10, T + 5000, T + 7300] {
            f.clock.set(now);
            let err = f.session.commit(1).await.unwrap_err();
            assert!(matches!(err, SessionError::CommitPhaseClosed { .. }));
        }
        assert_eq!(f.chain.commitment_count(1), 0);
        assert!(f.vault.load(1).await.is_none());
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn paused_event_reports_inactive() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.chain.set_event_active(1, false);
        assert_eq!(
            f.session.commit(1).await.unwrap_err(),
            SessionError::CommitPhaseClosed {
                phase: Phase::CommitPhase,
                active: false
            }
        );
    }

    #[tokio::test]
    async fn commit_for_unknown_candidate_is_rejected() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        let err = f.session.commit(9).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Gateway(GatewayError::UnknownCandidate { candidate_id: 9, .. })
        ));
    }

    #[tokio::test]
    async fn insufficient_balance_returns_to_idle() {
        let f = fixture_with_key(Some(DEV_KEY)).await;
        f.clock.set(T + 1800);
        let err = f.session.commit(1).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Gateway(GatewayError::InsufficientBalance { .. })
        ));
        assert_eq!(f.session.state(), SessionState::Idle);
        assert_eq!(f.chain.commitment_count(1), 0);
    }

    #[tokio::test]
    async fn second_action_while_pending_is_rejected() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.chain.hold_confirmations(true);

        let session = f.session.clone();
        let first = tokio::spawn(async move { session.commit(1).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.session.commit(2).await.unwrap_err(), SessionError::ActionPending);
        f.chain.hold_confirmations(false);
        // The approval was held; the commit itself still needs to land.
        let outcome = first.await.unwrap();
        assert!(outcome.is_ok(), "{outcome:?}");
        assert_eq!(f.chain.commitment_count(1), 1);
    }

    #[tokio::test]
    async fn confirmation_timeout_keeps_secret_and_frees_session() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        // Approve up front so only the commit is held.
        let approval = f
            .session
            .deps
            .gateway
            .submit_approval(f.voter, ONE_TOKEN)
            .await
            .unwrap();
        f.session.deps.gateway.confirm(&approval, None).await.unwrap();
        f.chain.hold_confirmations(true);

        let err = f.session.commit(1).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Gateway(GatewayError::ConfirmationTimeout { .. })
        ));
        assert_eq!(f.session.state(), SessionState::Idle);
        assert!(f.vault.load(1).await.is_some());

        // Not stuck in flight.
        f.chain.hold_confirmations(false);
        f.session.hydrate().await;
        assert_eq!(f.session.state(), SessionState::Committed);
    }

    #[tokio::test]
    async fn reveal_uses_stored_secret_then_refreshes_from_chain() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.session.commit(2).await.unwrap();

        f.clock.set(T + 5000);
        let outcome = f.session.reveal(2, None).await.unwrap();
        assert_eq!(outcome.candidate_id, 2);
        assert_eq!(f.session.state(), SessionState::Revealed);
        assert!(f.vault.load(1).await.is_none());

        let optimistic = f.session.tally();
        let entry = optimistic.entries.iter().find(|e| e.candidate_id == 2).unwrap();
        assert_eq!(entry.votes, 1);
        assert_eq!(entry.source, TallySource::Optimistic);

        f.session.settle_refresh().await;
        let settled = f.session.tally();
        let entry = settled.entries.iter().find(|e| e.candidate_id == 2).unwrap();
        assert_eq!(entry.votes, 1);
        assert_eq!(entry.source, TallySource::Chain);
        assert_eq!(settled.total_votes, 1);

        let err = f.session.reveal(2, None).await.unwrap_err();
        assert_eq!(err, SessionError::Gateway(GatewayError::AlreadyRevealed));
    }

    #[tokio::test]
    async fn reveal_needs_a_secret_from_somewhere() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        let outcome = f.session.commit(1).await.unwrap();
        f.session.wipe_secret().await;

        f.clock.set(T + 5000);
        assert_eq!(
            f.session.reveal(1, None).await.unwrap_err(),
            SessionError::SecretMissing
        );
        assert_eq!(
            f.session.reveal(1, Some("   ")).await.unwrap_err(),
            SessionError::SecretMissing
        );
        f.session.reveal(1, Some(&outcome.secret)).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_candidate_keeps_commitment_revealable() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.session.commit(2).await.unwrap();

        f.clock.set(T + 5000);
        let err = f.session.reveal(1, None).await.unwrap_err();
        assert_eq!(err, SessionError::Gateway(GatewayError::HashMismatch));
        assert_eq!(f.session.state(), SessionState::Committed);
        assert!(f.vault.load(1).await.is_some());

        f.session.reveal(2, None).await.unwrap();
    }

    #[tokio::test]
    async fn reveal_outside_window_is_not_open() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.session.commit(1).await.unwrap();

        assert_eq!(
            f.session.reveal(1, None).await.unwrap_err(),
            SessionError::RevealPhaseNotOpen {
                phase: Phase::CommitPhase
            }
        );
        f.clock.set(T + 7300);
        assert_eq!(
            f.session.reveal(1, None).await.unwrap_err(),
            SessionError::RevealPhaseNotOpen { phase: Phase::Ended }
        );
    }

    #[tokio::test]
    async fn panel_reflects_progress() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        let panel = f.session.panel().await;
        assert_eq!(panel.wallet, None);
        assert_eq!(panel.vote_cost, "1.000000000000000000");
        assert_eq!(panel.tally.entries.len(), 2);

        f.session.commit(1).await.unwrap();
        let panel = f.session.panel().await;
        assert_eq!(panel.action, "Voted");
        assert!(panel.has_stored_secret);
        assert_eq!(panel.balance.as_deref(), Some("0.000000000000000000"));
    }

    #[tokio::test]
    async fn retry_after_landed_commit_spends_nothing() {
        let f = fixture().await;
        f.chain.credit(f.voter, ONE_TOKEN);
        f.clock.set(T + 1800);
        f.session.commit(1).await.unwrap();
        f.session.reset();

        let block = f.chain.latest_block().await.unwrap();
        let allowance = f.chain.allowance(f.voter).await.unwrap();
        assert_eq!(
            f.session.commit(1).await.unwrap_err(),
            SessionError::Gateway(GatewayError::AlreadyCommitted)
        );
        assert_eq!(f.chain.latest_block().await.unwrap(), block);
        assert_eq!(f.chain.allowance(f.voter).await.unwrap(), allowance);
        assert_eq!(f.chain.commitment_count(1), 1);
    }

    #[tokio::test]
    async fn timed_out_commit_stays_revealable() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        let approval = f
            .session
            .deps
            .gateway
            .submit_approval(f.voter, ONE_TOKEN)
            .await
            .unwrap();
        f.session.deps.gateway.confirm(&approval, None).await.unwrap();
        f.chain.hold_confirmations(true);

        f.session.commit(2).await.unwrap_err();
        let stored = f.vault.load(1).await.unwrap();
        f.chain.hold_confirmations(false);

        // The commitment landed; a retry must not replace its secret.
        assert_eq!(
            f.session.commit(2).await.unwrap_err(),
            SessionError::Gateway(GatewayError::AlreadyCommitted)
        );
        assert_eq!(f.vault.load(1).await.unwrap(), stored);

        f.clock.set(T + 5000);
        f.session.reveal(2, None).await.unwrap();
    }

    #[tokio::test]
    async fn commit_reuses_stored_secret() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        let kept = normalize_secret("kept");
        f.vault.persist(1, &kept).await;

        let outcome = f.session.commit(2).await.unwrap();
        assert_eq!(outcome.secret, kept.to_hex());
        assert_eq!(outcome.commitment, compute_commitment(2, &kept).to_hex());
    }

    #[tokio::test]
    async fn unreachable_chain_fails_actions_as_transactions() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.chain.set_offline(true);
        assert!(matches!(
            f.session.commit(1).await.unwrap_err(),
            SessionError::Gateway(GatewayError::TransactionFailed(_))
        ));
        assert!(matches!(
            f.session.reveal(1, Some("abc")).await.unwrap_err(),
            SessionError::Gateway(GatewayError::TransactionFailed(_))
        ));
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn hydrate_finds_commit_without_connecting() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        f.session.commit(1).await.unwrap();

        let wallet = Arc::new(KeyWallet::from_key(Some(DEV_KEY)).unwrap());
        let deps = SessionDeps {
            wallet: wallet.clone(),
            ..f.session.deps.clone()
        };
        let restarted = VoteSession::new(deps, 1);
        restarted.hydrate().await;
        assert_eq!(restarted.state(), SessionState::Committed);
        assert_eq!(wallet.address(), None);
    }

    #[tokio::test]
    async fn sessions_refuse_unknown_events_and_drop_ended_ones() {
        let f = fixture().await;
        f.clock.set(T + 1800);
        let mut deps = f.session.deps.clone();
        deps.settings.phase_poll = Duration::from_millis(10);
        let sessions = Sessions::new(deps);

        assert!(matches!(
            sessions.open(42).await,
            Err(SessionError::Gateway(GatewayError::EventNotFound(42)))
        ));
        assert!(lock(&sessions.open).is_empty());

        let first = sessions.open(1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &sessions.open(1).await.unwrap()));

        f.clock.set(T + 7300);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(first.has_ended());
        let reopened = sessions.open(1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
        assert_eq!(lock(&sessions.open).len(), 1);
    }
}
