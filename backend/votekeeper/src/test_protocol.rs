//! End-to-end commit-reveal runs against the in-process dev chain.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};

use crate::chain::dev::{DevChain, ONE_TOKEN};
use crate::chain::ChainGateway;
use crate::clock::{Clock, ManualClock};
use crate::codec::{compute_commitment, keccak256, normalize_secret};
use crate::db;
use crate::errors::{GatewayError, SessionError};
use crate::ledger::SqliteLedger;
use crate::phase::Phase;
use crate::reconcile::{Reconciler, RefreshPolicy, TallyEntry, TallySource};
use crate::session::{SessionDeps, SessionSettings, VoteSession};
use crate::types::EventDraft;
use crate::vault::MemoryVault;
use crate::wallet::KeyWallet;

const T: u64 = 1_700_000_000;
const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

struct Net {
    clock: Arc<ManualClock>,
    chain: Arc<DevChain>,
    gateway: Arc<ChainGateway>,
    reconciler: Arc<Reconciler>,
    pool: sqlx::SqlitePool,
}

/// Event 1 with commit window `[T, T+3600]`, reveal deadline `T+7200` and
/// candidates 1 ("Ada") and 2 ("Grace").
async fn net() -> Net {
    let clock = Arc::new(ManualClock::new(T - 60));
    let chain = Arc::new(DevChain::new(clock.clone(), ONE_TOKEN));
    let gateway = Arc::new(ChainGateway::new(chain.clone(), clock.clone()));
    let creator = Address::repeat_byte(0xC0);
    let draft = EventDraft {
        name: "Council".into(),
        description: "Seat election".into(),
        start_time: T,
        end_time: T + 3600,
        reveal_duration: Some(3600),
    };
    let created = gateway.create_event(creator, &draft, None).await.unwrap();
    assert_eq!(created.event_id, 1);
    gateway
        .add_candidates(creator, 1, &["Ada".into(), "Grace".into()], None)
        .await
        .unwrap();

    let pool = db::memory_pool().await;
    let reconciler = Arc::new(Reconciler::new(
        gateway.clone(),
        Arc::new(SqliteLedger::new(pool.clone())),
    ));
    Net {
        clock,
        chain,
        gateway,
        reconciler,
        pool,
    }
}

/// Fund `voter` and approve the vote cost.
async fn fund(net: &Net, voter: Address) {
    net.chain.credit(voter, ONE_TOKEN);
    let approval = net.gateway.submit_approval(voter, ONE_TOKEN).await.unwrap();
    net.gateway.confirm(&approval, None).await.unwrap();
}

async fn commit(net: &Net, voter: Address, candidate_id: u64, secret: &str) {
    let tx = net
        .gateway
        .submit_commit(voter, 1, candidate_id, &normalize_secret(secret))
        .await
        .unwrap();
    net.gateway.confirm(&tx, None).await.unwrap();
}

fn session(net: &Net, key: Option<&str>) -> VoteSession {
    let deps = SessionDeps {
        gateway: net.gateway.clone(),
        vault: Arc::new(MemoryVault::new("protocol")),
        reconciler: net.reconciler.clone(),
        wallet: Arc::new(KeyWallet::from_key(key).unwrap()),
        settings: SessionSettings {
            confirmation_timeout: Some(Duration::from_secs(2)),
            refresh: RefreshPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(5),
            },
            phase_poll: Duration::from_secs(15),
        },
    };
    VoteSession::new(deps, 1)
}

async fn votes_for(net: &Net, candidate_id: u64) -> u64 {
    net.gateway
        .try_fetch_candidates(1)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.id == candidate_id)
        .map(|c| c.vote_count)
        .unwrap()
}

#[tokio::test]
async fn scenario_across_all_phases() {
    let net = net().await;
    let voter_session = session(&net, Some(DEV_KEY));
    let voter = KeyWallet::from_key(Some(DEV_KEY))
        .unwrap()
        .configured_address()
        .unwrap();
    fund(&net, voter).await;

    // Commit phase.
    net.clock.set(T + 1800);
    let event = net.gateway.try_fetch_event(1).await.unwrap();
    assert_eq!(event.phase_at(net.clock.now()), Phase::CommitPhase);
    commit(&net, voter, 2, "abc").await;
    assert_eq!(net.chain.commitment_count(1), 1);

    let mut preimage = [0u8; 64];
    U256::from(2u64).to_big_endian(&mut preimage[..32]);
    preimage[32..].copy_from_slice(normalize_secret("abc").as_bytes());
    assert_eq!(compute_commitment(2, &normalize_secret("abc")).0, keccak256(&preimage));

    // Still commit phase: reveal refused before touching the chain.
    net.clock.set(T + 1900);
    let err = voter_session.reveal(2, Some("abc")).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::RevealPhaseNotOpen {
            phase: Phase::CommitPhase
        }
    );

    // Reveal phase.
    net.clock.set(T + 5000);
    let before = net.gateway.try_fetch_event(1).await.unwrap().total_votes;
    let outcome = voter_session.reveal(2, Some("abc")).await.unwrap();
    assert_eq!(outcome.candidate_id, 2);
    assert_eq!(votes_for(&net, 2).await, 1);
    assert_eq!(votes_for(&net, 1).await, 0);
    assert_eq!(
        net.gateway.try_fetch_event(1).await.unwrap().total_votes,
        before + 1
    );

    // Ended.
    net.clock.set(T + 7300);
    let late = Address::repeat_byte(0x1A);
    fund(&net, late).await;
    let err = net
        .gateway
        .submit_commit(late, 1, 1, &normalize_secret("late"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::PhaseViolation {
            required: Phase::CommitPhase
        }
    );
    let err = net
        .gateway
        .submit_reveal(voter, 1, 2, &normalize_secret("abc"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::PhaseViolation {
            required: Phase::RevealPhase
        }
    );
    let bystander = session(&net, None);
    assert_eq!(
        bystander.reveal(1, Some("abc")).await.unwrap_err(),
        SessionError::RevealPhaseNotOpen { phase: Phase::Ended }
    );
}

#[tokio::test]
async fn reveal_succeeds_exactly_once() {
    let net = net().await;
    let voter = Address::repeat_byte(0x0E);
    fund(&net, voter).await;
    net.clock.set(T + 10);
    commit(&net, voter, 1, "hunter2").await;

    net.clock.set(T + 4000);
    let state = net.gateway.try_fetch_commit_state(voter, 1).await.unwrap();
    assert!(state.has_committed && !state.has_revealed);

    let tx = net
        .gateway
        .submit_reveal(voter, 1, 1, &normalize_secret("hunter2"))
        .await
        .unwrap();
    net.gateway.confirm(&tx, None).await.unwrap();
    assert!(net.gateway.try_fetch_commit_state(voter, 1).await.unwrap().has_revealed);

    for (candidate_id, secret) in [(1, "hunter2"), (2, "other")] {
        let err = net
            .gateway
            .submit_reveal(voter, 1, candidate_id, &normalize_secret(secret))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::AlreadyRevealed);
    }
    assert_eq!(votes_for(&net, 1).await, 1);
}

#[tokio::test]
async fn mismatched_reveal_changes_nothing() {
    let net = net().await;
    let voter = Address::repeat_byte(0x0F);
    fund(&net, voter).await;
    net.clock.set(T + 10);
    commit(&net, voter, 2, "abc").await;

    net.clock.set(T + 4000);
    for (candidate_id, secret) in [(1, "abc"), (2, "abd")] {
        let err = net
            .gateway
            .submit_reveal(voter, 1, candidate_id, &normalize_secret(secret))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::HashMismatch);
    }

    assert!(!net.gateway.try_fetch_commit_state(voter, 1).await.unwrap().has_revealed);
    assert_eq!(votes_for(&net, 1).await, 0);
    assert_eq!(votes_for(&net, 2).await, 0);
    assert_eq!(net.gateway.try_fetch_event(1).await.unwrap().total_votes, 0);
}

#[tokio::test]
async fn double_commit_leaves_one_record() {
    let net = net().await;
    let voter = Address::repeat_byte(0x2B);
    net.chain.credit(voter, ONE_TOKEN);
    let approval = net
        .gateway
        .submit_approval(voter, 2 * ONE_TOKEN)
        .await
        .unwrap();
    net.gateway.confirm(&approval, None).await.unwrap();
    net.clock.set(T + 10);
    commit(&net, voter, 1, "first").await;

    let err = net
        .gateway
        .submit_commit(voter, 1, 2, &normalize_secret("second"))
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::AlreadyCommitted);
    assert_eq!(net.chain.commitment_count(1), 1);
}

#[tokio::test]
async fn unreadable_chain_falls_back_to_ledger_counts() {
    let net = net().await;
    sqlx::query(
        "INSERT INTO votes (voter_id, event_id, candidate_id, block_address) VALUES ('0xa', 1, 2, '0x1')",
    )
    .execute(&net.pool)
    .await
    .unwrap();

    let current = vec![
        TallyEntry {
            candidate_id: 1,
            name: "Ada".into(),
            votes: 4,
            source: TallySource::Chain,
        },
        TallyEntry {
            candidate_id: 2,
            name: "Grace".into(),
            votes: 0,
            source: TallySource::Chain,
        },
    ];
    net.chain.set_offline(true);
    let merged = net.reconciler.reconcile_tally(1, &current).await;

    // A readable ledger is authoritative over stale chain values.
    assert_eq!(merged[0].votes, 0);
    assert_eq!(merged[0].source, TallySource::Ledger);
    assert_eq!(merged[1].votes, 1);
    assert_eq!(merged[1].source, TallySource::Ledger);

    let fresh = net.reconciler.reconcile_tally(1, &[]).await;
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].candidate_id, 2);
    assert_eq!(fresh[0].votes, 1);
    assert_eq!(fresh[0].source, TallySource::Ledger);
}
