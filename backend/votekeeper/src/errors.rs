//! Application-wide error types.
//!
//! Each layer has its own enum: [`GatewayError`] for the chain adapter,
//! [`ReconciliationError`] for the off-chain ledger, [`WalletError`] for the
//! signer, and [`SessionError`] for the vote orchestrator. [`AppError`] covers
//! startup and infrastructure failures in the binary.

use serde::Serialize;
use thiserror::Error;

use crate::phase::Phase;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(#[from] GatewayError),
}

pub type Result<T> = std::result::Result<T, AppError>;

// ─────────────────────────────────────────────────────────
// Chain gateway
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("VOTE balance {balance} is below the vote cost {required}")]
    InsufficientBalance { balance: u128, required: u128 },

    #[error("token allowance {allowance} is below the vote cost {required}")]
    AllowanceRequired { allowance: u128, required: u128 },

    #[error("operation requires the {required} phase")]
    PhaseViolation { required: Phase },

    #[error("event {0} is not accepting commitments")]
    EventInactive(u64),

    #[error("a commitment already exists for this voter and event")]
    AlreadyCommitted,

    #[error("this commitment has already been revealed")]
    AlreadyRevealed,

    #[error("no commitment found for this voter and event")]
    NoCommitment,

    #[error("candidate and secret do not match the stored commitment")]
    HashMismatch,

    #[error("event {0} not found on chain")]
    EventNotFound(u64),

    #[error("candidate {candidate_id} does not exist in event {event_id}")]
    UnknownCandidate { event_id: u64, candidate_id: u64 },

    #[error("end time {end} must be after start time {start}")]
    InvalidSchedule { start: u64, end: u64 },

    #[error("invalid candidate list: {0}")]
    InvalidCandidates(String),

    #[error("transaction {tx_hash} confirmed but emitted no EventCreated log")]
    EventIdUnresolvable { tx_hash: String },

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("transaction {tx_hash} not confirmed after {waited_secs}s")]
    ConfirmationTimeout { tx_hash: String, waited_secs: u64 },

    #[error("no signer attached for {0}")]
    SignerRequired(String),

    #[error("chain unreachable: {0}")]
    Unreachable(String),

    #[error("malformed chain data: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// On a write path an unreachable node means the transaction failed.
    pub fn in_write_path(self) -> Self {
        match self {
            Self::Unreachable(message) => {
                Self::TransactionFailed(format!("chain unreachable: {message}"))
            }
            other => other,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Off-chain ledger
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vote already recorded for voter {voter_id} in event {event_id}")]
    Duplicate { voter_id: String, event_id: u64 },

    #[error("ledger rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

// ─────────────────────────────────────────────────────────
// Wallet
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("no signing key configured")]
    NoSigner,

    #[error("wallet refused to connect: {0}")]
    Rejected(String),
}

// ─────────────────────────────────────────────────────────
// Vote session
// ─────────────────────────────────────────────────────────

/// Coarse error classes used to pick user-facing copy and HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Authorization,
    Transaction,
    Reconciliation,
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("wallet authentication required: {0}")]
    AuthenticationRequired(WalletError),

    #[error("commit phase is closed (event is {phase}, active={active})")]
    CommitPhaseClosed { phase: Phase, active: bool },

    #[error("reveal phase is not open (event is {phase})")]
    RevealPhaseNotOpen { phase: Phase },

    #[error("no secret available for this event")]
    SecretMissing,

    #[error("another transaction for this event is still pending")]
    ActionPending,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AuthenticationRequired(_) => ErrorClass::Authorization,
            Self::CommitPhaseClosed { .. }
            | Self::RevealPhaseNotOpen { .. }
            | Self::SecretMissing
            | Self::ActionPending => ErrorClass::Validation,
            Self::Gateway(err) => match err {
                GatewayError::InsufficientBalance { .. }
                | GatewayError::AllowanceRequired { .. }
                | GatewayError::SignerRequired(_) => ErrorClass::Authorization,
                GatewayError::PhaseViolation { .. }
                | GatewayError::EventInactive(_)
                | GatewayError::AlreadyCommitted
                | GatewayError::AlreadyRevealed
                | GatewayError::NoCommitment
                | GatewayError::HashMismatch
                | GatewayError::EventNotFound(_)
                | GatewayError::UnknownCandidate { .. }
                | GatewayError::InvalidSchedule { .. }
                | GatewayError::InvalidCandidates(_) => ErrorClass::Validation,
                GatewayError::EventIdUnresolvable { .. }
                | GatewayError::TransactionFailed(_)
                | GatewayError::ConfirmationTimeout { .. }
                | GatewayError::Malformed(_) => ErrorClass::Transaction,
                GatewayError::Unreachable(_) => ErrorClass::Infrastructure,
            },
        }
    }

    /// Short actionable hint shown next to the error message.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired(_) => "Connect your wallet before interacting on-chain.",
            Self::CommitPhaseClosed { .. } => {
                "You can only commit during the commit phase while the event is active."
            }
            Self::RevealPhaseNotOpen { .. } => "Wait for the reveal phase to open.",
            Self::SecretMissing => {
                "Provide the secret used during commit or restore it from your backup."
            }
            Self::ActionPending => "Wait for the pending transaction to resolve.",
            Self::Gateway(err) => match err {
                GatewayError::InsufficientBalance { .. } => "Top up your VOTE token balance.",
                GatewayError::AllowanceRequired { .. } => {
                    "Approve the voting contract to spend the vote cost."
                }
                GatewayError::SignerRequired(_) => "Attach a signing wallet.",
                GatewayError::HashMismatch => {
                    "Use the same candidate and secret you committed with."
                }
                GatewayError::NoCommitment => "You need to commit before you can reveal.",
                GatewayError::AlreadyCommitted | GatewayError::AlreadyRevealed => {
                    "Nothing left to do for this event."
                }
                GatewayError::ConfirmationTimeout { .. } => {
                    "Check the transaction in a block explorer before retrying."
                }
                GatewayError::Unreachable(_) => "The chain RPC is unreachable; try again later.",
                _ => "Review the request and try again.",
            },
        }
    }
}
