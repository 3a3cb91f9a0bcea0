//! Application configuration loaded from environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ethers::types::Address;

use crate::errors::{AppError, Result};
use crate::reconcile::RefreshPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// JSON-RPC node with deployed contracts.
    Evm,
    /// In-process chain; nothing leaves the machine.
    Dev,
}

impl FromStr for ChainMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evm" => Ok(Self::Evm),
            "dev" => Ok(Self::Dev),
            other => Err(AppError::Config(format!(
                "Invalid CHAIN_MODE {other:?} (expected evm or dev)"
            ))),
        }
    }
}

/// Private key that never shows up in `Debug` output.
#[derive(Clone)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_mode: ChainMode,
    /// JSON-RPC endpoint (e.g. https://rpc.sepolia-api.lisk.com)
    pub rpc_url: String,
    pub chain_id: u64,
    /// Voting system contract; required in `evm` mode
    pub voting_system_address: Option<Address>,
    /// VOTE token contract; required in `evm` mode
    pub voting_token_address: Option<Address>,
    pub private_key: Option<SigningKey>,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Remote ledger base URL; the local database is used when unset
    pub ledger_url: Option<String>,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the displayed phase is re-resolved
    pub phase_poll_secs: u64,
    /// How often (in seconds) to poll the node for new logs
    pub log_poll_secs: u64,
    /// Maximum block span per log request
    pub log_batch_blocks: u64,
    /// Block to start from if no cursor is saved
    pub start_block: u64,
    /// Directory holding commit secrets
    pub vault_dir: PathBuf,
    /// `0` waits for confirmations indefinitely
    pub confirmation_timeout_secs: u64,
    pub refresh_max_attempts: u32,
    pub refresh_initial_delay_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let chain_mode: ChainMode = var("CHAIN_MODE")
            .unwrap_or_else(|| "evm".to_string())
            .parse()?;
        let voting_system_address = var("VOTING_SYSTEM_ADDRESS")
            .map(|v| parse_address("VOTING_SYSTEM_ADDRESS", &v))
            .transpose()?;
        let voting_token_address = var("VOTING_TOKEN_ADDRESS")
            .map(|v| parse_address("VOTING_TOKEN_ADDRESS", &v))
            .transpose()?;

        if chain_mode == ChainMode::Evm {
            if voting_system_address.is_none() {
                return Err(AppError::Config(
                    "VOTING_SYSTEM_ADDRESS environment variable is required".to_string(),
                ));
            }
            if voting_token_address.is_none() {
                return Err(AppError::Config(
                    "VOTING_TOKEN_ADDRESS environment variable is required".to_string(),
                ));
            }
        }

        Ok(Config {
            chain_mode,
            rpc_url: var("RPC_URL")
                .unwrap_or_else(|| "https://rpc.sepolia-api.lisk.com".to_string()),
            chain_id: parse_or("CHAIN_ID", var("CHAIN_ID"), 4202)?,
            voting_system_address,
            voting_token_address,
            private_key: var("PRIVATE_KEY").map(SigningKey),
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./votekeeper.db".to_string()),
            ledger_url: var("LEDGER_URL"),
            api_port: parse_or("API_PORT", var("API_PORT"), 3001)?,
            phase_poll_secs: parse_or("PHASE_POLL_SECS", var("PHASE_POLL_SECS"), 15)?,
            log_poll_secs: parse_or("LOG_POLL_SECS", var("LOG_POLL_SECS"), 5)?,
            log_batch_blocks: parse_or("LOG_BATCH_BLOCKS", var("LOG_BATCH_BLOCKS"), 2000)?,
            start_block: parse_or("START_BLOCK", var("START_BLOCK"), 0)?,
            vault_dir: var("VAULT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.vault")),
            confirmation_timeout_secs: parse_or(
                "CONFIRMATION_TIMEOUT_SECS",
                var("CONFIRMATION_TIMEOUT_SECS"),
                120,
            )?,
            refresh_max_attempts: parse_or(
                "REFRESH_MAX_ATTEMPTS",
                var("REFRESH_MAX_ATTEMPTS"),
                6,
            )?,
            refresh_initial_delay_ms: parse_or(
                "REFRESH_INITIAL_DELAY_MS",
                var("REFRESH_INITIAL_DELAY_MS"),
                500,
            )?,
        })
    }

    pub fn confirmation_timeout(&self) -> Option<Duration> {
        (self.confirmation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.confirmation_timeout_secs))
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            max_attempts: self.refresh_max_attempts,
            initial_delay: Duration::from_millis(self.refresh_initial_delay_ms),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}

fn parse_address(key: &str, value: &str) -> Result<Address> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid {key}: {value}")))
}
