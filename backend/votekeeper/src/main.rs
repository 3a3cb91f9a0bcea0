//! Votekeeper entry point.
//!
//! Drives commit-reveal voting against the voting contract for the
//! configured wallet, keeps commit secrets in a local vault, and follows
//! the contract's logs into SQLite. A small Axum REST API exposes the vote
//! sessions and the off-chain ledger.

mod api;
mod chain;
mod clock;
mod codec;
mod config;
mod db;
mod errors;
mod events;
mod indexer;
mod ledger;
mod phase;
mod reconcile;
mod session;
mod types;
mod vault;
mod wallet;

#[cfg(test)]
mod test_protocol;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chain::dev::{DevChain, ONE_TOKEN};
use chain::evm::EvmContract;
use chain::{ChainGateway, VotingContract};
use clock::{Clock, SystemClock};
use config::{ChainMode, Config};
use indexer::IndexerState;
use ledger::{HttpLedger, Ledger, SqliteLedger};
use reconcile::Reconciler;
use session::{SessionDeps, SessionSettings, Sessions};
use types::address_hex;
use vault::FileVault;
use wallet::KeyWallet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let wallet = Arc::new(KeyWallet::from_key(
        config.private_key.as_ref().map(|k| k.expose()),
    )?);
    if wallet.configured_address().is_none() {
        warn!("PRIVATE_KEY not set; running read-only");
    }

    // ─── Chain ────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let contract: Arc<dyn VotingContract> = match config.chain_mode {
        ChainMode::Evm => {
            let (Some(voting), Some(token)) =
                (config.voting_system_address, config.voting_token_address)
            else {
                anyhow::bail!("evm mode needs VOTING_SYSTEM_ADDRESS and VOTING_TOKEN_ADDRESS");
            };
            info!("Using RPC {} (chain id {})", config.rpc_url, config.chain_id);
            Arc::new(EvmContract::connect(
                &config.rpc_url,
                config.chain_id,
                voting,
                token,
                wallet.signer(),
            )?)
        }
        ChainMode::Dev => {
            let dev = DevChain::new(clock.clone(), ONE_TOKEN);
            if let Some(address) = wallet.configured_address() {
                dev.credit(address, 100 * ONE_TOKEN);
            }
            info!("Using in-process dev chain");
            Arc::new(dev)
        }
    };
    let gateway = Arc::new(ChainGateway::new(contract, clock));

    // ─── Ledger ───────────────────────────────────────────
    let ledger: Arc<dyn Ledger> = match &config.ledger_url {
        Some(url) => {
            let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
            info!("Mirroring votes to remote ledger {url}");
            Arc::new(HttpLedger::new(client, url))
        }
        None => Arc::new(SqliteLedger::new(pool.clone())),
    };
    let reconciler = Arc::new(Reconciler::new(gateway.clone(), ledger));

    // Secrets are namespaced by wallet so two keys never share a file.
    let namespace = wallet
        .configured_address()
        .map(|a| address_hex(&a))
        .unwrap_or_else(|| "anonymous".to_string());
    let vault = Arc::new(FileVault::new(&config.vault_dir, &namespace));

    let sessions = Sessions::new(SessionDeps {
        gateway: gateway.clone(),
        vault,
        reconciler: reconciler.clone(),
        wallet,
        settings: SessionSettings {
            confirmation_timeout: config.confirmation_timeout(),
            refresh: config.refresh_policy(),
            phase_poll: Duration::from_secs(config.phase_poll_secs),
        },
    });

    // ─── Background indexer ───────────────────────────────
    let indexer_state = Arc::new(IndexerState {
        pool: pool.clone(),
        gateway,
        config: config.clone(),
    });
    tokio::spawn(indexer::run(indexer_state));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        sessions,
        reconciler,
    });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
