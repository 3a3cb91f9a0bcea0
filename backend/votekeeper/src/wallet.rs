//! Signing wallet seen by the vote session.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use tracing::info;

use crate::errors::{AppError, WalletError};

#[async_trait]
pub trait Wallet: Send + Sync {
    /// Connected address, if any.
    fn address(&self) -> Option<Address>;
    /// Address the wallet would connect as, without connecting.
    fn known_address(&self) -> Option<Address> {
        self.address()
    }
    /// Ask the wallet to connect; returns the now-connected address.
    async fn connect(&self) -> Result<Address, WalletError>;
}

/// Wallet backed by a locally held private key. Starts disconnected.
pub struct KeyWallet {
    signer: Option<LocalWallet>,
    connected: AtomicBool,
}

impl KeyWallet {
    pub fn from_key(private_key: Option<&str>) -> Result<Self, AppError> {
        let signer = private_key
            .map(|key| {
                let key = key.trim();
                let key = key
                    .strip_prefix("0x")
                    .or_else(|| key.strip_prefix("0X"))
                    .unwrap_or(key);
                key.parse::<LocalWallet>()
                    .map_err(|e| AppError::Config(format!("invalid PRIVATE_KEY: {e}")))
            })
            .transpose()?;
        Ok(Self {
            signer,
            connected: AtomicBool::new(false),
        })
    }

    /// Signer to hand to the chain backend.
    pub fn signer(&self) -> Option<LocalWallet> {
        self.signer.clone()
    }

    /// Address of the configured key, connected or not.
    pub fn configured_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }
}

#[async_trait]
impl Wallet for KeyWallet {
    fn address(&self) -> Option<Address> {
        if self.connected.load(Ordering::SeqCst) {
            self.configured_address()
        } else {
            None
        }
    }

    fn known_address(&self) -> Option<Address> {
        self.configured_address()
    }

    async fn connect(&self) -> Result<Address, WalletError> {
        let address = self.configured_address().ok_or(WalletError::NoSigner)?;
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("wallet {address:#x} connected");
        }
        Ok(address)
    }
}
