//! Commitment codec.
//!
//! The commitment stored on chain is
//!
//! ```text
//! keccak256( uint256(candidate_id) ‖ bytes32(secret) )
//! ```
//!
//! i.e. a tight (non-padded) concatenation of the 32-byte big-endian candidate
//! id and the 32-byte secret. The voting contract recomputes exactly this on
//! reveal, so any change to the layout produces commitments that can never be
//! revealed.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

pub const SECRET_LEN: usize = 32;

/// A normalized 32-byte vote secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Strict parse of the [`Secret::to_hex`] form. Unlike
    /// [`normalize_secret`] this never falls back to hashing.
    pub fn from_hex(s: &str) -> Option<Self> {
        parse_hex32(s.trim()).map(Self)
    }

    /// `0x`-prefixed lowercase hex; feeding this back through
    /// [`normalize_secret`] yields the same secret.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

// Never print the preimage in logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// The on-chain commitment hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitHash(pub [u8; 32]);

impl CommitHash {
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

pub fn generate_secret() -> Secret {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    Secret(bytes)
}

/// Reduce arbitrary user input to a 32-byte secret.
///
/// Well-formed `0x` + 64 hex digits passes through unchanged; anything else
/// (passphrases, malformed hex) is hashed with keccak256 over its UTF-8 bytes.
pub fn normalize_secret(input: &str) -> Secret {
    let trimmed = input.trim();
    if let Some(bytes) = parse_hex32(trimmed) {
        return Secret(bytes);
    }
    Secret(keccak256(trimmed.as_bytes()))
}

pub fn compute_commitment(candidate_id: u64, secret: &Secret) -> CommitHash {
    let mut packed = [0u8; 64];
    packed[24..32].copy_from_slice(&candidate_id.to_be_bytes());
    packed[32..].copy_from_slice(&secret.0);
    CommitHash(keccak256(&packed))
}

fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(digits, &mut out).ok()?;
    Some(out)
}
