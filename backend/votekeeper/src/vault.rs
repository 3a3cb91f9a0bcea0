//! Local storage for commit secrets.
//!
//! A secret is the only thing that can reveal a commitment, so it is kept on
//! the voter's machine under `vote_secret_<namespace>_<event_id>` and never
//! sent to the ledger. Storage trouble is logged and swallowed: a failed save
//! must not undo a confirmed commit, and the voter can still reveal with a
//! manually supplied secret.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codec::Secret;

pub const SECRET_KEY_PREFIX: &str = "vote_secret_";

/// Storage key for one (voter session, event) pair.
pub fn storage_key(namespace: &str, event_id: u64) -> String {
    format!("{SECRET_KEY_PREFIX}{namespace}_{event_id}")
}

#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn persist(&self, event_id: u64, secret: &Secret);
    async fn load(&self, event_id: u64) -> Option<Secret>;
    async fn clear(&self, event_id: u64);
}

/// Process-local vault; secrets are lost on restart.
pub struct MemoryVault {
    namespace: String,
    entries: Mutex<HashMap<String, Secret>>,
}

impl MemoryVault {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, event_id: u64) -> String {
        storage_key(&self.namespace, event_id)
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn persist(&self, event_id: u64, secret: &Secret) {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(self.key(event_id), *secret);
            }
            Err(_) => warn!("secret vault lock poisoned; secret for event {event_id} not saved"),
        }
    }

    async fn load(&self, event_id: u64) -> Option<Secret> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&self.key(event_id)).copied())
    }

    async fn clear(&self, event_id: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&self.key(event_id));
        }
    }
}

/// One file per secret under `dir`, written atomically via rename.
pub struct FileVault {
    dir: PathBuf,
    namespace: String,
}

impl FileVault {
    pub fn new(dir: impl AsRef<Path>, namespace: &str) -> Self {
        let namespace = namespace
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Self {
            dir: dir.as_ref().to_path_buf(),
            namespace,
        }
    }

    fn path(&self, event_id: u64) -> PathBuf {
        self.dir.join(storage_key(&self.namespace, event_id))
    }

    async fn write(&self, event_id: u64, secret: &Secret) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(event_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, format!("{}\n", secret.to_hex())).await?;
        tokio::fs::rename(&tmp, &path).await
    }
}

#[async_trait]
impl SecretVault for FileVault {
    async fn persist(&self, event_id: u64, secret: &Secret) {
        match self.write(event_id, secret).await {
            Ok(()) => debug!("secret for event {event_id} saved"),
            Err(e) => warn!("could not save secret for event {event_id}: {e}"),
        }
    }

    async fn load(&self, event_id: u64) -> Option<Secret> {
        let contents = match tokio::fs::read_to_string(self.path(event_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("could not read secret for event {event_id}: {e}");
                return None;
            }
        };
        let secret = Secret::from_hex(&contents);
        if secret.is_none() {
            warn!("stored secret for event {event_id} is corrupt; ignoring it");
        }
        secret
    }

    async fn clear(&self, event_id: u64) {
        match tokio::fs::remove_file(self.path(event_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove secret for event {event_id}: {e}"),
        }
    }
}
