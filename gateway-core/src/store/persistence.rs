//! Encrypted on-disk mirror of the session store
//!
//! The live subset of sessions is serialized to JSON, sealed with the
//! machine key as `IV ‖ tag ‖ ciphertext`, and written to
//! `<state>/sessions/auth-sessions.enc`. Rapid session churn is coalesced
//! by a 2 second debounce; shutdown flushes immediately. Loading is
//! fail-open: an unreadable or tampered blob yields an empty store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::crypto::MachineKey;
use crate::store::sessions::{AuthSession, SessionStore};
use crate::store::write_file_0600;

/// Debounce window for coalescing writes.
const DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(2);

/// Mirror file format version.
const MIRROR_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSessions {
    version: u32,
    sessions: Vec<AuthSession>,
}

/// Outcome of loading the mirror at startup.
pub struct LoadOutcome {
    pub sessions: Vec<AuthSession>,
    /// True when a file existed but failed decryption or parsing
    pub corrupt: bool,
}

/// Debounced writer mirroring a [`SessionStore`] to disk.
pub struct SessionPersistence {
    path: PathBuf,
    key: MachineKey,
    store: Arc<SessionStore>,
    pending: Mutex<Option<JoinHandle<()>>>,
    /// Self-handle for the debounce task
    me: std::sync::Weak<SessionPersistence>,
}

impl SessionPersistence {
    /// Mirror file path under a state directory.
    pub fn file_path(state_dir: &Path) -> PathBuf {
        state_dir.join("sessions").join("auth-sessions.enc")
    }

    pub fn new(state_dir: &Path, key: MachineKey, store: Arc<SessionStore>) -> Arc<Self> {
        Arc::new_cyclic(|me| SessionPersistence {
            path: Self::file_path(state_dir),
            key,
            store,
            pending: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Read and decrypt the mirror. Never fails: tampered or unparseable
    /// files come back empty with `corrupt` set so the caller can audit.
    pub fn load(&self) -> LoadOutcome {
        let blob = match std::fs::read(&self.path) {
            Ok(blob) => blob,
            Err(_) => {
                return LoadOutcome {
                    sessions: Vec::new(),
                    corrupt: false,
                }
            }
        };

        let plaintext = match self.key.decrypt_blob(&blob) {
            Some(plaintext) => plaintext,
            None => {
                warn!("persisted sessions failed decryption; starting empty");
                return LoadOutcome {
                    sessions: Vec::new(),
                    corrupt: true,
                };
            }
        };

        match serde_json::from_slice::<PersistedSessions>(&plaintext) {
            Ok(doc) if doc.version == MIRROR_VERSION => LoadOutcome {
                sessions: doc.sessions,
                corrupt: false,
            },
            _ => {
                warn!("persisted sessions unparseable; starting empty");
                LoadOutcome {
                    sessions: Vec::new(),
                    corrupt: true,
                }
            }
        }
    }

    /// Schedule a debounced write, replacing any write already pending.
    pub fn schedule_write(&self) {
        let this = match self.me.upgrade() {
            Some(this) => this,
            None => return,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            this.write_now().await;
        });

        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Cancel any pending debounce and write immediately (shutdown path).
    pub async fn flush_sessions(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(handle) = pending.take() {
                handle.abort();
            }
        }
        self.write_now().await;
    }

    async fn write_now(&self) {
        let doc = PersistedSessions {
            version: MIRROR_VERSION,
            sessions: self.store.live_sessions().await,
        };
        let plaintext = match serde_json::to_vec(&doc) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(%err, "session serialization failed; mirror not written");
                return;
            }
        };
        let blob = match self.key.encrypt_blob(&plaintext) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(%err, "session encryption failed; mirror not written");
                return;
            }
        };
        if let Err(err) = write_file_0600(&self.path, &blob) {
            warn!(%err, path = %self.path.display(), "session mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mirror_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();
        let store = SessionStore::new();
        store.create("admin", Role::Admin).await;
        store.create("bob", Role::Operator).await;

        let persistence = SessionPersistence::new(dir.path(), key.clone(), Arc::clone(&store));
        persistence.flush_sessions().await;

        // Fresh store, as after a restart
        let recovered_store = SessionStore::new();
        let recovered = SessionPersistence::new(dir.path(), key, Arc::clone(&recovered_store));
        let outcome = recovered.load();
        assert!(!outcome.corrupt);
        assert_eq!(outcome.sessions.len(), 2);

        recovered_store.restore(outcome.sessions).await;
        assert_eq!(recovered_store.count().await, 2);
    }

    #[tokio::test]
    async fn test_expired_sessions_not_mirrored() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();
        let store = SessionStore::new();
        let mut expired = store.create("ghost", Role::ReadOnly).await;
        store.delete_all().await;
        expired.expires_at = 1;
        store.restore(vec![expired]).await; // restore also drops expired
        store.create("admin", Role::Admin).await;

        let persistence = SessionPersistence::new(dir.path(), key, store);
        persistence.flush_sessions().await;

        let outcome = persistence.load();
        assert_eq!(outcome.sessions.len(), 1);
        assert_eq!(outcome.sessions[0].username, "admin");
    }

    #[tokio::test]
    async fn test_tampered_mirror_fails_open() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();
        let store = SessionStore::new();
        store.create("admin", Role::Admin).await;

        let persistence = SessionPersistence::new(dir.path(), key, store);
        persistence.flush_sessions().await;

        let path = SessionPersistence::file_path(dir.path());
        let mut blob = std::fs::read(&path).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        std::fs::write(&path, &blob).unwrap();

        let outcome = persistence.load();
        assert!(outcome.corrupt);
        assert!(outcome.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_missing_mirror_is_clean_empty() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();
        let persistence = SessionPersistence::new(dir.path(), key, SessionStore::new());
        let outcome = persistence.load();
        assert!(!outcome.corrupt);
        assert!(outcome.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_writes() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();
        let store = SessionStore::new();
        store.create("admin", Role::Admin).await;

        let persistence = SessionPersistence::new(dir.path(), key, store);
        let path = SessionPersistence::file_path(dir.path());

        persistence.schedule_write();
        persistence.schedule_write();
        assert!(!path.exists(), "nothing written inside the debounce window");

        tokio::time::sleep(DEBOUNCE + std::time::Duration::from_millis(100)).await;
        // Let the spawned task run to completion
        tokio::task::yield_now().await;
        assert!(path.exists());
    }
}
