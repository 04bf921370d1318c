//! In-memory session store with sliding expiry
//!
//! Sessions are keyed by a 32-byte random id and live for 30 minutes of
//! inactivity; every authenticated request refreshes the window. A
//! background sweeper evicts expired entries every five minutes and stops
//! itself once the map is empty, so an idle gateway holds no timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{now_ms, Role};

/// Idle session lifetime.
pub const SESSION_TTL_MS: u64 = 30 * 60 * 1000;

/// Sweep interval for expired-session eviction.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Random token length (session ids and CSRF tokens).
const TOKEN_BYTES: usize = 32;

/// A live authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub scopes: Vec<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_activity_at: u64,
    pub csrf_token: String,
}

impl AuthSession {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

type MutationListener = Arc<dyn Fn() + Send + Sync>;

/// Shared session map.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, AuthSession>>,
    sweeper_running: AtomicBool,
    /// Invoked after every mutation; the persistence mirror hooks in here
    on_mutate: std::sync::RwLock<Option<MutationListener>>,
    /// Self-handle for the sweeper task
    me: std::sync::Weak<SessionStore>,
}

fn random_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| SessionStore {
            sessions: RwLock::new(HashMap::new()),
            sweeper_running: AtomicBool::new(false),
            on_mutate: std::sync::RwLock::new(None),
            me: me.clone(),
        })
    }

    /// Register the listener called after each mutation.
    pub fn set_mutation_listener(&self, listener: MutationListener) {
        if let Ok(mut slot) = self.on_mutate.write() {
            *slot = Some(listener);
        }
    }

    fn notify_mutation(&self) {
        if let Ok(slot) = self.on_mutate.read() {
            if let Some(listener) = slot.as_ref() {
                listener();
            }
        }
    }

    /// Create a session for a freshly authenticated user.
    pub async fn create(&self, username: &str, role: Role) -> AuthSession {
        let now = now_ms();
        let session = AuthSession {
            id: random_token(),
            username: username.to_string(),
            role,
            scopes: role.scopes(),
            created_at: now,
            expires_at: now + SESSION_TTL_MS,
            last_activity_at: now,
            csrf_token: random_token(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        self.ensure_sweeper();
        self.notify_mutation();
        session
    }

    /// Look up a live session. Expired entries are evicted on access.
    pub async fn get(&self, id: &str) -> Option<AuthSession> {
        let now = now_ms();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(session) if !session.is_expired_at(now) => return Some(session.clone()),
                None => return None,
                Some(_) => {} // expired, fall through to evict
            }
        }
        self.sessions.write().await.remove(id);
        self.notify_mutation();
        None
    }

    /// Slide the expiry window. Returns the refreshed session when live.
    pub async fn refresh(&self, id: &str) -> Option<AuthSession> {
        let now = now_ms();
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        if session.is_expired_at(now) {
            sessions.remove(id);
            drop(sessions);
            self.notify_mutation();
            return None;
        }
        session.expires_at = now + SESSION_TTL_MS;
        session.last_activity_at = now;
        let refreshed = session.clone();
        drop(sessions);
        self.notify_mutation();
        Some(refreshed)
    }

    pub async fn delete_by_id(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            self.notify_mutation();
        }
        removed
    }

    /// Revoke every session belonging to a user (case-insensitive).
    pub async fn delete_by_user(&self, username: &str) -> usize {
        let needle = username.to_lowercase();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.username.to_lowercase() != needle);
        let removed = before - sessions.len();
        drop(sessions);
        if removed > 0 {
            self.notify_mutation();
        }
        removed
    }

    pub async fn delete_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.len();
        sessions.clear();
        drop(sessions);
        if removed > 0 {
            self.notify_mutation();
        }
        removed
    }

    /// Session ids currently held by a user (case-insensitive).
    pub async fn list_user_session_ids(&self, username: &str) -> Vec<String> {
        let needle = username.to_lowercase();
        let now = now_ms();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.username.to_lowercase() == needle && !s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect()
    }

    /// All live sessions (the persistence mirror serializes these).
    pub async fn live_sessions(&self) -> Vec<AuthSession> {
        let now = now_ms();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Load sessions recovered from disk, dropping anything expired.
    pub async fn restore(&self, sessions: Vec<AuthSession>) {
        let now = now_ms();
        let mut map = self.sessions.write().await;
        for session in sessions {
            if !session.is_expired_at(now) {
                map.insert(session.id.clone(), session);
            }
        }
        let any = !map.is_empty();
        drop(map);
        if any {
            self.ensure_sweeper();
        }
    }

    /// Spawn the expiry sweeper unless one is already running. The task
    /// exits as soon as the map drains so it never outlives its work.
    fn ensure_sweeper(&self) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = match self.me.upgrade() {
            Some(store) => store,
            None => {
                self.sweeper_running.store(false, Ordering::SeqCst);
                return;
            }
        };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let now = now_ms();
                let mut sessions = store.sessions.write().await;
                let before = sessions.len();
                sessions.retain(|_, s| !s.is_expired_at(now));
                let evicted = before - sessions.len();
                let empty = sessions.is_empty();
                drop(sessions);

                if evicted > 0 {
                    debug!(evicted, "session sweeper evicted expired sessions");
                    store.notify_mutation();
                }
                if empty {
                    store.sweeper_running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
    }
}
