//! Session recovery across process restarts
//!
//! A gateway restart rebuilds the in-memory session store from the
//! encrypted mirror: live sessions survive, expired ones do not, and a
//! cookie issued before the restart keeps working afterwards.

use openclaw_core::crypto::MachineKey;
use openclaw_core::server::{Gateway, GatewayConfig};
use openclaw_core::store::persistence::SessionPersistence;
use openclaw_core::store::sessions::AuthSession;
use openclaw_core::{now_ms, Role};
use tempfile::TempDir;

fn config_for(dir: &TempDir) -> GatewayConfig {
    GatewayConfig {
        state_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_live_sessions_survive_restart() {
    let dir = TempDir::new().unwrap();

    let ids: Vec<String> = {
        let gateway = Gateway::new(config_for(&dir)).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(gateway.sessions.create("admin", Role::Admin).await.id);
        }
        gateway.shutdown().await; // flushes the mirror
        ids
    };

    // "Restart": a fresh gateway over the same state directory
    let gateway = Gateway::new(config_for(&dir)).await.unwrap();
    assert_eq!(gateway.sessions.count().await, 3);
    for id in ids {
        let session = gateway.sessions.get(&id).await.expect("session recovered");
        assert_eq!(session.username, "admin");
        assert_eq!(session.scopes, Role::Admin.scopes());
    }
}

#[tokio::test]
async fn test_expired_sessions_not_recovered() {
    let dir = TempDir::new().unwrap();

    // Write a mirror containing live and expired sessions, as a crashed
    // gateway might have left behind
    let key = MachineKey::load_or_create(dir.path()).unwrap();
    let now = now_ms();
    let session = |id: &str, expires_at: u64| AuthSession {
        id: id.to_string(),
        username: "admin".to_string(),
        role: Role::Admin,
        scopes: Role::Admin.scopes(),
        created_at: now - 60_000,
        expires_at,
        last_activity_at: now - 60_000,
        csrf_token: "csrf-token-value".to_string(),
    };
    let doc = serde_json::json!({
        "version": 1,
        "sessions": [
            session("live-1", now + 600_000),
            session("live-2", now + 600_000),
            session("live-3", now + 600_000),
            session("expired-1", now - 1),
        ],
    });
    let blob = key.encrypt_blob(&serde_json::to_vec(&doc).unwrap()).unwrap();
    let path = SessionPersistence::file_path(dir.path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, blob).unwrap();

    let gateway = Gateway::new(config_for(&dir)).await.unwrap();
    assert_eq!(gateway.sessions.count().await, 3);
    assert!(gateway.sessions.get("live-1").await.is_some());
    assert!(gateway.sessions.get("expired-1").await.is_none());
}

#[tokio::test]
async fn test_tampered_mirror_starts_empty() {
    let dir = TempDir::new().unwrap();

    {
        let gateway = Gateway::new(config_for(&dir)).await.unwrap();
        gateway.sessions.create("admin", Role::Admin).await;
        gateway.shutdown().await;
    }

    let path = SessionPersistence::file_path(dir.path());
    let mut blob = std::fs::read(&path).unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0xFF;
    std::fs::write(&path, blob).unwrap();

    let gateway = Gateway::new(config_for(&dir)).await.unwrap();
    assert_eq!(gateway.sessions.count().await, 0, "fail-open to an empty store");
}

#[tokio::test]
async fn test_mirror_updates_follow_mutations() {
    let dir = TempDir::new().unwrap();

    let gateway = Gateway::new(config_for(&dir)).await.unwrap();
    let keep = gateway.sessions.create("admin", Role::Admin).await;
    let drop_me = gateway.sessions.create("admin", Role::Admin).await;
    gateway.sessions.delete_by_id(&drop_me.id).await;
    gateway.shutdown().await;

    let restarted = Gateway::new(config_for(&dir)).await.unwrap();
    assert!(restarted.sessions.get(&keep.id).await.is_some());
    assert!(restarted.sessions.get(&drop_me.id).await.is_none());
}
