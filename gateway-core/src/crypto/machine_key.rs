//! Machine-generated key for session persistence
//!
//! A 32-byte key stored hex-encoded at
//! `<state>/credentials/session-encryption-key` (0600). Session payloads
//! are sealed as `IV(12) ‖ tag(16) ‖ ciphertext` raw bytes. Decryption is
//! fail-open: a short or tampered blob yields `None` so the gateway starts
//! with an empty session store instead of refusing to boot.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use rand::RngCore;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{GCM_IV_SIZE, GCM_KEY_SIZE, GCM_TAG_SIZE};
use crate::error::GatewayError;

/// Key age beyond which a rotation warning is logged (365 days).
const KEY_AGE_WARN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The session-at-rest encryption key for this machine.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MachineKey {
    key: [u8; GCM_KEY_SIZE],
}

impl MachineKey {
    /// Path of the key file under a state directory.
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("credentials").join("session-encryption-key")
    }

    /// Load the machine key, regenerating it when the file is missing or
    /// malformed. Logs a non-fatal warning when the key is over a year old.
    pub fn load_or_create(state_dir: &Path) -> Result<Self, GatewayError> {
        let path = Self::path(state_dir);

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(raw) = hex::decode(contents.trim()) {
                if raw.len() == GCM_KEY_SIZE {
                    if let Ok(meta) = fs::metadata(&path) {
                        if let Ok(modified) = meta.modified() {
                            let age = SystemTime::now()
                                .duration_since(modified)
                                .unwrap_or_default();
                            if age > KEY_AGE_WARN {
                                warn!(
                                    path = %path.display(),
                                    "session encryption key is older than a year; \
                                     consider `openclaw_admin credentials rotate`"
                                );
                            }
                        }
                    }
                    let mut key = [0u8; GCM_KEY_SIZE];
                    key.copy_from_slice(&raw);
                    return Ok(MachineKey { key });
                }
            }
            warn!(path = %path.display(), "session encryption key unreadable, regenerating");
        }

        Self::generate_at(&path)
    }

    /// Generate a fresh key and persist it at `path` with 0600 permissions.
    fn generate_at(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut key = [0u8; GCM_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);

        let mut encoded = hex::encode(key);
        encoded.push('\n');
        fs::write(path, &encoded)?;
        restrict_permissions(path)?;

        Ok(MachineKey { key })
    }

    /// Seal a payload as `IV ‖ tag ‖ ciphertext`.
    pub fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let mut iv = [0u8; GCM_IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| GatewayError::Fatal("cipher construction failed".to_string()))?;
        let mut combined = cipher
            .encrypt((&iv).into(), plaintext)
            .map_err(|_| GatewayError::Fatal("session encryption failed".to_string()))?;
        let tag = combined.split_off(combined.len() - GCM_TAG_SIZE);

        let mut blob = Vec::with_capacity(GCM_IV_SIZE + GCM_TAG_SIZE + combined.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&combined);
        Ok(blob)
    }

    /// Open a sealed payload. Returns `None` on any failure so callers can
    /// fall back to a fresh session store.
    pub fn decrypt_blob(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < GCM_IV_SIZE + GCM_TAG_SIZE {
            return None;
        }
        let iv: [u8; GCM_IV_SIZE] = blob[..GCM_IV_SIZE].try_into().ok()?;
        let tag = &blob[GCM_IV_SIZE..GCM_IV_SIZE + GCM_TAG_SIZE];
        let ciphertext = &blob[GCM_IV_SIZE + GCM_TAG_SIZE..];

        let mut combined = ciphertext.to_vec();
        combined.extend_from_slice(tag);

        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        cipher.decrypt((&iv).into(), combined.as_ref()).ok()
    }
}

/// Decrypt the persisted session blob with the current key, mint a new key
/// and re-encrypt. Returns the number of sessions carried across.
pub fn rotate_machine_key(state_dir: &Path) -> Result<usize, GatewayError> {
    let sessions_path = state_dir.join("sessions").join("auth-sessions.enc");
    let current = MachineKey::load_or_create(state_dir)?;

    let plaintext = match fs::read(&sessions_path) {
        Ok(blob) => current.decrypt_blob(&blob).unwrap_or_default(),
        Err(_) => Vec::new(),
    };

    let rotated = if plaintext.is_empty() {
        0
    } else {
        serde_json::from_slice::<serde_json::Value>(&plaintext)
            .ok()
            .and_then(|doc| doc.get("sessions").and_then(|s| s.as_array()).map(|a| a.len()))
            .unwrap_or(0)
    };

    let fresh = MachineKey::generate_at(&MachineKey::path(state_dir))?;
    if !plaintext.is_empty() {
        if let Some(parent) = sessions_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&sessions_path, fresh.encrypt_blob(&plaintext)?)?;
        restrict_permissions(&sessions_path)?;
    }

    Ok(rotated)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), GatewayError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), GatewayError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_created_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let first = MachineKey::load_or_create(dir.path()).unwrap();
        let second = MachineKey::load_or_create(dir.path()).unwrap();
        assert_eq!(first.key, second.key);

        let on_disk = fs::read_to_string(MachineKey::path(dir.path())).unwrap();
        assert_eq!(on_disk.trim().len(), GCM_KEY_SIZE * 2);
        assert!(on_disk.ends_with('\n'));
    }

    #[test]
    fn test_malformed_key_regenerated() {
        let dir = TempDir::new().unwrap();
        let path = MachineKey::path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not-hex-at-all\n").unwrap();

        let key = MachineKey::load_or_create(dir.path()).unwrap();
        let reloaded = MachineKey::load_or_create(dir.path()).unwrap();
        assert_eq!(key.key, reloaded.key);
    }

    #[test]
    fn test_blob_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();

        let blob = key.encrypt_blob(b"session payload").unwrap();
        assert!(blob.len() > GCM_IV_SIZE + GCM_TAG_SIZE);
        assert_eq!(key.decrypt_blob(&blob).unwrap(), b"session payload");
    }

    #[test]
    fn test_decrypt_fail_open() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();

        assert!(key.decrypt_blob(b"short").is_none());

        let mut blob = key.encrypt_blob(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(key.decrypt_blob(&blob).is_none());
    }

    #[test]
    fn test_rotation_reencrypts_sessions() {
        let dir = TempDir::new().unwrap();
        let key = MachineKey::load_or_create(dir.path()).unwrap();

        let doc = br#"{"version":1,"sessions":[{"id":"a"},{"id":"b"}]}"#;
        let sessions_path = dir.path().join("sessions").join("auth-sessions.enc");
        fs::create_dir_all(sessions_path.parent().unwrap()).unwrap();
        fs::write(&sessions_path, key.encrypt_blob(doc).unwrap()).unwrap();

        let rotated = rotate_machine_key(dir.path()).unwrap();
        assert_eq!(rotated, 2);

        // Old key no longer opens the blob, the new one does
        let blob = fs::read(&sessions_path).unwrap();
        assert!(key.decrypt_blob(&blob).is_none());
        let fresh = MachineKey::load_or_create(dir.path()).unwrap();
        assert_eq!(fresh.decrypt_blob(&blob).unwrap(), doc);
    }
}
