//! Persisted user credential records
//!
//! `<state>/credentials/gateway-users.json` holds `{version: 1, users: […]}`
//! either as plaintext JSON or wrapped in the AES-GCM envelope from
//! [`crate::crypto::envelope`]. Lookups are case-insensitive while storage
//! preserves the username as entered. Every mutation is a read-modify-write
//! of the whole file under a per-store lock and touches `updatedAt`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crypto::envelope::{self, EncryptedEnvelope};
use crate::error::GatewayError;
use crate::store::write_file_0600;
use crate::{now_ms, Role};

/// Credentials file format version.
const FILE_VERSION: u32 = 1;

/// One gateway user as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    /// PHC scrypt string; never plaintext
    pub password_hash: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_code_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_enabled: Option<bool>,
    /// base32 secret, present whenever totpEnabled is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_code_hashes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_totp_code: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl UserRecord {
    pub fn totp_enabled(&self) -> bool {
        self.totp_enabled.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialsFile {
    version: u32,
    users: Vec<UserRecord>,
}

impl Default for CredentialsFile {
    fn default() -> Self {
        CredentialsFile {
            version: FILE_VERSION,
            users: Vec::new(),
        }
    }
}

/// Store over the persisted user database.
pub struct CredentialsStore {
    path: PathBuf,
    /// Operator password for the on-disk encryption wrapper, when in use
    file_password: Option<String>,
    /// Whether the file is currently envelope-wrapped (tracked per load)
    encrypted_mode: AtomicBool,
    lock: Mutex<()>,
}

impl CredentialsStore {
    /// Path of the credentials file under a state directory.
    pub fn file_path(state_dir: &Path) -> PathBuf {
        state_dir.join("credentials").join("gateway-users.json")
    }

    /// Open the store. `file_password` must be provided when the file on
    /// disk is envelope-encrypted; it is also used for re-encryption on
    /// save.
    pub fn open(state_dir: &Path, file_password: Option<String>) -> Result<Self, GatewayError> {
        let store = CredentialsStore {
            path: Self::file_path(state_dir),
            file_password,
            encrypted_mode: AtomicBool::new(false),
            lock: Mutex::new(()),
        };
        // Fail fast on an unreadable database rather than at first login
        store.load_doc()?;
        Ok(store)
    }

    fn load_doc(&self) -> Result<CredentialsFile, GatewayError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.encrypted_mode.store(false, Ordering::Relaxed);
                return Ok(CredentialsFile::default());
            }
            Err(err) => return Err(err.into()),
        };

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Corrupt(format!("credentials file unparseable: {e}")))?;

        let doc: CredentialsFile = if envelope::is_encrypted_envelope(&value) {
            self.encrypted_mode.store(true, Ordering::Relaxed);
            let password = self.file_password.as_deref().ok_or_else(|| {
                GatewayError::Fatal(
                    "credentials file is encrypted; a credentials password is required".to_string(),
                )
            })?;
            let wrapped: EncryptedEnvelope = serde_json::from_value(value)
                .map_err(|e| GatewayError::Corrupt(format!("envelope unparseable: {e}")))?;
            let plain = envelope::decrypt_credentials(&wrapped, password)?;
            serde_json::from_slice(&plain)
                .map_err(|e| GatewayError::Corrupt(format!("decrypted credentials unparseable: {e}")))?
        } else {
            self.encrypted_mode.store(false, Ordering::Relaxed);
            serde_json::from_value(value)
                .map_err(|e| GatewayError::Corrupt(format!("credentials file unparseable: {e}")))?
        };

        if doc.version != FILE_VERSION {
            return Err(GatewayError::Corrupt(format!(
                "unsupported credentials file version {}",
                doc.version
            )));
        }
        Ok(doc)
    }

    fn save_doc(&self, doc: &CredentialsFile) -> Result<(), GatewayError> {
        let plain = serde_json::to_vec_pretty(doc)
            .map_err(|e| GatewayError::Fatal(format!("credentials serialization failed: {e}")))?;

        let bytes = if self.encrypted_mode.load(Ordering::Relaxed) {
            let password = self.file_password.as_deref().ok_or_else(|| {
                GatewayError::Fatal("credentials password required for encrypted mode".to_string())
            })?;
            let wrapped = envelope::encrypt_credentials(&plain, password)?;
            serde_json::to_vec_pretty(&wrapped)
                .map_err(|e| GatewayError::Fatal(format!("envelope serialization failed: {e}")))?
        } else {
            plain
        };

        write_file_0600(&self.path, &bytes)?;
        Ok(())
    }

    fn find<'a>(doc: &'a CredentialsFile, username: &str) -> Option<&'a UserRecord> {
        let needle = username.to_lowercase();
        doc.users.iter().find(|u| u.username.to_lowercase() == needle)
    }

    fn find_mut<'a>(doc: &'a mut CredentialsFile, username: &str) -> Option<&'a mut UserRecord> {
        let needle = username.to_lowercase();
        doc.users
            .iter_mut()
            .find(|u| u.username.to_lowercase() == needle)
    }

    /// Read-modify-write a single user under the store lock.
    async fn mutate_user<F>(&self, username: &str, mutate: F) -> Result<UserRecord, GatewayError>
    where
        F: FnOnce(&mut UserRecord),
    {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_doc()?;
        let user = Self::find_mut(&mut doc, username)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown user {username}")))?;
        mutate(user);
        user.updated_at = now_ms();
        let updated = user.clone();
        self.save_doc(&doc)?;
        Ok(updated)
    }

    pub async fn list(&self) -> Result<Vec<UserRecord>, GatewayError> {
        let _guard = self.lock.lock().await;
        Ok(self.load_doc()?.users)
    }

    pub async fn get(&self, username: &str) -> Result<Option<UserRecord>, GatewayError> {
        let _guard = self.lock.lock().await;
        Ok(Self::find(&self.load_doc()?, username).cloned())
    }

    pub async fn has(&self, username: &str) -> Result<bool, GatewayError> {
        Ok(self.get(username).await?.is_some())
    }

    /// Insert a new user. The username must be unique case-insensitively.
    pub async fn create(
        &self,
        username: &str,
        password_hash: String,
        role: Role,
    ) -> Result<UserRecord, GatewayError> {
        validate_username(username)?;

        let _guard = self.lock.lock().await;
        let mut doc = self.load_doc()?;
        if Self::find(&doc, username).is_some() {
            return Err(GatewayError::Conflict(format!("user {username} already exists")));
        }

        let now = now_ms();
        let user = UserRecord {
            username: username.to_string(),
            password_hash,
            role,
            recovery_code_hash: None,
            totp_enabled: None,
            totp_secret: None,
            backup_code_hashes: None,
            last_used_totp_code: None,
            created_at: now,
            updated_at: now,
        };
        doc.users.push(user.clone());
        self.save_doc(&doc)?;
        Ok(user)
    }

    pub async fn update_password(
        &self,
        username: &str,
        password_hash: String,
    ) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| u.password_hash = password_hash)
            .await?;
        Ok(())
    }

    pub async fn update_role(&self, username: &str, role: Role) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| u.role = role).await?;
        Ok(())
    }

    pub async fn update_recovery_code(
        &self,
        username: &str,
        recovery_code_hash: Option<String>,
    ) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| u.recovery_code_hash = recovery_code_hash)
            .await?;
        Ok(())
    }

    /// Rename a user, preserving all other fields. Fails when the target
    /// name is taken by a different user.
    pub async fn update_username(&self, current: &str, new: &str) -> Result<(), GatewayError> {
        validate_username(new)?;

        let _guard = self.lock.lock().await;
        let mut doc = self.load_doc()?;
        if let Some(existing) = Self::find(&doc, new) {
            if existing.username.to_lowercase() != current.to_lowercase() {
                return Err(GatewayError::Conflict(format!("user {new} already exists")));
            }
        }
        let user = Self::find_mut(&mut doc, current)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown user {current}")))?;
        user.username = new.to_string();
        user.updated_at = now_ms();
        self.save_doc(&doc)?;
        Ok(())
    }

    /// Begin TOTP enrolment: store the secret with 2FA still disabled.
    pub async fn set_totp_pending(
        &self,
        username: &str,
        secret: String,
        backup_code_hashes: Vec<String>,
    ) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| {
            u.totp_secret = Some(secret);
            u.totp_enabled = Some(false);
            u.backup_code_hashes = Some(backup_code_hashes);
            u.last_used_totp_code = None;
        })
        .await?;
        Ok(())
    }

    /// Flip 2FA on once the first code has verified.
    pub async fn set_totp_enabled(&self, username: &str) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| u.totp_enabled = Some(true))
            .await?;
        Ok(())
    }

    /// Remove the second factor entirely.
    pub async fn clear_totp(&self, username: &str) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| {
            u.totp_enabled = None;
            u.totp_secret = None;
            u.backup_code_hashes = None;
            u.last_used_totp_code = None;
        })
        .await?;
        Ok(())
    }

    /// Persist the most recently accepted code (anti-replay).
    pub async fn set_last_used_totp_code(
        &self,
        username: &str,
        code: String,
    ) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| u.last_used_totp_code = Some(code))
            .await?;
        Ok(())
    }

    /// Replace the stored backup code hashes (regeneration).
    pub async fn set_backup_code_hashes(
        &self,
        username: &str,
        hashes: Vec<String>,
    ) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| u.backup_code_hashes = Some(hashes))
            .await?;
        Ok(())
    }

    /// Burn a consumed backup code by index.
    pub async fn remove_backup_code_hash(
        &self,
        username: &str,
        index: usize,
    ) -> Result<(), GatewayError> {
        self.mutate_user(username, |u| {
            if let Some(hashes) = u.backup_code_hashes.as_mut() {
                if index < hashes.len() {
                    hashes.remove(index);
                }
            }
        })
        .await?;
        Ok(())
    }

    pub async fn delete(&self, username: &str) -> Result<(), GatewayError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load_doc()?;
        let needle = username.to_lowercase();
        let before = doc.users.len();
        doc.users.retain(|u| u.username.to_lowercase() != needle);
        if doc.users.len() == before {
            return Err(GatewayError::NotFound(format!("unknown user {username}")));
        }
        self.save_doc(&doc)?;
        Ok(())
    }

    /// Wrap the on-disk file in the encryption envelope.
    pub async fn encrypt_file(&self, password: &str) -> Result<(), GatewayError> {
        let _guard = self.lock.lock().await;
        let doc = self.load_doc()?;
        let plain = serde_json::to_vec_pretty(&doc)
            .map_err(|e| GatewayError::Fatal(format!("credentials serialization failed: {e}")))?;
        let wrapped = envelope::encrypt_credentials(&plain, password)?;
        let bytes = serde_json::to_vec_pretty(&wrapped)
            .map_err(|e| GatewayError::Fatal(format!("envelope serialization failed: {e}")))?;
        write_file_0600(&self.path, &bytes)?;
        self.encrypted_mode.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Unwrap the on-disk file back to plaintext JSON.
    pub async fn decrypt_file(&self) -> Result<(), GatewayError> {
        let _guard = self.lock.lock().await;
        let doc = self.load_doc()?;
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| GatewayError::Fatal(format!("credentials serialization failed: {e}")))?;
        write_file_0600(&self.path, &bytes)?;
        self.encrypted_mode.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Whether the file on disk is currently envelope-wrapped.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted_mode.load(Ordering::Relaxed)
    }
}

fn validate_username(username: &str) -> Result<(), GatewayError> {
    let valid_len = (1..=64).contains(&username.len());
    let valid_start = username
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid_len && valid_start && valid_chars {
        Ok(())
    } else {
        Err(GatewayError::InvalidInput(format!(
            "invalid username {username:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::password::hash_password;
    use tempfile::TempDir;

    async fn store_with_user(dir: &TempDir, name: &str) -> CredentialsStore {
        let store = CredentialsStore::open(dir.path(), None).unwrap();
        let hash = hash_password("test-password-secure").unwrap();
        store.create(name, hash, Role::Admin).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_and_case_insensitive_get() {
        let dir = TempDir::new().unwrap();
        let store = store_with_user(&dir, "Admin").await;

        let user = store.get("ADMIN").await.unwrap().unwrap();
        assert_eq!(user.username, "Admin"); // case-preserving storage
        assert_eq!(user.role, Role::Admin);
        assert!(store.has("admin").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = store_with_user(&dir, "admin").await;
        let hash = hash_password("other").unwrap();
        let err = store.create("ADMIN", hash, Role::Operator).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_mutations_touch_updated_at() {
        let dir = TempDir::new().unwrap();
        let store = store_with_user(&dir, "admin").await;
        let before = store.get("admin").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.update_role("admin", Role::Operator).await.unwrap();
        let after = store.get("admin").await.unwrap().unwrap();
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.role, Role::Operator);
    }

    #[tokio::test]
    async fn test_rename_rules() {
        let dir = TempDir::new().unwrap();
        let store = store_with_user(&dir, "alice").await;
        let hash = hash_password("pw-bob-123").unwrap();
        store.create("bob", hash, Role::Operator).await.unwrap();

        // Rename onto an existing name fails
        let err = store.update_username("alice", "BOB").await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));

        // Case-only self rename is allowed
        store.update_username("alice", "Alice").await.unwrap();
        assert_eq!(store.get("alice").await.unwrap().unwrap().username, "Alice");
    }

    #[tokio::test]
    async fn test_totp_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = store_with_user(&dir, "admin").await;

        store
            .set_totp_pending("admin", "SECRETB32".into(), vec!["$scrypt$h1".into(), "$scrypt$h2".into()])
            .await
            .unwrap();
        let pending = store.get("admin").await.unwrap().unwrap();
        assert_eq!(pending.totp_enabled, Some(false));
        assert!(pending.totp_secret.is_some());

        store.set_totp_enabled("admin").await.unwrap();
        assert!(store.get("admin").await.unwrap().unwrap().totp_enabled());

        store.set_last_used_totp_code("admin", "123456".into()).await.unwrap();
        store.remove_backup_code_hash("admin", 0).await.unwrap();
        let user = store.get("admin").await.unwrap().unwrap();
        assert_eq!(user.last_used_totp_code.as_deref(), Some("123456"));
        assert_eq!(user.backup_code_hashes.as_ref().unwrap().len(), 1);

        store.clear_totp("admin").await.unwrap();
        let cleared = store.get("admin").await.unwrap().unwrap();
        assert!(cleared.totp_secret.is_none());
        assert!(cleared.backup_code_hashes.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = store_with_user(&dir, "admin").await;
        store.delete("ADMIN").await.unwrap();
        assert!(!store.has("admin").await.unwrap());
        assert!(matches!(
            store.delete("admin").await.unwrap_err(),
            GatewayError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_encryption_wrapper_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_with_user(&dir, "admin").await;
            store.encrypt_file("operator-pass").await.unwrap();
            assert!(store.is_encrypted());
        }

        // Raw file is now an envelope
        let raw: serde_json::Value = serde_json::from_slice(
            &fs::read(CredentialsStore::file_path(dir.path())).unwrap(),
        )
        .unwrap();
        assert!(envelope::is_encrypted_envelope(&raw));

        // Reopen without the password: hard error
        assert!(CredentialsStore::open(dir.path(), None).is_err());

        // Reopen with it and convert back to plaintext
        let store =
            CredentialsStore::open(dir.path(), Some("operator-pass".into())).unwrap();
        assert!(store.has("admin").await.unwrap());
        store.decrypt_file().await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(
            &fs::read(CredentialsStore::file_path(dir.path())).unwrap(),
        )
        .unwrap();
        assert!(!envelope::is_encrypted_envelope(&raw));
    }

    #[tokio::test]
    async fn test_username_validation() {
        let dir = TempDir::new().unwrap();
        let store = CredentialsStore::open(dir.path(), None).unwrap();
        let hash = hash_password("pw").unwrap();
        assert!(matches!(
            store.create("../evil", hash.clone(), Role::Admin).await.unwrap_err(),
            GatewayError::InvalidInput(_)
        ));
        assert!(matches!(
            store.create("", hash, Role::Admin).await.unwrap_err(),
            GatewayError::InvalidInput(_)
        ));
    }
}
