//! Credentials-file encryption envelope
//!
//! The user database can optionally be wrapped at rest in a JSON envelope
//! `{version: 1, encrypted: true, salt, iv, authTag, data}` keyed by an
//! operator-supplied password. Salt, IV and tag are hex, the ciphertext is
//! standard base64. Every encryption call draws a fresh salt and IV.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::{GCM_IV_SIZE, GCM_KEY_SIZE, GCM_TAG_SIZE, SCRYPT_LOG_N, SCRYPT_P, SCRYPT_R};
use crate::error::GatewayError;

/// Envelope format version.
const ENVELOPE_VERSION: u32 = 1;

/// Salt length for the password-derived file key.
const SALT_SIZE: usize = 32;

/// On-disk encrypted credentials envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub version: u32,
    pub encrypted: bool,
    /// Hex-encoded scrypt salt (32 bytes)
    pub salt: String,
    /// Hex-encoded AES-GCM IV (12 bytes)
    pub iv: String,
    /// Hex-encoded GCM authentication tag (16 bytes)
    pub auth_tag: String,
    /// Base64 ciphertext, tag excluded
    pub data: String,
}

/// Whether a parsed JSON document is an encryption envelope rather than a
/// plaintext credentials file.
pub fn is_encrypted_envelope(value: &serde_json::Value) -> bool {
    value.get("encrypted").and_then(|v| v.as_bool()) == Some(true)
        && value.get("version").and_then(|v| v.as_u64()) == Some(ENVELOPE_VERSION as u64)
}

/// Encrypt a serialized credentials document under a password.
pub fn encrypt_credentials(
    plaintext: &[u8],
    password: &str,
) -> Result<EncryptedEnvelope, GatewayError> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = [0u8; GCM_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut key = derive_file_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| GatewayError::Fatal("cipher construction failed".to_string()))?;
    key.zeroize();

    let mut combined = cipher
        .encrypt((&iv).into(), Payload::from(plaintext))
        .map_err(|_| GatewayError::Fatal("credentials encryption failed".to_string()))?;

    // aes-gcm appends the tag; the envelope keeps it as a separate field
    let tag = combined.split_off(combined.len() - GCM_TAG_SIZE);

    Ok(EncryptedEnvelope {
        version: ENVELOPE_VERSION,
        encrypted: true,
        salt: hex::encode(salt),
        iv: hex::encode(iv),
        auth_tag: hex::encode(tag),
        data: STANDARD.encode(&combined),
    })
}

/// Decrypt an envelope back to the serialized credentials document.
///
/// A wrong password surfaces as GCM authentication failure and is reported
/// as `Corrupt`; callers translate that for the operator.
pub fn decrypt_credentials(
    envelope: &EncryptedEnvelope,
    password: &str,
) -> Result<Vec<u8>, GatewayError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(GatewayError::Corrupt(format!(
            "unsupported credentials envelope version {}",
            envelope.version
        )));
    }

    let salt = hex::decode(&envelope.salt)
        .map_err(|_| GatewayError::Corrupt("envelope salt is not hex".to_string()))?;
    let iv = hex::decode(&envelope.iv)
        .map_err(|_| GatewayError::Corrupt("envelope iv is not hex".to_string()))?;
    let tag = hex::decode(&envelope.auth_tag)
        .map_err(|_| GatewayError::Corrupt("envelope tag is not hex".to_string()))?;
    let ciphertext = STANDARD
        .decode(&envelope.data)
        .map_err(|_| GatewayError::Corrupt("envelope data is not base64".to_string()))?;
    if iv.len() != GCM_IV_SIZE || tag.len() != GCM_TAG_SIZE {
        return Err(GatewayError::Corrupt("envelope geometry invalid".to_string()));
    }

    let mut key = derive_file_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| GatewayError::Fatal("cipher construction failed".to_string()))?;
    key.zeroize();

    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);
    let iv_arr: [u8; GCM_IV_SIZE] = iv.as_slice().try_into().expect("length checked above");

    cipher
        .decrypt((&iv_arr).into(), combined.as_ref())
        .map_err(|_| GatewayError::Corrupt("credentials decryption failed".to_string()))
}

fn derive_file_key(password: &str, salt: &[u8]) -> Result<[u8; GCM_KEY_SIZE], GatewayError> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, GCM_KEY_SIZE)
        .map_err(|e| GatewayError::Fatal(format!("scrypt parameters rejected: {e}")))?;
    let mut key = [0u8; GCM_KEY_SIZE];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|e| GatewayError::Fatal(format!("file key derivation failed: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let doc = br#"{"version":1,"users":[]}"#;
        let envelope = encrypt_credentials(doc, "file password").unwrap();
        assert!(envelope.encrypted);
        assert_eq!(envelope.salt.len(), SALT_SIZE * 2);
        assert_eq!(envelope.iv.len(), GCM_IV_SIZE * 2);
        assert_eq!(envelope.auth_tag.len(), GCM_TAG_SIZE * 2);

        let plain = decrypt_credentials(&envelope, "file password").unwrap();
        assert_eq!(plain, doc);
    }

    #[test]
    fn test_wrong_password_fails() {
        let envelope = encrypt_credentials(b"secret", "right").unwrap();
        let err = decrypt_credentials(&envelope, "wrong").unwrap_err();
        assert!(matches!(err, GatewayError::Corrupt(_)));
    }

    #[test]
    fn test_fresh_salt_and_iv_per_call() {
        let a = encrypt_credentials(b"doc", "pw").unwrap();
        let b = encrypt_credentials(b"doc", "pw").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn test_tamper_detection() {
        let mut envelope = encrypt_credentials(b"doc", "pw").unwrap();
        let mut raw = STANDARD.decode(&envelope.data).unwrap();
        if raw.is_empty() {
            raw.push(0);
        } else {
            raw[0] ^= 0xFF;
        }
        envelope.data = STANDARD.encode(&raw);
        assert!(decrypt_credentials(&envelope, "pw").is_err());
    }

    #[test]
    fn test_envelope_detection() {
        let envelope = encrypt_credentials(b"doc", "pw").unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(is_encrypted_envelope(&value));
        assert!(value.get("authTag").is_some());

        let plain: serde_json::Value = serde_json::json!({"version": 1, "users": []});
        assert!(!is_encrypted_envelope(&plain));
    }
}
