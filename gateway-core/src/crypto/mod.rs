//! Cryptographic primitives for the gateway
//!
//! Password hashing (PHC scrypt), credentials-file and session-at-rest
//! encryption (AES-256-GCM), RFC-6238 TOTP with backup codes, and
//! self-signed X.509 certificate minting for the TLS listener.

pub mod certgen;
pub mod envelope;
pub mod machine_key;
pub mod password;
pub mod totp;

/// scrypt cost parameters shared by password hashing and the
/// credentials-file key derivation (N = 2^14, r = 8, p = 1).
pub const SCRYPT_LOG_N: u8 = 14;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;

/// AES-256-GCM geometry used for everything encrypted at rest.
pub const GCM_IV_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
pub const GCM_KEY_SIZE: usize = 32;

pub use envelope::{decrypt_credentials, encrypt_credentials, is_encrypted_envelope};
pub use machine_key::MachineKey;
pub use password::{hash_password, is_password_hashed, verify_password};
pub use totp::{
    generate_backup_codes, generate_totp, generate_totp_secret, otpauth_uri, verify_backup_code,
    verify_totp,
};
