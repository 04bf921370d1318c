//! PHC-format scrypt password hashing
//!
//! Hashes are stored as `$scrypt$ln=<log2N>,r=<R>,p=<P>$<salt>$<hash>`
//! with base64url (unpadded) salt and digest, the exact encoding already
//! present in credential files written by earlier gateway versions. The
//! verifier therefore parses the cost parameters out of the stored string
//! rather than assuming the current defaults.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use scrypt::Params;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{SCRYPT_LOG_N, SCRYPT_P, SCRYPT_R};
use crate::error::GatewayError;

/// Salt length in bytes.
const SALT_SIZE: usize = 32;

/// Derived key length in bytes.
const HASH_SIZE: usize = 64;

/// Hash a password into a PHC scrypt string with a fresh random salt.
///
/// Two calls with the same password produce distinct strings.
pub fn hash_password(password: &str) -> Result<String, GatewayError> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut derived = vec![0u8; HASH_SIZE];
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, HASH_SIZE)
        .map_err(|e| GatewayError::Fatal(format!("scrypt parameters rejected: {e}")))?;
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut derived)
        .map_err(|e| GatewayError::Fatal(format!("scrypt derivation failed: {e}")))?;

    let encoded = format!(
        "$scrypt$ln={},r={},p={}${}${}",
        SCRYPT_LOG_N,
        SCRYPT_R,
        SCRYPT_P,
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(&derived),
    );
    derived.zeroize();
    Ok(encoded)
}

/// Verify a password against a stored PHC scrypt string.
///
/// Unparseable strings and digest length mismatches reject rather than
/// error. The digest comparison is constant-time on equal-length buffers.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parsed = match parse_phc(stored) {
        Some(p) => p,
        None => return false,
    };

    let params = match Params::new(parsed.log_n, parsed.r, parsed.p, parsed.hash.len()) {
        Ok(p) => p,
        Err(_) => return false,
    };

    let mut derived = vec![0u8; parsed.hash.len()];
    if scrypt::scrypt(password.as_bytes(), &parsed.salt, &params, &mut derived).is_err() {
        derived.zeroize();
        return false;
    }

    let matched = derived.len() == parsed.hash.len()
        && bool::from(derived.as_slice().ct_eq(parsed.hash.as_slice()));
    derived.zeroize();
    matched
}

/// Whether a stored credential string is already hashed (as opposed to a
/// legacy plaintext password awaiting migration).
pub fn is_password_hashed(value: &str) -> bool {
    value.starts_with("$scrypt$") || value.starts_with("$argon2")
}

struct ParsedPhc {
    log_n: u8,
    r: u32,
    p: u32,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

fn parse_phc(stored: &str) -> Option<ParsedPhc> {
    let mut parts = stored.strip_prefix('$')?.split('$');
    if parts.next()? != "scrypt" {
        return None;
    }

    let mut log_n = None;
    let mut r = None;
    let mut p = None;
    for kv in parts.next()?.split(',') {
        let (key, value) = kv.split_once('=')?;
        match key {
            "ln" => log_n = value.parse::<u8>().ok(),
            "r" => r = value.parse::<u32>().ok(),
            "p" => p = value.parse::<u32>().ok(),
            _ => return None,
        }
    }

    let salt = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
    let hash = URL_SAFE_NO_PAD.decode(parts.next()?).ok()?;
    if parts.next().is_some() || salt.is_empty() || hash.is_empty() {
        return None;
    }

    Some(ParsedPhc {
        log_n: log_n?,
        r: r?,
        p: p?,
        salt,
        hash,
    })
}
