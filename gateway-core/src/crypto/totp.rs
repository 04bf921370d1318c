//! RFC-6238 TOTP second factor and backup codes
//!
//! Secrets are 20 random bytes carried as unpadded RFC 4648 base32.
//! Codes are six digits over HMAC-SHA1 with a 30 second period; the
//! verifier accepts one period of clock skew in either direction and
//! rejects a replay of the most recently accepted code.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;

use crate::error::GatewayError;
use crate::TOTP_ISSUER;

type HmacSha1 = Hmac<Sha1>;

/// RFC 4648 base32 alphabet.
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Backup-code alphabet, ambiguous glyphs (0/1/I/O) removed.
const BACKUP_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// TOTP period in seconds.
pub const TOTP_PERIOD: u64 = 30;

/// Digits per code.
pub const TOTP_DIGITS: u32 = 6;

/// Raw secret length in bytes.
const SECRET_SIZE: usize = 20;

/// Number of codes issued per backup-code generation.
pub const BACKUP_CODE_COUNT: usize = 10;

/// Characters per backup code.
const BACKUP_CODE_LEN: usize = 8;

/// Generate a fresh TOTP secret, base32-encoded without padding.
pub fn generate_totp_secret() -> String {
    let mut raw = [0u8; SECRET_SIZE];
    rand::thread_rng().fill(&mut raw[..]);
    encode_base32(&raw)
}

/// Base32-encode without padding.
pub fn encode_base32(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    for chunk in data.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..chunk.len()].copy_from_slice(chunk);
        let bits = u64::from(buf[0]) << 32
            | u64::from(buf[1]) << 24
            | u64::from(buf[2]) << 16
            | u64::from(buf[3]) << 8
            | u64::from(buf[4]);
        let symbols = (chunk.len() * 8).div_ceil(5);
        for i in 0..symbols {
            let index = ((bits >> (35 - i * 5)) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
    }
    out
}

/// Strict base32 decoder: case-insensitive, tolerates spaces and `=`
/// padding, rejects every other character.
pub fn decode_base32(encoded: &str) -> Result<Vec<u8>, GatewayError> {
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);

    for ch in encoded.chars() {
        if ch == ' ' || ch == '=' {
            continue;
        }
        let upper = ch.to_ascii_uppercase();
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a as char == upper)
            .ok_or_else(|| {
                GatewayError::InvalidInput(format!("invalid base32 character {ch:?}"))
            })? as u64;

        bits = bits << 5 | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    Ok(out)
}

/// HOTP over a decoded secret: HMAC-SHA1, dynamic truncation, six digits.
fn hotp(secret: &[u8], counter: u64) -> Result<String, GatewayError> {
    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|_| GatewayError::InvalidInput("empty TOTP secret".to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let truncated = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);
    let code = truncated % 10u32.pow(TOTP_DIGITS);

    Ok(format!("{code:06}"))
}

/// Code for a base32 secret at unix time `t` (seconds).
pub fn generate_totp(secret_b32: &str, t: u64) -> Result<String, GatewayError> {
    let secret = decode_base32(secret_b32)?;
    hotp(&secret, t / TOTP_PERIOD)
}

/// Verify a submitted code against a secret at unix time `t`.
///
/// Scans counter offsets −1, 0, +1 and returns the matched code, which the
/// caller must persist as the user's `lastUsedTotpCode`. A code equal to
/// `last_used` is rejected outright (anti-replay). Malformed codes are
/// public input and are rejected without constant-time ceremony.
pub fn verify_totp(secret_b32: &str, code: &str, last_used: Option<&str>, t: u64) -> Option<String> {
    if code.len() != TOTP_DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if last_used == Some(code) {
        return None;
    }

    let secret = decode_base32(secret_b32).ok()?;
    let counter = (t / TOTP_PERIOD) as i64;
    for offset in [-1i64, 0, 1] {
        let candidate = counter + offset;
        if candidate < 0 {
            continue;
        }
        if let Ok(expected) = hotp(&secret, candidate as u64) {
            if expected == code {
                return Some(expected);
            }
        }
    }
    None
}

/// Enrolment URI consumed by authenticator apps.
pub fn otpauth_uri(username: &str, secret_b32: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{username}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={digits}&period={period}",
        issuer = TOTP_ISSUER,
        username = username,
        secret = secret_b32,
        digits = TOTP_DIGITS,
        period = TOTP_PERIOD,
    )
}

/// Generate a set of single-use backup codes (plaintext; callers hash them
/// before storage and show them to the user exactly once).
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            (0..BACKUP_CODE_LEN)
                .map(|_| BACKUP_ALPHABET[rng.gen_range(0..BACKUP_ALPHABET.len())] as char)
                .collect()
        })
        .collect()
}

/// Verify a backup code against the stored hash list.
///
/// Input is uppercased first (codes are case-insensitive). Every hash is
/// checked even after a match so the response time does not reveal the
/// position of the matched code. Returns the matched index.
pub fn verify_backup_code(input: &str, hashes: &[String]) -> Option<usize> {
    let normalized = input.trim().to_ascii_uppercase();
    let mut matched = None;
    for (index, hash) in hashes.iter().enumerate() {
        if crate::crypto::password::verify_password(&normalized, hash) && matched.is_none() {
            matched = Some(index);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_round_trip() {
        let secret = generate_totp_secret();
        assert_eq!(secret.len(), 32); // 20 bytes -> 32 symbols
        let decoded = decode_base32(&secret).unwrap();
        assert_eq!(encode_base32(&decoded), secret);
    }

    #[test]
    fn test_base32_known_vector() {
        // RFC 4648: "foobar" -> MZXW6YTBOI
        assert_eq!(encode_base32(b"foobar"), "MZXW6YTBOI");
        assert_eq!(decode_base32("MZXW6YTBOI").unwrap(), b"foobar");
        assert_eq!(decode_base32("mzxw6ytboi======").unwrap(), b"foobar");
    }

    #[test]
    fn test_base32_rejects_invalid_characters() {
        assert!(decode_base32("MZXW0").is_err()); // 0 not in alphabet
        assert!(decode_base32("MZ-XW").is_err());
    }

    #[test]
    fn test_rfc6238_sha1_vectors() {
        // RFC 6238 appendix B, SHA-1 rows (8-digit values truncated to 6)
        let secret = encode_base32(b"12345678901234567890");
        assert_eq!(generate_totp(&secret, 59).unwrap(), "287082");
        assert_eq!(generate_totp(&secret, 1111111109).unwrap(), "081804");
        assert_eq!(generate_totp(&secret, 1234567890).unwrap(), "005924");
        assert_eq!(generate_totp(&secret, 2000000000).unwrap(), "279037");
    }

    #[test]
    fn test_verify_accepts_adjacent_periods() {
        let secret = generate_totp_secret();
        let t = 1_700_000_000u64;
        let current = generate_totp(&secret, t).unwrap();
        let previous = generate_totp(&secret, t - TOTP_PERIOD).unwrap();
        let next = generate_totp(&secret, t + TOTP_PERIOD).unwrap();

        assert_eq!(verify_totp(&secret, &current, None, t), Some(current.clone()));
        assert_eq!(verify_totp(&secret, &previous, None, t), Some(previous));
        assert_eq!(verify_totp(&secret, &next, None, t), Some(next));
    }

    #[test]
    fn test_verify_rejects_replay() {
        let secret = generate_totp_secret();
        let t = 1_700_000_000u64;
        let code = generate_totp(&secret, t).unwrap();
        assert!(verify_totp(&secret, &code, Some(&code), t).is_none());
    }

    #[test]
    fn test_verify_rejects_malformed() {
        let secret = generate_totp_secret();
        let t = 1_700_000_000u64;
        assert!(verify_totp(&secret, "12345", None, t).is_none());
        assert!(verify_totp(&secret, "1234567", None, t).is_none());
        assert!(verify_totp(&secret, "12345a", None, t).is_none());
    }

    #[test]
    fn test_otpauth_uri_shape() {
        let uri = otpauth_uri("admin", "JBSWY3DPEHPK3PXP");
        assert!(uri.starts_with("otpauth://totp/OpenClaw:admin?secret=JBSWY3DPEHPK3PXP"));
        assert!(uri.contains("issuer=OpenClaw"));
        assert!(uri.contains("algorithm=SHA1"));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }

    #[test]
    fn test_backup_codes_alphabet_and_length() {
        let codes = generate_backup_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), BACKUP_CODE_LEN);
            assert!(code.bytes().all(|b| BACKUP_ALPHABET.contains(&b)));
            assert!(!code.contains('0') && !code.contains('1'));
            assert!(!code.contains('I') && !code.contains('O'));
        }
    }

    #[test]
    fn test_backup_code_verification_case_insensitive() {
        let codes = generate_backup_codes();
        let hashes: Vec<String> = codes
            .iter()
            .map(|c| crate::crypto::password::hash_password(c).unwrap())
            .collect();

        assert_eq!(verify_backup_code(&codes[3], &hashes), Some(3));
        assert_eq!(verify_backup_code(&codes[3].to_lowercase(), &hashes), Some(3));
        assert_eq!(verify_backup_code("WRONGAA2", &hashes), None);
    }
}
