//! Gateway error types and their HTTP status mapping

use thiserror::Error;

/// Errors surfaced by gateway operations.
///
/// Cryptographic failures are deliberately collapsed into
/// `Unauthenticated` at the request boundary so that responses never leak
/// whether a password, tag check or code comparison failed.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stored data failed decryption or validation: {0}")]
    Corrupt(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// HTTP status code this error maps to at the request boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidInput(_) => 400,
            GatewayError::Unauthenticated => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::Conflict(_) => 409,
            GatewayError::RateLimited { .. } => 429,
            // Corrupt state and I/O failures are server-side problems
            GatewayError::Corrupt(_) | GatewayError::Io(_) | GatewayError::Fatal(_) => 500,
            GatewayError::ResourceLimit(_) => 400,
        }
    }

    /// Message safe to show to an unauthenticated client.
    pub fn public_message(&self) -> String {
        match self {
            // Never describe which credential check failed
            GatewayError::Unauthenticated => "invalid credentials or session".to_string(),
            GatewayError::Corrupt(_) | GatewayError::Io(_) | GatewayError::Fatal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(GatewayError::Unauthenticated.http_status(), 401);
        assert_eq!(GatewayError::Forbidden("csrf".into()).http_status(), 403);
        assert_eq!(GatewayError::RateLimited { retry_after_ms: 1 }.http_status(), 429);
        assert_eq!(GatewayError::Corrupt("tag".into()).http_status(), 500);
    }

    #[test]
    fn test_public_message_hides_crypto_detail() {
        let err = GatewayError::Corrupt("GCM tag mismatch".into());
        assert!(!err.public_message().contains("GCM"));
    }
}
