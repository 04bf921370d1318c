// OpenClaw Gateway Core Library
//
// Copyright (c) 2025 OpenClaw Project
//
// Multi-user authentication and session gateway for a self-hosted agent
// runtime: credential storage, short-lived cookie sessions, TOTP second
// factor, login rate limiting, encrypted session persistence and an
// append-only security audit log.

#![allow(clippy::too_many_arguments)] // Some handler plumbing needs many parameters

use serde::{Deserialize, Serialize};

pub mod audit;
pub mod crypto;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;

// Re-export common types
pub use error::GatewayError;
pub use server::{Gateway, GatewayConfig};
pub use store::sessions::AuthSession;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the browser session cookie set on login.
pub const SESSION_COOKIE: &str = "openclaw_session";

/// Issuer label used in otpauth:// enrolment URIs.
pub const TOTP_ISSUER: &str = "OpenClaw";

/// Role assigned to a gateway user, controlling the scopes derived for
/// every session that user opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Operator,
    ReadOnly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::ReadOnly => "read-only",
        }
    }

    /// Parse a role name as accepted by the admin CLI.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "read-only" | "readonly" => Some(Role::ReadOnly),
            _ => None,
        }
    }

    /// Scopes granted to sessions opened by a user with this role.
    pub fn scopes(&self) -> Vec<String> {
        let scopes: &[&str] = match self {
            Role::Admin => &["operator.admin", "operator.approvals", "operator.pairing"],
            Role::Operator => &["operator.read", "operator.write", "operator.approvals"],
            Role::ReadOnly => &["operator.read"],
        };
        scopes.iter().map(|s| s.to_string()).collect()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the unix epoch, the timestamp unit used across all
/// persisted gateway records.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
