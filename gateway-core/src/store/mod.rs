//! Persistent state for the gateway
//!
//! Everything lives under one state directory (default `~/.openclaw`):
//! credentials, the encrypted session mirror, per-user preferences and
//! projects, and the audit log. Files that hold secrets are written with
//! 0600 permissions.

use std::fs;
use std::path::{Path, PathBuf};

pub mod credentials;
pub mod persistence;
pub mod preferences;
pub mod projects;
pub mod sessions;

/// Default state directory (`~/.openclaw`).
pub fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".openclaw"),
        None => PathBuf::from(".openclaw"),
    }
}

/// Reduce a username to a filesystem-safe, case-insensitive form used for
/// per-user file and directory names.
pub fn sanitize_username(username: &str) -> String {
    let mut out: String = username
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(64);
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Write a file with 0600 permissions, creating parent directories.
pub(crate) fn write_file_0600(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    restrict_permissions(path)
}

#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
