//! TLS bootstrap for the HTTPS listener
//!
//! Certificate material lives under `<state>/gateway/tls/`. When the
//! listener starts with TLS enabled and no material exists, a self-signed
//! leaf is minted on the spot; operators can regenerate or remove it with
//! the admin CLI.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::crypto::certgen;
use crate::error::GatewayError;
use crate::store::write_file_0600;

/// Common name on minted certificates.
const CERT_CN: &str = "openclaw-gateway";

/// Minted certificate lifetime in days.
const CERT_DAYS: i64 = 365;

pub fn tls_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("gateway").join("tls")
}

pub fn cert_path(state_dir: &Path) -> PathBuf {
    tls_dir(state_dir).join("gateway-cert.pem")
}

pub fn key_path(state_dir: &Path) -> PathBuf {
    tls_dir(state_dir).join("gateway-key.pem")
}

/// Whether certificate material is present.
pub fn material_exists(state_dir: &Path) -> bool {
    cert_path(state_dir).exists() && key_path(state_dir).exists()
}

/// Ensure certificate material exists, minting a fresh self-signed leaf
/// when it does not. Returns the (cert, key) paths.
pub fn ensure_material(state_dir: &Path) -> Result<(PathBuf, PathBuf), GatewayError> {
    let cert = cert_path(state_dir);
    let key = key_path(state_dir);
    if cert.exists() && key.exists() {
        return Ok((cert, key));
    }
    mint_material(state_dir)
}

/// Mint and write fresh material, replacing whatever was there.
pub fn mint_material(state_dir: &Path) -> Result<(PathBuf, PathBuf), GatewayError> {
    let minted = certgen::mint_self_signed(CERT_CN, CERT_DAYS)?;
    let cert = cert_path(state_dir);
    let key = key_path(state_dir);
    write_file_0600(&cert, minted.cert_pem.as_bytes())?;
    write_file_0600(&key, minted.key_pem.as_bytes())?;
    info!(cert = %cert.display(), "minted self-signed TLS certificate");
    Ok((cert, key))
}

/// Delete certificate material. Returns whether anything was removed.
pub fn remove_material(state_dir: &Path) -> Result<bool, GatewayError> {
    let mut removed = false;
    for path in [cert_path(state_dir), key_path(state_dir)] {
        if path.exists() {
            std::fs::remove_file(&path)?;
            removed = true;
        }
    }
    Ok(removed)
}

/// Load a rustls acceptor from PEM material on disk.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, GatewayError> {
    let cert_file = File::open(cert_path)
        .map_err(|e| GatewayError::Fatal(format!("cannot open TLS certificate: {e}")))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| GatewayError::Fatal(format!("cannot parse TLS certificate: {e}")))?;
    if certs.is_empty() {
        return Err(GatewayError::Fatal("TLS certificate file holds no certificates".to_string()));
    }

    let key_file = File::open(key_path)
        .map_err(|e| GatewayError::Fatal(format!("cannot open TLS key: {e}")))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| GatewayError::Fatal(format!("cannot parse TLS key: {e}")))?
        .ok_or_else(|| GatewayError::Fatal("TLS key file holds no private key".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Fatal(format!("TLS configuration rejected: {e}")))?;

    Ok(TlsAcceptor::from(std::sync::Arc::new(config)))
}
