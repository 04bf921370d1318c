//! OpenClaw Gateway daemon
//!
//! Binds the auth gateway listener, serves the Control UI, and flushes
//! sessions and the audit log on shutdown.

use std::path::PathBuf;

use clap::{Arg, Command};
use openclaw_core::store::default_state_dir;
use openclaw_core::{Gateway, GatewayConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let matches = Command::new("openclaw-gateway")
        .version(openclaw_core::VERSION)
        .about("OpenClaw Gateway - multi-user authentication and session gateway")
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .value_name("DIR")
                .help("State directory (credentials, sessions, logs)"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Listener bind address")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Listener port")
                .default_value("18789"),
        )
        .arg(
            Arg::new("tls")
                .long("tls")
                .help("Serve HTTPS with the gateway certificate (minted on demand)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("credentials-password")
                .long("credentials-password")
                .value_name("PASSWORD")
                .help("Password for an encrypted credentials file (or OPENCLAW_CREDENTIALS_PASSWORD)"),
        )
        .arg(
            Arg::new("legacy-token")
                .long("legacy-token")
                .value_name("TOKEN")
                .help("Accept this shared token on WebSocket connections without a session"),
        )
        .arg(
            Arg::new("ui-dir")
                .long("ui-dir")
                .value_name("DIR")
                .help("Directory holding the Control UI bundle (index.html)"),
        )
        .arg(
            Arg::new("audit-retention")
                .long("audit-retention")
                .value_name("N")
                .help("Rotated audit files kept on disk")
                .default_value("10"),
        )
        .get_matches();

    let state_dir = matches
        .get_one::<String>("state-dir")
        .map(PathBuf::from)
        .unwrap_or_else(default_state_dir);
    let port: u16 = matches
        .get_one::<String>("port")
        .expect("has default")
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port"))?;
    let audit_retention: usize = matches
        .get_one::<String>("audit-retention")
        .expect("has default")
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid audit retention"))?;
    let credentials_password = matches
        .get_one::<String>("credentials-password")
        .cloned()
        .or_else(|| std::env::var("OPENCLAW_CREDENTIALS_PASSWORD").ok());

    let config = GatewayConfig {
        bind_address: matches.get_one::<String>("bind").expect("has default").clone(),
        port,
        state_dir,
        enable_tls: matches.get_flag("tls"),
        audit_retention,
        credentials_password,
        legacy_token: matches.get_one::<String>("legacy-token").cloned(),
        ui_dir: matches.get_one::<String>("ui-dir").map(PathBuf::from),
        ..Default::default()
    };

    let gateway = Gateway::new(config).await?;
    gateway.audit.append(
        "gateway.started",
        "system",
        "local",
        serde_json::json!({"version": openclaw_core::VERSION}),
    );

    let server = tokio::spawn(Gateway::serve(gateway.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.abort();
    gateway.audit.append("gateway.stopped", "system", "local", serde_json::json!({}));
    gateway.shutdown().await;

    Ok(())
}
