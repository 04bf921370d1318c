//! Gateway server: listener, routing and shared state
//!
//! One `Gateway` object constructed at startup owns every shared component
//! (credential store, session map, rate limiter, audit log, machine key);
//! request handlers and the admin CLI all go through it, so there are no
//! hidden globals. The listener accepts plain TCP or TLS, parses HTTP on
//! the stream, and either routes an auth request or hands the connection
//! to the WebSocket layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, DEFAULT_RETENTION};
use crate::crypto::{self, MachineKey};
use crate::error::GatewayError;
use crate::ratelimit::LoginRateLimiter;
use crate::store::credentials::CredentialsStore;
use crate::store::persistence::SessionPersistence;
use crate::store::preferences::PreferencesStore;
use crate::store::projects::ProjectsStore;
use crate::store::sessions::SessionStore;
use crate::store::default_state_dir;

pub mod http;
pub mod routes;
pub mod tls;
pub mod ui;
pub mod ws;

use http::{error_response, read_request, Response};

/// Combined trait for async read/write streams (TLS or TCP)
pub(crate) trait AsyncStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address
    pub bind_address: String,
    /// Port number
    pub port: u16,
    /// State directory holding credentials, sessions, logs
    pub state_dir: PathBuf,
    /// Enable the TLS listener (certificate minted on demand)
    pub enable_tls: bool,
    /// Maximum HTTP request size
    pub max_request_size: usize,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
    /// Rotated audit files kept on disk
    pub audit_retention: usize,
    /// Password for an envelope-encrypted credentials file
    pub credentials_password: Option<String>,
    /// Legacy WebSocket token accepted when no session cookie is present
    pub legacy_token: Option<String>,
    /// Directory holding the Control UI assets (index.html)
    pub ui_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 18789,
            state_dir: default_state_dir(),
            // TLS off by default for localhost-only deployments;
            // MUST be enabled for remote access
            enable_tls: false,
            max_request_size: 1024 * 1024, // 1MB
            request_timeout_secs: 30,
            audit_retention: DEFAULT_RETENTION,
            credentials_password: None,
            legacy_token: None,
            ui_dir: None,
        }
    }
}

/// The gateway: every shared component behind one object.
pub struct Gateway {
    pub config: GatewayConfig,
    pub credentials: CredentialsStore,
    pub sessions: Arc<SessionStore>,
    pub persistence: Arc<SessionPersistence>,
    pub preferences: PreferencesStore,
    pub projects: ProjectsStore,
    pub limiter: LoginRateLimiter,
    pub audit: AuditLog,
    /// Hash verified for unknown users so response timing does not reveal
    /// whether a username exists
    pub(crate) dummy_hash: String,
    /// Session ids that were just revoked; live WebSocket connections
    /// listen here and close themselves when their session is named
    pub(crate) revocations: broadcast::Sender<String>,
}

impl Gateway {
    /// Build the gateway: load the machine key, recover persisted
    /// sessions, open the stores and start the audit log. Must run inside
    /// a tokio runtime.
    pub async fn new(config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        let state_dir = config.state_dir.clone();

        let audit = AuditLog::init(&state_dir, config.audit_retention);
        let credentials = CredentialsStore::open(&state_dir, config.credentials_password.clone())?;
        let machine_key = MachineKey::load_or_create(&state_dir)?;

        let sessions = SessionStore::new();
        let persistence =
            SessionPersistence::new(&state_dir, machine_key, Arc::clone(&sessions));

        let recovered = persistence.load();
        if recovered.corrupt {
            audit.append(
                "session.store.corrupt",
                "system",
                "local",
                serde_json::json!({"action": "started empty"}),
            );
        }
        let recovered_count = recovered.sessions.len();
        sessions.restore(recovered.sessions).await;
        if recovered_count > 0 {
            info!(count = recovered_count, "recovered persisted sessions");
        }

        // Mirror every session mutation to disk, debounced
        let mirror = Arc::clone(&persistence);
        sessions.set_mutation_listener(Arc::new(move || mirror.schedule_write()));

        let dummy_hash = crypto::hash_password("gateway-timing-equalizer")?;
        let (revocations, _) = broadcast::channel(64);

        Ok(Arc::new(Gateway {
            preferences: PreferencesStore::new(&state_dir),
            projects: ProjectsStore::new(&state_dir),
            limiter: LoginRateLimiter::new(),
            credentials,
            sessions,
            persistence,
            audit,
            dummy_hash,
            revocations,
            config,
        }))
    }

    /// Revoke all sessions for a user and force-close their WebSockets.
    pub async fn revoke_user_sessions(&self, username: &str) -> usize {
        let ids = self.sessions.list_user_session_ids(username).await;
        let removed = self.sessions.delete_by_user(username).await;
        for id in ids {
            let _ = self.revocations.send(id);
        }
        removed
    }

    /// Flush state that only lives in memory. Call before process exit.
    pub async fn shutdown(&self) {
        self.persistence.flush_sessions().await;
        self.audit.shutdown();
        info!("gateway state flushed");
    }

    /// Accept loop. Runs until the task is cancelled.
    pub async fn serve(self: Arc<Self>) -> Result<(), GatewayError> {
        let tls_acceptor = if self.config.enable_tls {
            let (cert_path, key_path) = tls::ensure_material(&self.config.state_dir)?;
            Some(tls::load_acceptor(&cert_path, &key_path)?)
        } else {
            None
        };

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Fatal(format!("bind {addr} failed: {e}")))?;

        let scheme = if tls_acceptor.is_some() { "https" } else { "http" };
        info!(%addr, scheme, "gateway listening");

        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };

            let gateway = Arc::clone(&self);
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let ip = peer_addr.ip().to_string();
                let secure = acceptor.is_some();

                // TLS handshake after spawn so it never blocks the accept loop
                let stream: Box<dyn AsyncStream> = if let Some(acceptor) = acceptor {
                    match acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => Box::new(tls_stream),
                        Err(err) => {
                            debug!(%err, %ip, "TLS handshake failed");
                            return;
                        }
                    }
                } else {
                    Box::new(tcp_stream)
                };

                gateway.handle_connection(stream, ip, secure).await;
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: Box<dyn AsyncStream>,
        ip: String,
        secure: bool,
    ) {
        let deadline = Duration::from_secs(self.config.request_timeout_secs);
        let request = match tokio::time::timeout(
            deadline,
            read_request(&mut stream, self.config.max_request_size),
        )
        .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                let _ = error_response(&err).write_to(&mut stream).await;
                return;
            }
            Err(_) => {
                debug!(%ip, "request read timed out");
                return;
            }
        };

        // The upgrade takes over the stream and outlives the HTTP deadline
        if request.path == "/ws" && request.is_websocket_upgrade() {
            ws::handle_upgrade(self, stream, request, ip).await;
            return;
        }

        let response = match tokio::time::timeout(
            deadline,
            self.route(&request, &ip, secure),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(%ip, path = %request.path, "request handling timed out");
                error_response(&GatewayError::Fatal("request timed out".to_string()))
            }
        };

        if let Err(err) = response.write_to(&mut stream).await {
            debug!(%err, %ip, "failed to write response");
        }
    }

    async fn route(&self, request: &http::Request, ip: &str, secure: bool) -> Response {
        let outcome = match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/auth/login") => routes::login(self, request, ip, secure).await,
            ("GET", "/auth/me") => routes::me(self, request, secure).await,
            ("POST", "/auth/refresh") => routes::refresh(self, request, secure).await,
            ("POST", "/auth/logout") => routes::logout(self, request, ip, secure).await,
            ("GET", "/") | ("GET", "/index.html") => ui::serve_index(self).await,
            _ => Err(GatewayError::NotFound(format!("no route for {}", request.path))),
        };

        match outcome {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, GatewayError::Io(_) | GatewayError::Fatal(_) | GatewayError::Corrupt(_)) {
                    error!(%err, path = %request.path, "request failed");
                }
                error_response(&err)
            }
        }
    }
}
