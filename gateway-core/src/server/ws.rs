//! WebSocket privileged channel
//!
//! The upgrade consumes the session cookie: a valid session stamps the
//! connection with the authenticated username and scopes, and every
//! privileged method derives its principal from that stamp — a `username`
//! field in a client payload is never consulted. Connections without a
//! session may fall back to the legacy shared token when one is
//! configured, but legacy connections carry no principal and cannot call
//! `user.*` methods. Anything else is closed with a policy violation.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use sha1::{Digest, Sha1};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role as WsRole, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::crypto::{self, totp};
use crate::error::GatewayError;
use crate::server::http::Request;
use crate::server::{AsyncStream, Gateway};
use crate::{now_ms, SESSION_COOKIE};

/// RFC 6455 handshake GUID.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Generous message cap: project file payloads arrive base64-encoded.
const MAX_WS_MESSAGE: usize = 48 * 1024 * 1024;

/// Server-trusted identity stamped onto an authenticated connection.
#[derive(Debug, Clone)]
struct Principal {
    username: String,
    scopes: Vec<String>,
    session_id: String,
}

/// Accept (or reject) an upgrade request and run the connection.
pub async fn handle_upgrade(
    gateway: Arc<Gateway>,
    mut stream: Box<dyn AsyncStream>,
    request: Request,
    ip: String,
) {
    let key = match request.header("sec-websocket-key") {
        Some(key) => key.to_string(),
        None => return,
    };

    // Resolve the principal before completing the handshake
    let principal = match request.cookie(SESSION_COOKIE) {
        Some(id) => gateway.sessions.get(&id).await.map(|s| Principal {
            username: s.username,
            scopes: s.scopes,
            session_id: s.id,
        }),
        None => None,
    };

    let legacy_ok = principal.is_none()
        && gateway
            .config
            .legacy_token
            .as_deref()
            .map(|expected| {
                let presented = request
                    .query_param("token")
                    .or_else(|| {
                        request
                            .header("authorization")
                            .and_then(|h| h.strip_prefix("Bearer "))
                            .map(String::from)
                    });
                presented.as_deref() == Some(expected)
            })
            .unwrap_or(false);

    let authorized = principal.is_some() || legacy_ok;

    // Complete the RFC 6455 handshake by hand; the HTTP layer owns the
    // stream up to this point
    let accept = STANDARD.encode(Sha1::digest(format!("{key}{WS_GUID}").as_bytes()));
    let handshake = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    if tokio::io::AsyncWriteExt::write_all(&mut stream, handshake.as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE);
    config.max_frame_size = Some(MAX_WS_MESSAGE);
    let mut ws = WebSocketStream::from_raw_socket(stream, WsRole::Server, Some(config)).await;

    if !authorized {
        gateway.audit.append(
            "ws.rejected",
            "anonymous",
            &ip,
            json!({"reason": "no session or token"}),
        );
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "authentication required".into(),
            })))
            .await;
        return;
    }

    run_connection(gateway, ws, principal, ip).await;
}

async fn run_connection(
    gateway: Arc<Gateway>,
    mut ws: WebSocketStream<Box<dyn AsyncStream>>,
    principal: Option<Principal>,
    ip: String,
) {
    let mut revocations = gateway.revocations.subscribe();
    let own_session = principal.as_ref().map(|p| p.session_id.clone());

    // Tell the client who the server thinks it is; scopes drive what the
    // Control UI offers
    if let Some(p) = &principal {
        let hello = json!({
            "type": "hello",
            "user": p.username,
            "scopes": p.scopes,
        });
        if ws.send(Message::Text(hello.to_string())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            revoked = revocations.recv() => {
                match (&own_session, revoked) {
                    (Some(own), Ok(id)) if *own == id => {
                        let _ = ws.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: "session revoked".into(),
                        }))).await;
                        break;
                    }
                    (_, Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                    _ => {}
                }
            }
            incoming = ws.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(%err, %ip, "websocket receive error");
                        break;
                    }
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        // The underlying session may have expired or been
                        // revoked since the handshake
                        if let Some(session_id) = &own_session {
                            if gateway.sessions.get(session_id).await.is_none() {
                                let _ = ws.send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Policy,
                                    reason: "session expired".into(),
                                }))).await;
                                break;
                            }
                        }
                        let reply = handle_message(&gateway, principal.as_ref(), &ip, &text).await;
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

fn error_code(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::InvalidInput(_) => "INVALID_REQUEST",
        GatewayError::Unauthenticated => "UNAUTHENTICATED",
        GatewayError::Forbidden(_) => "FORBIDDEN",
        GatewayError::RateLimited { .. } => "RATE_LIMITED",
        GatewayError::NotFound(_) => "NOT_FOUND",
        GatewayError::Conflict(_) => "CONFLICT",
        GatewayError::ResourceLimit(_) => "RESOURCE_LIMIT",
        _ => "INTERNAL",
    }
}

async fn handle_message(
    gateway: &Gateway,
    principal: Option<&Principal>,
    ip: &str,
    raw: &str,
) -> serde_json::Value {
    let request: serde_json::Value = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(_) => {
            return json!({
                "ok": false,
                "error": {"code": "INVALID_REQUEST", "message": "message is not valid JSON"},
            })
        }
    };
    let id = request.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    match dispatch(gateway, principal, ip, method, &params).await {
        Ok(result) => json!({"id": id, "ok": true, "result": result}),
        Err(err) => json!({
            "id": id,
            "ok": false,
            "error": {"code": error_code(&err), "message": err.public_message()},
        }),
    }
}

/// Route a privileged method. The principal comes from the connection;
/// nothing in `params` can change whose data is touched.
async fn dispatch(
    gateway: &Gateway,
    principal: Option<&Principal>,
    ip: &str,
    method: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let principal = principal.ok_or_else(|| {
        GatewayError::InvalidInput("password authentication required".to_string())
    })?;
    let username = principal.username.as_str();

    match method {
        "user.sessions.list" => {
            let ids = gateway.sessions.list_user_session_ids(username).await;
            let mut sessions = Vec::new();
            for id in ids {
                if let Some(session) = gateway.sessions.get(&id).await {
                    sessions.push(json!({
                        "id": session.id,
                        "createdAt": session.created_at,
                        "expiresAt": session.expires_at,
                        "lastActivityAt": session.last_activity_at,
                        "current": session.id == principal.session_id,
                    }));
                }
            }
            Ok(json!({"sessions": sessions}))
        }
        "user.sessions.revoke" => {
            let target = str_param(params, "sessionId")?;
            let owned = gateway
                .sessions
                .list_user_session_ids(username)
                .await
                .contains(&target);
            if !owned {
                return Err(GatewayError::NotFound("no such session".to_string()));
            }
            gateway.sessions.delete_by_id(&target).await;
            let _ = gateway.revocations.send(target);
            gateway
                .audit
                .append("session.revoked", username, ip, json!({}));
            Ok(json!({"revoked": 1}))
        }
        "user.sessions.revoke-all" => {
            let removed = gateway.revoke_user_sessions(username).await;
            gateway.audit.append(
                "session.revoked-all",
                username,
                ip,
                json!({"count": removed}),
            );
            Ok(json!({"revoked": removed}))
        }
        "user.preferences.get" => {
            let prefs = gateway.preferences.get(username).await;
            Ok(serde_json::to_value(prefs)?)
        }
        "user.preferences.set" => {
            let patch = params.get("preferences").unwrap_or(params);
            let merged = gateway.preferences.set(username, patch).await?;
            Ok(serde_json::to_value(merged)?)
        }
        "user.projects.list" => {
            let projects = gateway.projects.list(username).await;
            Ok(json!({"projects": projects}))
        }
        "user.projects.create" => {
            let id = str_param(params, "id")?;
            let name = str_param(params, "name")?;
            let color = params
                .get("color")
                .and_then(|v| v.as_str())
                .unwrap_or("#888888");
            let project = gateway.projects.create(username, &id, &name, color).await?;
            Ok(serde_json::to_value(project)?)
        }
        "user.projects.update" => {
            let id = str_param(params, "id")?;
            let update = serde_json::from_value(params.clone())
                .map_err(|_| GatewayError::InvalidInput("malformed project update".to_string()))?;
            let project = gateway.projects.update(username, &id, update).await?;
            Ok(serde_json::to_value(project)?)
        }
        "user.projects.delete" => {
            let id = str_param(params, "id")?;
            gateway.projects.delete(username, &id).await?;
            Ok(json!({"deleted": true}))
        }
        "user.projects.files.add" => {
            let project_id = str_param(params, "projectId")?;
            let file_name = str_param(params, "fileName")?;
            let mime_type = str_param(params, "mimeType")?;
            let session_key = params
                .get("sessionKey")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let data = str_param(params, "data")?;
            let meta = gateway
                .projects
                .add_file(username, &project_id, &file_name, &mime_type, &session_key, &data)
                .await?;
            Ok(serde_json::to_value(meta)?)
        }
        "user.projects.files.get" => {
            let project_id = str_param(params, "projectId")?;
            let file_id = str_param(params, "fileId")?;
            let (meta, data) = gateway
                .projects
                .read_file(username, &project_id, &file_id)
                .await?;
            Ok(json!({"meta": meta, "data": STANDARD.encode(data)}))
        }
        "user.projects.files.remove" => {
            let project_id = str_param(params, "projectId")?;
            let file_id = str_param(params, "fileId")?;
            gateway
                .projects
                .remove_file(username, &project_id, &file_id)
                .await?;
            Ok(json!({"removed": true}))
        }
        "user.totp.setup" => totp_setup(gateway, username, ip, params).await,
        "user.totp.confirm" => totp_confirm(gateway, username, ip, params).await,
        "user.totp.disable" => totp_disable(gateway, username, ip, params).await,
        "user.totp.backup-regenerate" => totp_backup_regenerate(gateway, username, ip, params).await,
        "user.password.change" => password_change(gateway, username, ip, params).await,
        _ => Err(GatewayError::NotFound(format!("unknown method {method}"))),
    }
}

fn str_param(params: &serde_json::Value, name: &str) -> Result<String, GatewayError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| GatewayError::InvalidInput(format!("{name} is required")))
}

/// Verify the caller's current password (blocking pool).
async fn require_current_password(
    gateway: &Gateway,
    username: &str,
    params: &serde_json::Value,
) -> Result<crate::store::credentials::UserRecord, GatewayError> {
    let password = str_param(params, "password")
        .or_else(|_| str_param(params, "currentPassword"))?;
    let user = gateway
        .credentials
        .get(username)
        .await?
        .ok_or(GatewayError::Unauthenticated)?;
    let hash = user.password_hash.clone();
    let ok = tokio::task::spawn_blocking(move || crypto::verify_password(&password, &hash))
        .await
        .map_err(|e| GatewayError::Fatal(format!("verification task failed: {e}")))?;
    if !ok {
        return Err(GatewayError::Unauthenticated);
    }
    Ok(user)
}

/// Verify a current TOTP code for an enrolled user, persisting anti-replay
/// state on success.
async fn require_totp_code(
    gateway: &Gateway,
    user: &crate::store::credentials::UserRecord,
    params: &serde_json::Value,
) -> Result<(), GatewayError> {
    let code = str_param(params, "code").or_else(|_| str_param(params, "totpCode"))?;
    let secret = user
        .totp_secret
        .as_deref()
        .ok_or(GatewayError::Unauthenticated)?;
    match totp::verify_totp(secret, &code, user.last_used_totp_code.as_deref(), now_ms() / 1000) {
        Some(matched) => {
            gateway
                .credentials
                .set_last_used_totp_code(&user.username, matched)
                .await?;
            Ok(())
        }
        None => Err(GatewayError::Unauthenticated),
    }
}

/// Hash a list of plaintext codes on the blocking pool.
async fn hash_codes(codes: Vec<String>) -> Result<Vec<String>, GatewayError> {
    tokio::task::spawn_blocking(move || {
        codes
            .iter()
            .map(|c| crypto::hash_password(c))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| GatewayError::Fatal(format!("hashing task failed: {e}")))?
}

async fn totp_setup(
    gateway: &Gateway,
    username: &str,
    ip: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let user = require_current_password(gateway, username, params).await?;
    if user.totp_enabled() {
        return Err(GatewayError::Conflict("2FA is already enabled".to_string()));
    }

    let secret = totp::generate_totp_secret();
    let backup_codes = totp::generate_backup_codes();
    let hashes = hash_codes(backup_codes.clone()).await?;
    gateway
        .credentials
        .set_totp_pending(&user.username, secret.clone(), hashes)
        .await?;
    gateway.audit.append("auth.totp.setup", username, ip, json!({}));

    // Secret and backup codes are shown exactly once
    Ok(json!({
        "secret": secret,
        "otpauthUri": totp::otpauth_uri(&user.username, &secret),
        "backupCodes": backup_codes,
    }))
}

async fn totp_confirm(
    gateway: &Gateway,
    username: &str,
    ip: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let user = gateway
        .credentials
        .get(username)
        .await?
        .ok_or(GatewayError::Unauthenticated)?;
    if user.totp_enabled() {
        return Err(GatewayError::Conflict("2FA is already enabled".to_string()));
    }
    if user.totp_secret.is_none() {
        return Err(GatewayError::InvalidInput("no pending 2FA enrolment".to_string()));
    }

    require_totp_code(gateway, &user, params).await?;
    gateway.credentials.set_totp_enabled(&user.username).await?;
    gateway.audit.append("auth.totp.enabled", username, ip, json!({}));
    Ok(json!({"enabled": true}))
}

async fn totp_disable(
    gateway: &Gateway,
    username: &str,
    ip: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let user = require_current_password(gateway, username, params).await?;
    if !user.totp_enabled() {
        return Err(GatewayError::Conflict("2FA is not enabled".to_string()));
    }
    require_totp_code(gateway, &user, params).await?;

    gateway.credentials.clear_totp(&user.username).await?;
    gateway.audit.append("auth.totp.disabled", username, ip, json!({}));
    Ok(json!({"enabled": false}))
}

async fn totp_backup_regenerate(
    gateway: &Gateway,
    username: &str,
    ip: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let user = require_current_password(gateway, username, params).await?;
    if !user.totp_enabled() {
        return Err(GatewayError::Conflict("2FA is not enabled".to_string()));
    }
    require_totp_code(gateway, &user, params).await?;

    let backup_codes = totp::generate_backup_codes();
    let hashes = hash_codes(backup_codes.clone()).await?;
    gateway
        .credentials
        .set_backup_code_hashes(&user.username, hashes)
        .await?;
    gateway
        .audit
        .append("auth.totp.backup-regenerated", username, ip, json!({}));
    Ok(json!({"backupCodes": backup_codes}))
}

async fn password_change(
    gateway: &Gateway,
    username: &str,
    ip: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, GatewayError> {
    let user = require_current_password(gateway, username, params).await?;
    let new_password = str_param(params, "newPassword")?;
    if new_password.len() < 8 {
        return Err(GatewayError::InvalidInput(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let hash = tokio::task::spawn_blocking(move || crypto::hash_password(&new_password))
        .await
        .map_err(|e| GatewayError::Fatal(format!("hashing task failed: {e}")))??;
    gateway.credentials.update_password(&user.username, hash).await?;
    gateway
        .audit
        .append("auth.password.changed", username, ip, json!({}));
    Ok(json!({"changed": true}))
}
