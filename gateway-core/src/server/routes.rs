//! HTTP auth endpoints: login, me, refresh, logout
//!
//! The login path is the security-critical one and follows a fixed order:
//! rate-limit check first (no I/O before a 429), then password
//! verification on the blocking pool — run even for unknown usernames so
//! timing does not disclose which usernames exist — then the second
//! factor, and only then session issuance.

use serde_json::json;

use crate::crypto::{self, totp};
use crate::error::GatewayError;
use crate::server::http::{
    constant_time_eq, cookie_max_age_secs, session_cookie, Request, Response,
};
use crate::server::Gateway;
use crate::store::sessions::AuthSession;
use crate::{now_ms, SESSION_COOKIE};

/// Body accepted by `POST /auth/login`.
struct LoginBody {
    username: String,
    password: String,
    totp_code: Option<String>,
    backup_code: Option<String>,
}

fn parse_login_body(request: &Request) -> Result<LoginBody, GatewayError> {
    let body = request.json_body()?;
    let username = body
        .get("username")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::InvalidInput("username is required".to_string()))?
        .to_string();
    let password = body
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::InvalidInput("password is required".to_string()))?
        .to_string();
    // Empty strings from a half-filled form count as absent
    let non_empty = |key: &str| {
        body.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    Ok(LoginBody {
        username,
        password,
        totp_code: non_empty("totpCode"),
        backup_code: non_empty("backupCode"),
    })
}

/// Run scrypt verification off the request worker.
async fn verify_password_blocking(password: String, hash: String) -> Result<bool, GatewayError> {
    tokio::task::spawn_blocking(move || crypto::verify_password(&password, &hash))
        .await
        .map_err(|e| GatewayError::Fatal(format!("verification task failed: {e}")))
}

fn success_body(session: &AuthSession) -> serde_json::Value {
    json!({
        "ok": true,
        "user": {"username": session.username, "role": session.role},
        "csrfToken": session.csrf_token,
    })
}

pub async fn login(
    gateway: &Gateway,
    request: &Request,
    ip: &str,
    secure: bool,
) -> Result<Response, GatewayError> {
    let body = parse_login_body(request)?;

    // Rate limit before anything that touches disk or scrypt
    let locked_ms = gateway.limiter.check_double(ip, &body.username);
    if locked_ms > 0 {
        gateway.audit.append(
            "auth.login.locked",
            &body.username,
            ip,
            json!({"retryAfterMs": locked_ms}),
        );
        return Err(GatewayError::RateLimited { retry_after_ms: locked_ms });
    }

    let user = gateway.credentials.get(&body.username).await?;

    // Verify against the real hash or the dummy; unknown users cost the
    // same scrypt work as known ones
    let hash = user
        .as_ref()
        .map(|u| u.password_hash.clone())
        .unwrap_or_else(|| gateway.dummy_hash.clone());
    let password_ok = verify_password_blocking(body.password.clone(), hash).await?;

    let user = match user {
        Some(user) if password_ok => user,
        _ => {
            gateway.limiter.record_double_failure(ip, &body.username);
            gateway.audit.append(
                "auth.login.failed",
                &body.username,
                ip,
                json!({"reason": "password"}),
            );
            return Err(GatewayError::Unauthenticated);
        }
    };

    if user.totp_enabled() {
        match (&body.totp_code, &body.backup_code) {
            (None, None) => {
                // First round-trip of a 2FA login; no penalty, the client
                // re-submits with a code
                return Ok(Response::json(
                    401,
                    &json!({"ok": false, "error": "second factor required", "totpRequired": true}),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(GatewayError::InvalidInput(
                    "supply either totpCode or backupCode, not both".to_string(),
                ));
            }
            (Some(code), None) => {
                let secret = user.totp_secret.as_deref().ok_or_else(|| {
                    GatewayError::Fatal("2FA enabled without a stored secret".to_string())
                })?;
                match totp::verify_totp(
                    secret,
                    code,
                    user.last_used_totp_code.as_deref(),
                    now_ms() / 1000,
                ) {
                    Some(matched) => {
                        gateway
                            .credentials
                            .set_last_used_totp_code(&user.username, matched)
                            .await?;
                    }
                    None => {
                        gateway.limiter.record_double_failure(ip, &body.username);
                        gateway.audit.append(
                            "auth.login.failed",
                            &body.username,
                            ip,
                            json!({"reason": "totp"}),
                        );
                        return Err(GatewayError::Unauthenticated);
                    }
                }
            }
            (None, Some(code)) => {
                let hashes = user.backup_code_hashes.clone().unwrap_or_default();
                let input = code.clone();
                let matched = tokio::task::spawn_blocking(move || {
                    totp::verify_backup_code(&input, &hashes)
                })
                .await
                .map_err(|e| GatewayError::Fatal(format!("verification task failed: {e}")))?;
                match matched {
                    Some(index) => {
                        gateway
                            .credentials
                            .remove_backup_code_hash(&user.username, index)
                            .await?;
                    }
                    None => {
                        gateway.limiter.record_double_failure(ip, &body.username);
                        gateway.audit.append(
                            "auth.login.failed",
                            &body.username,
                            ip,
                            json!({"reason": "backupCode"}),
                        );
                        return Err(GatewayError::Unauthenticated);
                    }
                }
            }
        }
    }

    gateway.limiter.reset_double(ip, &body.username);
    let session = gateway.sessions.create(&user.username, user.role).await;
    gateway
        .audit
        .append("auth.login.success", &user.username, ip, json!({}));

    Ok(Response::json(200, &success_body(&session)).header(
        "Set-Cookie",
        &session_cookie(&session.id, secure, cookie_max_age_secs()),
    ))
}

/// Resolve the session cookie to a live session.
async fn session_from_cookie(
    gateway: &Gateway,
    request: &Request,
) -> Result<AuthSession, GatewayError> {
    let id = request
        .cookie(SESSION_COOKIE)
        .ok_or(GatewayError::Unauthenticated)?;
    gateway
        .sessions
        .get(&id)
        .await
        .ok_or(GatewayError::Unauthenticated)
}

/// Enforce the CSRF header on state-changing requests.
fn check_csrf(request: &Request, session: &AuthSession) -> Result<(), GatewayError> {
    let token = request
        .header("x-csrf-token")
        .ok_or_else(|| GatewayError::Forbidden("missing CSRF token".to_string()))?;
    if constant_time_eq(token, &session.csrf_token) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("CSRF token mismatch".to_string()))
    }
}

pub async fn me(
    gateway: &Gateway,
    request: &Request,
    secure: bool,
) -> Result<Response, GatewayError> {
    let session = session_from_cookie(gateway, request).await?;
    let refreshed = gateway
        .sessions
        .refresh(&session.id)
        .await
        .ok_or(GatewayError::Unauthenticated)?;

    Ok(Response::json(200, &success_body(&refreshed)).header(
        "Set-Cookie",
        &session_cookie(&refreshed.id, secure, cookie_max_age_secs()),
    ))
}

pub async fn refresh(
    gateway: &Gateway,
    request: &Request,
    secure: bool,
) -> Result<Response, GatewayError> {
    let session = session_from_cookie(gateway, request).await?;
    check_csrf(request, &session)?;
    let refreshed = gateway
        .sessions
        .refresh(&session.id)
        .await
        .ok_or(GatewayError::Unauthenticated)?;

    Ok(Response::json(200, &success_body(&refreshed)).header(
        "Set-Cookie",
        &session_cookie(&refreshed.id, secure, cookie_max_age_secs()),
    ))
}

/// Logout always answers 200 and clears the cookie; a live session is
/// deleted (CSRF-checked), a missing one is already logged out.
pub async fn logout(
    gateway: &Gateway,
    request: &Request,
    ip: &str,
    secure: bool,
) -> Result<Response, GatewayError> {
    if let Ok(session) = session_from_cookie(gateway, request).await {
        check_csrf(request, &session)?;
        gateway.sessions.delete_by_id(&session.id).await;
        let _ = gateway.revocations.send(session.id.clone());
        gateway
            .audit
            .append("auth.logout", &session.username, ip, json!({}));
    }

    Ok(Response::json(200, &json!({"ok": true}))
        .header("Set-Cookie", &session_cookie("", secure, 0)))
}
