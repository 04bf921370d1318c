//! End-to-end auth flow against a live listener
//!
//! Drives the gateway over real sockets: login issues a cookie the very
//! next request can use, logout invalidates it, repeated failures trip
//! the progressive rate limiter, and TOTP logins reject replays.

use std::sync::Arc;

use openclaw_core::crypto;
use openclaw_core::crypto::totp;
use openclaw_core::server::{Gateway, GatewayConfig};
use openclaw_core::{now_ms, Role};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct TestServer {
    port: u16,
    gateway: Arc<Gateway>,
    _state: TempDir,
}

async fn start_server() -> TestServer {
    let state = TempDir::new().unwrap();
    let port = portpicker::pick_unused_port().expect("no free port");
    let config = GatewayConfig {
        port,
        state_dir: state.path().to_path_buf(),
        ..Default::default()
    };
    let gateway = Gateway::new(config).await.unwrap();

    let hash = crypto::hash_password("test-password-secure").unwrap();
    gateway
        .credentials
        .create("admin", hash, Role::Admin)
        .await
        .unwrap();

    tokio::spawn(Gateway::serve(Arc::clone(&gateway)));
    // Wait for the listener to come up
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    TestServer {
        port,
        gateway,
        _state: state,
    }
}

struct HttpReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: serde_json::Value,
}

impl HttpReply {
    fn header(&self, name: &str) -> Option<&str> {
        let needle = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == needle)
            .map(|(_, v)| v.as_str())
    }

    /// Cookie value from the `Set-Cookie` header.
    fn session_cookie(&self) -> Option<String> {
        let raw = self.header("set-cookie")?;
        let pair = raw.split(';').next()?;
        let (name, value) = pair.split_once('=')?;
        assert_eq!(name, "openclaw_session");
        Some(value.to_string())
    }
}

async fn send(port: u16, raw: String) -> HttpReply {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8(response).unwrap();

    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let mut lines = head.split("\r\n");
    let status: u16 = lines
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();
    let body = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);

    HttpReply {
        status,
        headers,
        body,
    }
}

fn post(path: &str, body: &serde_json::Value, extra_headers: &[(&str, &str)]) -> String {
    let body = body.to_string();
    let mut raw = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    raw.push_str(&body);
    raw
}

fn get(path: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in extra_headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    raw
}

#[tokio::test]
async fn test_login_me_logout_cycle() {
    let server = start_server().await;

    // Login sets the cookie and returns the CSRF token
    let login = send(
        server.port,
        post(
            "/auth/login",
            &serde_json::json!({"username": "admin", "password": "test-password-secure"}),
            &[],
        ),
    )
    .await;
    assert_eq!(login.status, 200);
    assert_eq!(login.body["ok"], true);
    assert_eq!(login.body["user"]["role"], "admin");
    let csrf = login.body["csrfToken"].as_str().unwrap().to_string();
    assert!(!csrf.is_empty());

    let set_cookie = login.header("set-cookie").unwrap();
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Strict"));
    assert!(set_cookie.contains("Max-Age=1800"));
    assert!(!set_cookie.contains("Secure"), "plain HTTP listener must not set Secure");
    let session_id = login.session_cookie().unwrap();

    // The cookie from the login response works on the very next request
    let cookie = format!("openclaw_session={session_id}");
    let me = send(server.port, get("/auth/me", &[("Cookie", &cookie)])).await;
    assert_eq!(me.status, 200);
    assert_eq!(me.body["user"]["username"], "admin");

    // Refresh needs the CSRF header
    let no_csrf = send(
        server.port,
        post("/auth/refresh", &serde_json::json!({}), &[("Cookie", &cookie)]),
    )
    .await;
    assert_eq!(no_csrf.status, 403);

    let refresh = send(
        server.port,
        post(
            "/auth/refresh",
            &serde_json::json!({}),
            &[("Cookie", &cookie), ("X-CSRF-Token", &csrf)],
        ),
    )
    .await;
    assert_eq!(refresh.status, 200);

    // Logout clears the cookie; the session is gone afterwards
    let logout = send(
        server.port,
        post(
            "/auth/logout",
            &serde_json::json!({}),
            &[("Cookie", &cookie), ("X-CSRF-Token", &csrf)],
        ),
    )
    .await;
    assert_eq!(logout.status, 200);
    assert!(logout.header("set-cookie").unwrap().contains("Max-Age=0"));

    let me_after = send(server.port, get("/auth/me", &[("Cookie", &cookie)])).await;
    assert_eq!(me_after.status, 401);
}

#[tokio::test]
async fn test_wrong_password_locks_out() {
    let server = start_server().await;
    let body = serde_json::json!({"username": "admin", "password": "wrong-password"});

    // Three failures are plain 401s; the tier table locks at the third
    for _ in 0..3 {
        let reply = send(server.port, post("/auth/login", &body, &[])).await;
        assert_eq!(reply.status, 401);
        assert_eq!(reply.body["ok"], false);
    }

    // The next attempt is refused before any credential work
    let locked = send(server.port, post("/auth/login", &body, &[])).await;
    assert_eq!(locked.status, 429);
    let retry_after: u64 = locked.header("retry-after").unwrap().parse().unwrap();
    assert!(retry_after >= 1 && retry_after <= 30);

    // Even the right password is refused while locked
    let good = serde_json::json!({"username": "admin", "password": "test-password-secure"});
    let still_locked = send(server.port, post("/auth/login", &good, &[])).await;
    assert_eq!(still_locked.status, 429);
}

#[tokio::test]
async fn test_unknown_user_gets_401_not_404() {
    let server = start_server().await;
    let reply = send(
        server.port,
        post(
            "/auth/login",
            &serde_json::json!({"username": "nobody", "password": "whatever-pass"}),
            &[],
        ),
    )
    .await;
    assert_eq!(reply.status, 401);
}

#[tokio::test]
async fn test_totp_login_and_replay_rejection() {
    let server = start_server().await;

    // Enrol 2FA directly through the store, as the admin CLI would
    let secret = totp::generate_totp_secret();
    server
        .gateway
        .credentials
        .set_totp_pending("admin", secret.clone(), Vec::new())
        .await
        .unwrap();
    server
        .gateway
        .credentials
        .set_totp_enabled("admin")
        .await
        .unwrap();

    // Password alone now asks for the second factor, without a penalty
    let partial = send(
        server.port,
        post(
            "/auth/login",
            &serde_json::json!({"username": "admin", "password": "test-password-secure"}),
            &[],
        ),
    )
    .await;
    assert_eq!(partial.status, 401);
    assert_eq!(partial.body["totpRequired"], true);

    let code = totp::generate_totp(&secret, now_ms() / 1000).unwrap();
    let with_code = send(
        server.port,
        post(
            "/auth/login",
            &serde_json::json!({
                "username": "admin",
                "password": "test-password-secure",
                "totpCode": code,
            }),
            &[],
        ),
    )
    .await;
    assert_eq!(with_code.status, 200);

    // Replaying the same code within the same period fails
    let replay = send(
        server.port,
        post(
            "/auth/login",
            &serde_json::json!({
                "username": "admin",
                "password": "test-password-secure",
                "totpCode": code,
            }),
            &[],
        ),
    )
    .await;
    assert_eq!(replay.status, 401);
}

#[tokio::test]
async fn test_ui_security_headers() {
    let server = start_server().await;
    let reply = send(server.port, get("/", &[])).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("x-frame-options").unwrap(), "DENY");
    assert_eq!(reply.header("x-xss-protection").unwrap(), "0");
    assert!(reply.header("content-security-policy").unwrap().contains("frame-ancestors 'none'"));
}

#[tokio::test]
async fn test_unknown_route_404() {
    let server = start_server().await;
    let reply = send(server.port, get("/definitely/not/here", &[])).await;
    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn test_websocket_channel() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    let server = start_server().await;

    // Login over HTTP to get a session cookie
    let login = send(
        server.port,
        post(
            "/auth/login",
            &serde_json::json!({"username": "admin", "password": "test-password-secure"}),
            &[],
        ),
    )
    .await;
    let session_id = login.session_cookie().unwrap();

    let mut request = format!("ws://127.0.0.1:{}/ws", server.port)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Cookie",
        format!("openclaw_session={session_id}").parse().unwrap(),
    );
    let stream = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(request, stream).await.unwrap();

    // The server announces the connection principal first
    let hello: serde_json::Value = match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected hello frame, got {other:?}"),
    };
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["user"], "admin");

    // Privileged call acts on the connection principal
    ws.send(Message::Text(
        serde_json::json!({"id": 1, "method": "user.preferences.get", "params": {}}).to_string(),
    ))
    .await
    .unwrap();
    let reply: serde_json::Value = match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected reply, got {other:?}"),
    };
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["result"]["theme"], "system");

    // Revoking the user's sessions force-closes the socket
    server.gateway.revoke_user_sessions("admin").await;
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_websocket_without_session_rejected() {
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    let server = start_server().await;
    let request = format!("ws://127.0.0.1:{}/ws", server.port)
        .into_client_request()
        .unwrap();
    let stream = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(request, stream).await.unwrap();

    // The handshake completes but the first frame is a policy-violation close
    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1008);
        }
        other => panic!("expected policy close, got {other:?}"),
    }
}
