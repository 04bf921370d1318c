//! Minimal HTTP/1.1 request and response plumbing
//!
//! The gateway terminates its own HTTP on the raw (or TLS-wrapped) stream:
//! a request line, headers up to a blank line, then an optional
//! Content-Length body. That is all the auth surface needs, and it keeps
//! the WebSocket upgrade in the same hands as the cookie check.

use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GatewayError;
use crate::store::sessions::SESSION_TTL_MS;
use crate::SESSION_COOKIE;

/// Upper bound on the header block.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// A parsed request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Header names lowercased at parse time
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        let needle = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == needle)
            .map(|(_, v)| v.as_str())
    }

    /// Value of a cookie from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.header("cookie")?;
        for pair in header.split(';') {
            let (k, v) = pair.trim().split_once('=')?;
            if k == name {
                return Some(v.to_string());
            }
        }
        None
    }

    /// Naive query-string lookup (`?token=...`), enough for the legacy
    /// WebSocket token.
    pub fn query_param(&self, name: &str) -> Option<String> {
        for pair in self.query.as_deref()?.split('&') {
            let (k, v) = pair.split_once('=')?;
            if k == name {
                return Some(v.to_string());
            }
        }
        None
    }

    pub fn json_body(&self) -> Result<serde_json::Value, GatewayError> {
        serde_json::from_slice(&self.body)
            .map_err(|_| GatewayError::InvalidInput("request body is not valid JSON".to_string()))
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// Read one request off the stream. The body is bounded by `max_body`.
pub async fn read_request<S>(stream: &mut S, max_body: usize) -> Result<Request, GatewayError>
where
    S: AsyncRead + Unpin,
{
    // Accumulate until the blank line ending the header block
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(GatewayError::InvalidInput("request headers too large".to_string()));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::InvalidInput("connection closed mid-request".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| GatewayError::InvalidInput("request headers are not UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| GatewayError::InvalidInput("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| GatewayError::InvalidInput("missing method".to_string()))?
        .to_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| GatewayError::InvalidInput("missing request target".to_string()))?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > max_body {
        return Err(GatewayError::InvalidInput("request body too large".to_string()));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::InvalidInput("connection closed mid-body".to_string()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A response under construction.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Response::new(status)
            .header("Content-Type", "application/json")
            .with_body(body)
    }

    pub fn html(status: u16, body: String) -> Self {
        Response::new(status)
            .header("Content-Type", "text/html; charset=utf-8")
            .with_body(body.into_bytes())
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serialize and write the response.
    pub async fn write_to<S>(&self, stream: &mut S) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            status_text(self.status)
        );
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        out.push_str("Connection: close\r\n\r\n");

        stream.write_all(out.as_bytes()).await?;
        stream.write_all(&self.body).await?;
        stream.flush().await
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        101 => "Switching Protocols",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        429 => "Too Many Requests",
        _ => "Internal Server Error",
    }
}

/// `Set-Cookie` value for the session cookie. `max_age` of zero clears it.
pub fn session_cookie(session_id: &str, secure: bool, max_age_secs: u64) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Default cookie lifetime in seconds, matching the session TTL.
pub fn cookie_max_age_secs() -> u64 {
    SESSION_TTL_MS / 1000
}

/// Constant-time string comparison for CSRF tokens.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Map an error to its wire response.
pub fn error_response(err: &GatewayError) -> Response {
    let status = err.http_status();
    let mut response = Response::json(
        status,
        &serde_json::json!({"ok": false, "error": err.public_message()}),
    );
    if let GatewayError::RateLimited { retry_after_ms } = err {
        let secs = retry_after_ms.div_ceil(1000);
        response = response.header("Retry-After", &secs.to_string());
    }
    response
}
