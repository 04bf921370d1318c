//! Control UI serving and security headers
//!
//! Every UI response carries a strict header set and a per-response CSP
//! nonce. The nonce is injected into `index.html` wherever the
//! `__CSP_NONCE__` placeholder appears, so inline bootstrap scripts run
//! while everything else stays locked down.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

use crate::error::GatewayError;
use crate::server::http::Response;
use crate::server::Gateway;

/// Placeholder replaced with the fresh nonce on every response.
const NONCE_PLACEHOLDER: &str = "__CSP_NONCE__";

/// Minimal page served when no UI bundle is installed.
const FALLBACK_INDEX: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>OpenClaw Gateway</title></head>
<body>
<h1>OpenClaw Gateway</h1>
<p>The gateway is running. Install the Control UI bundle to use the browser interface.</p>
<script nonce="__CSP_NONCE__">/* bootstrap placeholder */</script>
</body>
</html>
"#;

fn fresh_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// The fixed header set for UI responses, parameterised by the nonce.
fn security_headers(nonce: &str) -> Vec<(String, String)> {
    let csp = format!(
        "default-src 'self'; script-src 'self' 'nonce-{nonce}'; style-src 'self' 'unsafe-inline'; \
         img-src 'self' data: blob:; connect-src 'self' ws: wss:; frame-ancestors 'none'"
    );
    vec![
        ("Content-Security-Policy".to_string(), csp),
        ("X-Frame-Options".to_string(), "DENY".to_string()),
        ("X-XSS-Protection".to_string(), "0".to_string()),
        (
            "Permissions-Policy".to_string(),
            "camera=(), microphone=(self), geolocation=(), payment=()".to_string(),
        ),
    ]
}

/// Serve `index.html` with headers and an injected nonce.
pub async fn serve_index(gateway: &Gateway) -> Result<Response, GatewayError> {
    let template = match &gateway.config.ui_dir {
        Some(dir) => tokio::fs::read_to_string(dir.join("index.html"))
            .await
            .unwrap_or_else(|_| FALLBACK_INDEX.to_string()),
        None => FALLBACK_INDEX.to_string(),
    };

    let nonce = fresh_nonce();
    let body = template.replace(NONCE_PLACEHOLDER, &nonce);

    let mut response = Response::html(200, body);
    for (name, value) in security_headers(&nonce) {
        response = response.header(&name, &value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::GatewayConfig;
    use tempfile::TempDir;

    async fn test_gateway(dir: &TempDir) -> std::sync::Arc<Gateway> {
        let config = GatewayConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        Gateway::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_headers_present() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir).await;
        let response = serve_index(&gateway).await.unwrap();

        let get = |name: &str| {
            response
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("X-Frame-Options"), "DENY");
        assert_eq!(get("X-XSS-Protection"), "0");
        assert!(get("Permissions-Policy").contains("camera=()"));
        assert!(get("Permissions-Policy").contains("microphone=(self)"));

        let csp = get("Content-Security-Policy");
        assert!(csp.contains("frame-ancestors 'none'"));
        assert!(csp.contains("connect-src 'self' ws: wss:"));
        assert!(csp.contains("img-src 'self' data: blob:"));
        assert!(csp.contains("'nonce-"));
    }

    #[tokio::test]
    async fn test_nonce_injected_and_fresh() {
        let dir = TempDir::new().unwrap();
        let gateway = test_gateway(&dir).await;

        let first = serve_index(&gateway).await.unwrap();
        let second = serve_index(&gateway).await.unwrap();

        let body_first = String::from_utf8(first.body.clone()).unwrap();
        assert!(!body_first.contains(NONCE_PLACEHOLDER));

        let nonce_of = |r: &Response| {
            r.headers
                .iter()
                .find(|(k, _)| k == "Content-Security-Policy")
                .map(|(_, v)| v.split("'nonce-").nth(1).unwrap().split('\'').next().unwrap().to_string())
                .unwrap()
        };
        let n1 = nonce_of(&first);
        let n2 = nonce_of(&second);
        assert_ne!(n1, n2, "nonce must be fresh per response");
        assert!(body_first.contains(&n1), "body carries the same nonce as the header");
    }

    #[tokio::test]
    async fn test_custom_ui_dir() {
        let dir = TempDir::new().unwrap();
        let ui_dir = dir.path().join("ui");
        std::fs::create_dir_all(&ui_dir).unwrap();
        std::fs::write(
            ui_dir.join("index.html"),
            "<html><script nonce=\"__CSP_NONCE__\">app()</script></html>",
        )
        .unwrap();

        let config = GatewayConfig {
            state_dir: dir.path().to_path_buf(),
            ui_dir: Some(ui_dir),
            ..Default::default()
        };
        let gateway = Gateway::new(config).await.unwrap();
        let response = serve_index(&gateway).await.unwrap();
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("app()"));
        assert!(!body.contains(NONCE_PLACEHOLDER));
    }
}
