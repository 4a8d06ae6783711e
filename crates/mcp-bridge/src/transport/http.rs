//! HTTP-stream remote transport: one POST per outbound JSON-RPC message,
//! the response (if any) forwarded straight back to stdout.
//!
//! Connection pooling and TLS settings mirror `HttpBackend` in
//! `turbomcp-proxy/src/proxy/backends/http.rs`. The bridge never parses the
//! JSON-RPC payload's `method`/`params`; it forwards `serde_json::Value`
//! envelopes opaquely and only reads the transport-level status code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP-stream transport: a pooled client POSTing to a single remote URL.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    extra_headers: HeaderMap,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl HttpTransport {
    /// Build a transport for `url`. `extra_headers` carries operator-supplied
    /// `--header` values; the bearer token (if any) is attached per-request
    /// from the current token set instead, since it can be refreshed mid-session.
    pub fn new(url: impl Into<String>, extra_headers: HeaderMap) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .https_only(false)
            .build()
            .map_err(BridgeError::Transport)?;

        Ok(Self {
            client,
            url: url.into(),
            extra_headers,
            next_id: AtomicU64::new(1),
        })
    }

    /// Monotonic counter for messages this transport originates itself
    /// (none yet — reserved for future keepalive pings); the JSON-RPC `id`
    /// on forwarded client messages is left untouched.
    #[allow(dead_code)]
    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// POST one JSON-RPC message and return the server's JSON body, if the
    /// message was a request (notifications typically get a bare 202/204
    /// with no body, which surfaces here as `None`).
    pub async fn send(&self, message: &Value, access_token: Option<&str>) -> BridgeResult<Option<Value>> {
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.extra_headers.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream");

        if let Some(token) = access_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BridgeError::configuration(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.json(message).send().await.map_err(|e| {
            debug!(url = %self.url, error = %e, "http transport request failed");
            BridgeError::Transport(e)
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::authorization(format!(
                "remote server rejected request with {status}"
            )));
        }
        if !status.is_success() {
            warn!(url = %self.url, %status, "http transport received non-success status");
            return Err(BridgeError::transport_unreachable(format!(
                "remote server responded with {status}"
            )));
        }

        if response
            .content_length()
            .map(|len| len == 0)
            .unwrap_or(false)
        {
            return Ok(None);
        }

        let bytes = response.bytes().await.map_err(BridgeError::Transport)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(&bytes)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_posts_message_and_returns_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.uri()), HeaderMap::new()).unwrap();
        let response = transport
            .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None)
            .await
            .unwrap();
        assert_eq!(response, Some(json!({"jsonrpc": "2.0", "id": 1, "result": {}})));
    }

    #[tokio::test]
    async fn send_attaches_bearer_token_when_provided() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer abc123"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.uri()), HeaderMap::new()).unwrap();
        let response = transport
            .send(&json!({"jsonrpc": "2.0", "method": "notify"}), Some("abc123"))
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn send_maps_401_to_authorization_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.uri()), HeaderMap::new()).unwrap();
        let err = transport
            .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None)
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn send_maps_5xx_to_transport_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/mcp", server.uri()), HeaderMap::new()).unwrap();
        let err = transport
            .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnreachable { .. }));
    }
}
