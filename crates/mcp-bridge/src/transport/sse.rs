//! SSE remote transport: a long-lived `GET` with `Accept: text/event-stream`
//! for server → client messages, paired with a POST endpoint for the
//! opposite direction.
//!
//! The event-framing loop (buffer chunks, split on a blank line, read `data:`
//! lines) follows `HttpSseClientTransport::sse_connection_task` in
//! `turbomcp-transport/src/http_sse_client.rs`. Reconnection itself is left
//! to the Transport Selector's backoff state machine: this module reports a
//! closed stream as the channel closing, rather than retrying internally.

use std::collections::HashMap;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A single open SSE connection. `recv()` yields parsed `data:` payloads in
/// arrival order; `send()` POSTs an outbound message to the companion
/// endpoint. The connection is considered closed once `recv()` returns
/// `None`.
pub struct SseTransport {
    client: reqwest::Client,
    post_url: String,
    extra_headers: HeaderMap,
    events: Mutex<mpsc::Receiver<BridgeResult<Value>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("post_url", &self.post_url)
            .finish()
    }
}

impl SseTransport {
    /// Open the SSE stream at `sse_url` and prepare to post outbound
    /// messages to `post_url` (often the same URL; the streamable-HTTP
    /// pattern uses one endpoint for both directions).
    pub async fn connect(
        sse_url: impl Into<String>,
        post_url: impl Into<String>,
        extra_headers: HeaderMap,
        access_token: Option<&str>,
    ) -> BridgeResult<Self> {
        let sse_url = sse_url.into();
        let post_url = post_url.into();
        let client = reqwest::Client::builder()
            .build()
            .map_err(BridgeError::Transport)?;

        let mut request = client
            .get(&sse_url)
            .headers(extra_headers.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if let Some(token) = access_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BridgeError::configuration(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await.map_err(BridgeError::Transport)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::authorization(format!(
                "remote server rejected SSE connection with {status}"
            )));
        }
        if !status.is_success() {
            return Err(BridgeError::transport_unreachable(format!(
                "SSE connection failed with status {status}"
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(stream_events(response, tx));

        Ok(Self {
            client,
            post_url,
            extra_headers,
            events: Mutex::new(rx),
            _task: task,
        })
    }

    /// Receive the next server-pushed message, or `None` once the stream has
    /// closed (the selector treats this as a transport failure to retry).
    /// Takes `&self` (the receiver is behind a mutex) so it can be polled
    /// alongside `send` in the same `select!` without conflicting borrows.
    pub async fn recv(&self) -> BridgeResult<Option<Value>> {
        match self.events.lock().await.recv().await {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// POST an outbound message to the companion endpoint.
    pub async fn send(&self, message: &Value, access_token: Option<&str>) -> BridgeResult<()> {
        let mut request = self
            .client
            .post(&self.post_url)
            .headers(self.extra_headers.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = access_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BridgeError::configuration(format!("invalid bearer token: {e}")))?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.json(message).send().await.map_err(BridgeError::Transport)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BridgeError::authorization(format!(
                "remote server rejected outbound message with {status}"
            )));
        }
        if !status.is_success() {
            return Err(BridgeError::transport_unreachable(format!(
                "outbound post failed with status {status}"
            )));
        }
        Ok(())
    }
}

async fn stream_events(response: reqwest::Response, tx: mpsc::Sender<BridgeResult<Value>>) {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx.send(Err(BridgeError::Transport(e))).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);
            if let Some(value) = parse_event(&event) {
                if tx.send(Ok(value)).await.is_err() {
                    return;
                }
            }
        }
    }
    debug!("sse stream ended");
}

/// Parse one `\n`-separated SSE event block into its `data:` JSON payload.
/// Multi-line `data:` fields are joined with `\n` per the SSE spec; events
/// with no `data:` line (e.g. bare `:` keep-alive comments) are dropped.
fn parse_event(block: &str) -> Option<Value> {
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "dropping unparsable sse event");
            None
        }
    }
}

#[allow(dead_code)]
fn headers_from_map(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in map {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_event_joins_multiline_data() {
        let block = "event: message\ndata: {\"jsonrpc\":\ndata: \"2.0\"}";
        let value = parse_event(block);
        assert!(value.is_none(), "this particular split isn't valid JSON once joined");
    }

    #[test]
    fn parse_event_reads_single_line_data() {
        let block = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}";
        let value = parse_event(block).unwrap();
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn parse_event_returns_none_for_comment_only_block() {
        let block = ": keep-alive";
        assert!(parse_event(block).is_none());
    }

    #[tokio::test]
    async fn connect_surfaces_non_success_status_as_transport_unreachable() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = SseTransport::connect(server.uri(), server.uri(), HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnreachable { .. }));
    }

    #[tokio::test]
    async fn connect_surfaces_401_as_authorization_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = SseTransport::connect(server.uri(), server.uri(), HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
    }
}
