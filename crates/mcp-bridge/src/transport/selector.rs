//! Transport Selector: the state machine that decides which remote
//! transport (HTTP-stream or SSE) carries a session, with exponential
//! backoff between attempts.
//!
//! The backoff formula (base delay, multiplier, jitter, cap) follows
//! `RetryConfig::calculate_delay` in
//! `turbomcp-transport/src/robustness/retry.rs`; the state-machine shape
//! (explicit states, one active attempt at a time, "locks in" on success)
//! has no direct teacher precedent and is original to this crate.

use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::transport::http::HttpTransport;
use crate::transport::sse::SseTransport;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const BACKOFF_MULTIPLIER: f64 = 2.0;
const JITTER_FACTOR: f64 = 0.2;

/// Which transport to try first, and whether to fall back to the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStrategy {
    /// Try HTTP-stream first, fall back to SSE.
    HttpFirst,
    /// Try SSE first, fall back to HTTP-stream.
    SseFirst,
    /// HTTP-stream only, no fallback.
    HttpOnly,
    /// SSE only, no fallback.
    SseOnly,
}

impl TransportStrategy {
    /// Parse the `--transport` flag's value. Unknown values silently fall
    /// back to the default rather than erroring, per the CLI's grammar.
    pub fn parse_or_default(raw: &str) -> Self {
        match raw {
            "http-first" => Self::HttpFirst,
            "sse-first" => Self::SseFirst,
            "http-only" => Self::HttpOnly,
            "sse-only" => Self::SseOnly,
            other => {
                warn!(value = other, "unrecognized --transport value, using http-first");
                Self::HttpFirst
            }
        }
    }

    fn ordering(self) -> (Candidate, Option<Candidate>) {
        match self {
            Self::HttpFirst => (Candidate::Http, Some(Candidate::Sse)),
            Self::SseFirst => (Candidate::Sse, Some(Candidate::Http)),
            Self::HttpOnly => (Candidate::Http, None),
            Self::SseOnly => (Candidate::Sse, None),
        }
    }
}

impl Default for TransportStrategy {
    fn default() -> Self {
        Self::HttpFirst
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Http,
    Sse,
}

/// The established connection, once the selector has "locked in" on one.
pub enum ActiveTransport {
    Http(HttpTransport),
    Sse(SseTransport),
}

impl ActiveTransport {
    pub async fn send(&self, message: &Value, access_token: Option<&str>) -> BridgeResult<Option<Value>> {
        match self {
            Self::Http(t) => t.send(message, access_token).await,
            Self::Sse(t) => {
                t.send(message, access_token).await?;
                Ok(None)
            }
        }
    }

    pub async fn recv(&self) -> BridgeResult<Option<Value>> {
        match self {
            Self::Http(_) => std::future::pending().await,
            Self::Sse(t) => t.recv().await,
        }
    }
}

/// State machine outcome for one connection attempt.
#[derive(Debug)]
pub enum SelectorState {
    Ready,
    Auth,
    Backoff { attempt: u32, delay: Duration },
    Fail,
}

/// Drives the INIT -> TRY -> READY/AUTH/BACKOFF/FAIL loop described in the
/// transport design: tries the primary candidate, falls back to the
/// secondary on failure, and applies exponential backoff between full
/// rounds once both candidates (or the sole allowed one) have failed.
pub struct TransportSelector {
    strategy: TransportStrategy,
    url: String,
    extra_headers: HeaderMap,
    attempt: u32,
    locked: Option<Candidate>,
}

impl TransportSelector {
    pub fn new(strategy: TransportStrategy, url: impl Into<String>, extra_headers: HeaderMap) -> Self {
        Self {
            strategy,
            url: url.into(),
            extra_headers,
            attempt: 0,
            locked: None,
        }
    }

    /// Attempt to establish a transport, honoring the strategy's ordering
    /// and any prior lock-in. Returns the live transport on success, or the
    /// selector state describing why it failed.
    pub async fn connect(&mut self, access_token: Option<&str>) -> Result<ActiveTransport, SelectorState> {
        let (primary, fallback) = match self.locked {
            Some(Candidate::Http) => (Candidate::Http, None),
            Some(Candidate::Sse) => (Candidate::Sse, None),
            None => self.strategy.ordering(),
        };

        match self.try_candidate(primary, access_token).await {
            Ok(transport) => {
                self.on_success(primary);
                return Ok(transport);
            }
            Err(e) if e.is_auth_error() => return Err(SelectorState::Auth),
            Err(e) => warn!(candidate = ?primary, error = %e, "primary transport attempt failed"),
        }

        if let Some(fallback) = fallback {
            match self.try_candidate(fallback, access_token).await {
                Ok(transport) => {
                    self.on_success(fallback);
                    return Ok(transport);
                }
                Err(e) if e.is_auth_error() => return Err(SelectorState::Auth),
                Err(e) => warn!(candidate = ?fallback, error = %e, "fallback transport attempt failed"),
            }
        }

        self.attempt += 1;
        let delay = backoff_delay(self.attempt);
        Err(SelectorState::Backoff {
            attempt: self.attempt,
            delay,
        })
    }

    fn on_success(&mut self, candidate: Candidate) {
        self.attempt = 0;
        self.locked = Some(candidate);
        info!(candidate = ?candidate, "transport established");
    }

    async fn try_candidate(
        &self,
        candidate: Candidate,
        access_token: Option<&str>,
    ) -> BridgeResult<ActiveTransport> {
        match candidate {
            Candidate::Http => {
                let transport = HttpTransport::new(self.url.clone(), self.extra_headers.clone())?;
                Ok(ActiveTransport::Http(transport))
            }
            Candidate::Sse => {
                let transport = SseTransport::connect(
                    self.url.clone(),
                    self.url.clone(),
                    self.extra_headers.clone(),
                    access_token,
                )
                .await?;
                Ok(ActiveTransport::Sse(transport))
            }
        }
    }

    /// Reset the backoff counter, e.g. after a successful round-trip on the
    /// locked-in transport following a reconnect.
    pub fn reset_backoff(&mut self) {
        self.attempt = 0;
    }

    /// Clear the lock-in so the next `connect()` call re-enters the state
    /// machine at the strategy's primary candidate, e.g. after a live
    /// session drop rather than an initial connection failure.
    pub fn unlock(&mut self) {
        self.locked = None;
    }

    /// Give up entirely: surfaced when `max_attempts` (if the caller
    /// tracks one) has been exhausted.
    pub fn fail(&self) -> BridgeError {
        BridgeError::transport_unreachable(format!(
            "exhausted transport attempts against {} after {} rounds",
            self.url, self.attempt
        ))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return BASE_DELAY;
    }
    let delay_ms = BASE_DELAY.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32 - 1);
    let jitter = 1.0 + (fastrand::f64() - 0.5) * 2.0 * JITTER_FACTOR;
    let jittered = (delay_ms * jitter).min(MAX_DELAY.as_millis() as f64).max(0.0);
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_transport_value_falls_back_to_http_first() {
        assert_eq!(TransportStrategy::parse_or_default("carrier-pigeon"), TransportStrategy::HttpFirst);
    }

    #[test]
    fn known_transport_values_parse_exactly() {
        assert_eq!(TransportStrategy::parse_or_default("sse-only"), TransportStrategy::SseOnly);
        assert_eq!(TransportStrategy::parse_or_default("http-only"), TransportStrategy::HttpOnly);
        assert_eq!(TransportStrategy::parse_or_default("sse-first"), TransportStrategy::SseFirst);
    }

    #[test]
    fn backoff_grows_and_caps_at_max_delay() {
        let first = backoff_delay(1);
        let later = backoff_delay(10);
        assert!(first <= Duration::from_secs(2));
        assert!(later <= MAX_DELAY + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn connect_reports_backoff_when_both_candidates_unreachable() {
        let mut selector = TransportSelector::new(
            TransportStrategy::HttpFirst,
            "http://127.0.0.1:1".to_string(),
            HeaderMap::new(),
        );
        // HTTP "succeeds" at construction (it's lazy), so force SseOnly to
        // exercise a connect-time failure path instead.
        let mut sse_only = TransportSelector::new(
            TransportStrategy::SseOnly,
            "http://127.0.0.1:1".to_string(),
            HeaderMap::new(),
        );
        let result = sse_only.connect(None).await;
        assert!(matches!(result, Err(SelectorState::Backoff { .. })));
        let _ = selector.connect(None).await;
    }
}
