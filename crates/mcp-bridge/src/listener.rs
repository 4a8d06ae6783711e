//! Callback Listener: short-lived loopback HTTP server that receives the
//! authorization-code redirect and serves followers' `/wait-for-auth` polls.
//!
//! The router shape (small `axum::Router`, routes registered with
//! `.route(...)`, `tokio::net::TcpListener::bind` + `axum::serve`) follows
//! this codebase's axum wiring in `turbomcp-proxy/src/cli/commands/serve.rs`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

/// Idle timeout: how long the listener waits for the redirect before giving
/// up and letting the Bridge Runtime surface an authorization failure.
pub const CALLBACK_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Result handed back by the callback route: either the authorization code
/// (and the `state` it arrived with, for CSRF verification) or an
/// authorization-server-reported error.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    Code { code: String, state: Option<String> },
    Error { error: String, description: Option<String> },
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct ListenerState {
    expected_state: Option<String>,
    outcome: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
    completed: tokio::sync::Notify,
}

/// A running callback listener. Dropping this aborts its server task.
pub struct CallbackListener {
    port: u16,
    outcome_rx: oneshot::Receiver<CallbackOutcome>,
    server_task: tokio::task::JoinHandle<()>,
    state: Arc<ListenerState>,
}

impl CallbackListener {
    /// Bind on `host:port` and start serving. `expected_state` is checked
    /// against the callback's `state` query parameter when present.
    pub async fn bind(
        host: &str,
        port: u16,
        expected_state: Option<String>,
    ) -> BridgeResult<Self> {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(ListenerState {
            expected_state,
            outcome: Mutex::new(Some(tx)),
            completed: tokio::sync::Notify::new(),
        });

        let app = Router::new()
            .route("/oauth/callback", get(handle_callback))
            .route("/wait-for-auth", get(handle_wait_for_auth))
            .with_state(state.clone());

        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| BridgeError::configuration(format!("invalid listener address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::configuration(format!("failed to bind callback listener: {e}")))?;
        let bound_port = listener.local_addr()?.port();

        let state_for_task = state.clone();
        let server_task = tokio::spawn(async move {
            let serve = axum::serve(listener, app);
            tokio::select! {
                result = serve => {
                    if let Err(e) = result {
                        warn!("callback listener server error: {e}");
                    }
                }
                () = state_for_task.completed.notified() => {
                    debug!("callback listener shutting down after completion");
                }
                () = tokio::time::sleep(CALLBACK_IDLE_TIMEOUT) => {
                    warn!("callback listener idle timeout reached");
                }
            }
        });

        info!(port = bound_port, "callback listener bound");
        Ok(Self {
            port: bound_port,
            outcome_rx: rx,
            server_task,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the redirect to arrive, up to the idle timeout.
    pub async fn wait_for_code(self) -> BridgeResult<CallbackOutcome> {
        let outcome = tokio::time::timeout(CALLBACK_IDLE_TIMEOUT, self.outcome_rx)
            .await
            .map_err(|_| BridgeError::authorization("timed out waiting for authorization redirect"))?
            .map_err(|_| BridgeError::authorization("callback listener closed unexpectedly"))?;
        self.state.completed.notify_waiters();
        let _ = self.server_task.await;
        Ok(outcome)
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn handle_callback(
    State(state): State<Arc<ListenerState>>,
    Query(query): Query<CallbackQuery>,
) -> impl IntoResponse {
    if let Some(error) = query.error {
        let outcome = CallbackOutcome::Error {
            error,
            description: query.error_description,
        };
        deliver(&state, outcome);
        return (
            StatusCode::OK,
            Html("<html><body>Authorization failed. You may close this tab.</body></html>"),
        );
    }

    let Some(code) = query.code else {
        return (
            StatusCode::BAD_REQUEST,
            Html("<html><body>Missing authorization code.</body></html>"),
        );
    };

    if let (Some(expected), Some(got)) = (&state.expected_state, &query.state) {
        if expected != got {
            deliver(
                &state,
                CallbackOutcome::Error {
                    error: "state_mismatch".to_string(),
                    description: Some("CSRF state parameter did not match".to_string()),
                },
            );
            return (
                StatusCode::BAD_REQUEST,
                Html("<html><body>State mismatch. You may close this tab.</body></html>"),
            );
        }
    }

    deliver(
        &state,
        CallbackOutcome::Code {
            code,
            state: query.state,
        },
    );
    (
        StatusCode::OK,
        Html("<html><body>Authorization complete. You may close this tab.</body></html>"),
    )
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(rename = "pollId")]
    #[allow(dead_code)]
    poll_id: Option<String>,
}

/// Followers poll this endpoint on the leader's bound port. `202` means
/// "not yet"; `200` means the code has been captured (followers then read
/// tokens from the Config Store rather than trusting this body).
async fn handle_wait_for_auth(
    State(state): State<Arc<ListenerState>>,
    Query(_query): Query<WaitQuery>,
) -> impl IntoResponse {
    if state.outcome.lock().is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    }
}

fn deliver(state: &ListenerState, outcome: CallbackOutcome) {
    if let Some(tx) = state.outcome.lock().take() {
        let _ = tx.send(outcome);
    }
    state.completed.notify_waiters();
}

/// Find a free TCP port starting at `desired` (0 means "any free port").
/// Scans upward on bind conflict.
pub fn find_available_port(desired: u16) -> BridgeResult<u16> {
    if desired == 0 {
        let listener = StdTcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
        return Ok(listener.local_addr()?.port());
    }

    let mut port = desired;
    loop {
        match StdTcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), port)) {
            Ok(_listener) => return Ok(port),
            Err(_) if port < u16::MAX => port += 1,
            Err(e) => {
                return Err(BridgeError::configuration(format!(
                    "no available callback port found starting at {desired}: {e}"
                )));
            }
        }
    }
}
