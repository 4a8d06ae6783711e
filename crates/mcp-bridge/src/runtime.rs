//! Bridge Runtime: wires the Config Store, Auth Coordinator, OAuth Provider,
//! Callback Listener, and Transport Selector into the stdio<->remote relay
//! described in the design.
//!
//! The stdio side's line-reading discipline (`BufReader::read_line`,
//! `MAX_LINE_SIZE`, flush-after-write) follows `StdioFrontend` in
//! `turbomcp-proxy/src/proxy/frontends/stdio.rs`, but unlike that frontend
//! this one never parses `method`/`params` — each line is forwarded as an
//! opaque `serde_json::Value`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::coordinator::{AuthCoordinator, Role};
use crate::error::{BridgeError, BridgeResult};
use crate::hash::ServerHash;
use crate::listener::CallbackListener;
use crate::oauth::discover_metadata;
use crate::oauth::provider::{OAuthProvider, StaticOAuthConfig};
use crate::store::records::ServerUrl;
use crate::store::{FileConfigStore, InvalidateScope, ServerRecords};
use crate::transport::{ActiveTransport, SelectorState, TransportSelector};

/// Maximum line size accepted from stdin, matching the proxy crate's own
/// stdio frontend limit.
const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;
const FOLLOWER_POLL_INTERVAL: Duration = Duration::from_secs(30);
const FOLLOWER_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How many full backoff rounds (each round tries every candidate in the
/// transport strategy once) to endure before giving up on a connection.
const MAX_CONNECT_ATTEMPTS: u32 = 8;

pub struct BridgeRuntime {
    config: BridgeConfig,
    store: Arc<FileConfigStore>,
    http: reqwest::Client,
}

impl BridgeRuntime {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let store = Arc::new(FileConfigStore::resolve()?);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(BridgeError::Transport)?;

        match crate::store::prune_stale_servers(store.as_ref()) {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "removed stale server config directories"),
            Err(e) => warn!(error = %e, "failed to prune stale server config directories"),
        }

        Ok(Self { config, store, http })
    }

    pub async fn run(self) -> BridgeResult<()> {
        let hash = ServerHash::new(&self.config.server_url);
        ServerRecords::new(self.store.as_ref(), hash.clone())
            .save_server_url(&ServerUrl(self.config.server_url.clone()))?;

        tokio::select! {
            result = self.authorize_and_relay(&hash) => result,
            () = wait_for_shutdown_signal() => {
                info!("shutdown signal received, stopping bridge");
                Err(BridgeError::Cancelled)
            }
        }
    }

    /// Drive authorization and the relay loop, retrying the authorization
    /// step exactly once (with credentials invalidated first) if either
    /// phase reports an auth error.
    async fn authorize_and_relay(&self, hash: &ServerHash) -> BridgeResult<()> {
        let extra_headers = self.header_map()?;

        match self.ensure_tokens(hash).await {
            Ok(access_token) => match self.relay(hash, extra_headers.clone(), access_token).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_auth_error() => {
                    warn!("session rejected mid-flight, invalidating credentials and retrying once");
                    self.invalidate(hash, InvalidateScope::Tokens)?;
                    self.reauthorize_and_relay(hash, extra_headers).await
                }
                Err(e) => Err(e),
            },
            Err(e) if e.is_auth_error() => {
                warn!("authorization failed, invalidating credentials and retrying once");
                self.invalidate(hash, InvalidateScope::Tokens)?;
                self.reauthorize_and_relay(hash, extra_headers).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reauthorize_and_relay(&self, hash: &ServerHash, extra_headers: HeaderMap) -> BridgeResult<()> {
        match self.ensure_tokens(hash).await {
            Ok(access_token) => self.relay(hash, extra_headers, access_token).await,
            Err(e) => Err(BridgeError::authorization_fatal(e.to_string())),
        }
    }

    fn header_map(&self) -> BridgeResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| BridgeError::configuration(format!("invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BridgeError::configuration(format!("invalid header value for {key}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn invalidate(&self, hash: &ServerHash, scope: InvalidateScope) -> BridgeResult<()> {
        let provider = self.provider(hash.clone(), self.config.callback_port);
        provider.invalidate(scope)
    }

    /// `redirect_port` is the listener's actual bound port, which may differ
    /// from `self.config.callback_port` when the operator asked for "any
    /// free port" (port 0) and the coordinator/listener picked one.
    fn provider(&self, hash: ServerHash, redirect_port: u16) -> OAuthProvider<'_, FileConfigStore> {
        let redirect_uri = format!(
            "http://{}:{}/oauth/callback",
            self.config.host, redirect_port
        );
        let static_config = StaticOAuthConfig {
            client_metadata: self.config.static_oauth_client_metadata.clone(),
            client_info: self.config.static_oauth_client_info.clone(),
            scopes: self.config.oauth_scopes.clone(),
            resource: self.config.authorize_resource.clone(),
        };
        OAuthProvider::new(self.store.as_ref(), hash, self.http.clone(), redirect_uri, static_config)
    }

    /// Resolve the access token to use for this session: an existing valid
    /// token, a silently refreshed one, or the result of driving (or
    /// following) the interactive authorization flow.
    async fn ensure_tokens(&self, hash: &ServerHash) -> BridgeResult<String> {
        let provider = self.provider(hash.clone(), self.config.callback_port);
        if let Some(tokens) = provider.load_tokens() {
            if !tokens.is_expired(chrono::Utc::now()) {
                return Ok(tokens.access_token.expose_secret().to_string());
            }
            if let Some(access_token) = self.try_refresh(hash, &provider).await? {
                return Ok(access_token);
            }
        }

        let coordinator = AuthCoordinator::new(self.store.clone());
        match coordinator.coordinate(hash, self.config.callback_port)? {
            Role::Leader { port } => {
                let _guard = coordinator.lock_guard(hash);
                self.drive_authorization(hash, port).await
            }
            Role::Follower { leader_port } => self.follow_authorization(hash, leader_port).await,
        }
    }

    /// Attempt a silent refresh using the stored refresh token. Returns
    /// `Ok(None)` (rather than an error) when refresh isn't possible or
    /// fails, so the caller falls through to interactive authorization.
    async fn try_refresh(
        &self,
        hash: &ServerHash,
        provider: &OAuthProvider<'_, FileConfigStore>,
    ) -> BridgeResult<Option<String>> {
        let Some(client_info) = provider.stored_client_info() else {
            return Ok(None);
        };

        let static_endpoints = self
            .config
            .static_oauth_client_metadata
            .as_ref()
            .and_then(crate::oauth::provider::static_endpoints_from_metadata);
        let server_url = url::Url::parse(&self.config.server_url)
            .map_err(|e| BridgeError::configuration(format!("invalid server URL: {e}")))?;
        let as_metadata = match discover_metadata(&self.http, &server_url, static_endpoints.as_ref()).await {
            Ok(m) => m,
            Err(e) => {
                debug!(server_hash = %hash, error = %e, "metadata discovery failed during refresh, falling back to interactive auth");
                return Ok(None);
            }
        };

        match provider.refresh(&as_metadata, &client_info).await {
            Ok(tokens) => {
                info!(server_hash = %hash, "refreshed access token silently");
                Ok(Some(tokens.access_token.expose_secret().to_string()))
            }
            Err(e) => {
                debug!(server_hash = %hash, error = %e, "silent refresh failed, falling back to interactive auth");
                Ok(None)
            }
        }
    }

    async fn drive_authorization(&self, hash: &ServerHash, port: u16) -> BridgeResult<String> {
        let provider = self.provider(hash.clone(), port);
        let static_endpoints = self
            .config
            .static_oauth_client_metadata
            .as_ref()
            .and_then(crate::oauth::provider::static_endpoints_from_metadata);

        let server_url = url::Url::parse(&self.config.server_url)
            .map_err(|e| BridgeError::configuration(format!("invalid server URL: {e}")))?;
        let as_metadata = discover_metadata(&self.http, &server_url, static_endpoints.as_ref()).await?;

        let client_info = provider.client_information(&as_metadata).await?;
        let auth_url = provider.build_authorization_request(&as_metadata, &client_info)?;

        let listener = CallbackListener::bind(&self.config.host, port, None).await?;
        if !OAuthProvider::<FileConfigStore>::open_in_browser(&auth_url) {
            eprintln!("Open this URL to authorize the bridge:\n{auth_url}");
        }

        let outcome = listener.wait_for_code().await?;
        let code = match outcome {
            crate::listener::CallbackOutcome::Code { code, .. } => code,
            crate::listener::CallbackOutcome::Error { error, description } => {
                return Err(BridgeError::authorization(format!(
                    "authorization server denied the request: {error}{}",
                    description.map(|d| format!(" ({d})")).unwrap_or_default()
                )));
            }
        };

        let tokens = provider.exchange_code(&as_metadata, &client_info, code).await?;
        info!("authorization complete");
        Ok(tokens.access_token.expose_secret().to_string())
    }

    async fn follow_authorization(&self, hash: &ServerHash, leader_port: u16) -> BridgeResult<String> {
        let provider = self.provider(hash.clone(), leader_port);
        let deadline = tokio::time::Instant::now() + FOLLOWER_POLL_TIMEOUT;
        let poll_url = format!("http://{}:{}/wait-for-auth", self.config.host, leader_port);

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::authorization(
                    "timed out waiting for the leading process to finish authorizing",
                ));
            }
            match self.http.get(&poll_url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    if let Some(tokens) = provider.load_tokens() {
                        return Ok(tokens.access_token.expose_secret().to_string());
                    }
                }
                Ok(_) => debug!("leader still authorizing, will poll again"),
                Err(e) => debug!(error = %e, "follower poll failed, will retry"),
            }
            tokio::time::sleep(FOLLOWER_POLL_INTERVAL).await;
        }
    }

    /// Connect the transport selector, riding out its exponential backoff
    /// across transient failures instead of surfacing the first one.
    async fn connect_with_backoff(
        &self,
        selector: &mut TransportSelector,
        access_token: &str,
    ) -> BridgeResult<ActiveTransport> {
        for _ in 0..MAX_CONNECT_ATTEMPTS {
            match selector.connect(Some(access_token)).await {
                Ok(transport) => return Ok(transport),
                Err(SelectorState::Auth) => {
                    return Err(BridgeError::authorization("remote rejected the access token"));
                }
                Err(SelectorState::Backoff { attempt, delay }) => {
                    debug!(attempt, ?delay, "transport connect failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(_) => break,
            }
        }
        Err(selector.fail())
    }

    async fn relay(&self, hash: &ServerHash, extra_headers: HeaderMap, access_token: String) -> BridgeResult<()> {
        let mut selector = TransportSelector::new(
            self.config.transport_strategy,
            self.config.server_url.clone(),
            extra_headers,
        );

        let mut transport = self.connect_with_backoff(&mut selector, &access_token).await?;

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = tokio::io::stdout();
        let mut line = String::new();

        loop {
            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => {
                    match read {
                        Ok(0) => {
                            debug!("upstream stdin closed, shutting down");
                            break;
                        }
                        Ok(_) if line.len() > MAX_LINE_SIZE => {
                            warn!("dropping oversized stdin line ({} bytes)", line.len());
                            continue;
                        }
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let message: Value = match serde_json::from_str(trimmed) {
                                Ok(v) => v,
                                Err(e) => {
                                    warn!("dropping unparsable stdin line: {e}");
                                    continue;
                                }
                            };
                            match transport.send(&message, Some(&access_token)).await {
                                Ok(Some(response)) => write_line(&mut stdout, &response).await?,
                                Ok(None) => {}
                                Err(e) if e.is_auth_error() => return Err(e),
                                Err(e) => {
                                    warn!("transport send failed: {e}, reconnecting");
                                    selector.unlock();
                                    transport = self.connect_with_backoff(&mut selector, &access_token).await?;
                                }
                            }
                        }
                        Err(e) => return Err(BridgeError::Io(e)),
                    }
                }
                received = transport.recv() => {
                    match received {
                        Ok(Some(message)) => write_line(&mut stdout, &message).await?,
                        Ok(None) => {}
                        Err(e) if e.is_auth_error() => return Err(e),
                        Err(e) => {
                            warn!(server_hash = %hash, error = %e, "remote transport dropped, reconnecting");
                            selector.unlock();
                            transport = self.connect_with_backoff(&mut selector, &access_token).await?;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Resolve once either SIGINT or (on unix) SIGTERM arrives, so the runtime
/// can race it against the authorization/relay flow at the top level rather
/// than checking for cancellation inside individual loops.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, falling back to SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &Value) -> BridgeResult<()> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    stdout.write_all(&bytes).await?;
    stdout.flush().await?;
    Ok(())
}
