//! Error types for mcp-bridge
//!
//! Follows the same 3-tier shape used elsewhere in this codebase: typed
//! variants with constructor helpers, a `#[from]` boundary for the
//! underlying HTTP/OAuth/IO errors, and an `exit_code()` mapping for the
//! process boundary instead of a client-facing `sanitize()`.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Main error type for mcp-bridge.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    /// Bad CLI arguments or config (URL, headers, static client metadata).
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        key: Option<String>,
    },

    /// Local config store failure (permissions, corrupt record, disk full).
    #[error("config store error: {message}")]
    Store { message: String },

    /// Authorization flow failed in a way that warrants one retry.
    #[error("authorization error: {message}")]
    Authorization { message: String, retryable: bool },

    /// Authorization failed a second time, or the server rejected registration twice.
    #[error("authorization failed permanently: {message}")]
    AuthorizationFatal { message: String },

    /// Remote transport could not be reached after retries.
    #[error("transport unreachable: {message}")]
    TransportUnreachable { message: String },

    /// A single transport attempt failed; the selector decides whether to retry.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// OAuth2 request/exchange failure from the `oauth2` crate.
    #[error("oauth error: {0}")]
    OAuth(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O failure (stdio, config files, callback listener bind).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancellation (SIGINT, upstream EOF) — not a failure, but modeled as an
    /// error so the runtime has one return path out of its select loop.
    #[error("cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: None,
        }
    }

    pub fn configuration_with_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn authorization_fatal(message: impl Into<String>) -> Self {
        Self::AuthorizationFatal {
            message: message.into(),
        }
    }

    pub fn transport_unreachable(message: impl Into<String>) -> Self {
        Self::TransportUnreachable {
            message: message.into(),
        }
    }

    pub fn oauth(message: impl std::fmt::Display) -> Self {
        Self::OAuth(message.to_string())
    }

    /// Whether the bridge runtime should retry this error once before
    /// treating it as fatal, per the error taxonomy's disposition column.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::TransportUnreachable { .. }
                | Self::Authorization { retryable: true, .. }
        )
    }

    /// Whether this error should cause the bridge to re-run the authorization
    /// flow (as opposed to just retrying the transport connection).
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Authorization { .. } | Self::AuthorizationFatal { .. })
    }

    /// Exit code for this error per the bridge's CLI contract: 0 normal,
    /// 1 config error, 2 auth failure, 3 transport unreachable.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => 0,
            Self::Configuration { .. } | Self::Store { .. } => 1,
            Self::Authorization { .. } | Self::AuthorizationFatal { .. } => 2,
            Self::TransportUnreachable { .. } | Self::Transport(_) => 3,
            Self::OAuth(_) => 2,
            Self::Serialization(_) | Self::Io(_) => 1,
        }
    }
}

/// Extension trait mirroring `turbomcp-proxy`'s `ProxyErrorExt`: attach a
/// short operation label to an arbitrary error on its way into `BridgeError`.
pub trait BridgeErrorExt<T> {
    fn store_context(self, context: impl Into<String>) -> BridgeResult<T>;
    fn config_context(self, context: impl Into<String>) -> BridgeResult<T>;
}

impl<T, E> BridgeErrorExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn store_context(self, context: impl Into<String>) -> BridgeResult<T> {
        self.map_err(|e| BridgeError::store(format!("{}: {e}", context.into())))
    }

    fn config_context(self, context: impl Into<String>) -> BridgeResult<T> {
        self.map_err(|e| BridgeError::configuration_with_key(e.to_string(), context.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(BridgeError::configuration("bad url").exit_code(), 1);
        assert_eq!(BridgeError::authorization("denied").exit_code(), 2);
        assert_eq!(
            BridgeError::authorization_fatal("denied twice").exit_code(),
            2
        );
        assert_eq!(
            BridgeError::transport_unreachable("refused").exit_code(),
            3
        );
        assert_eq!(BridgeError::Cancelled.exit_code(), 0);
    }

    #[test]
    fn retryable_classification() {
        assert!(BridgeError::authorization("expired").is_retryable());
        assert!(!BridgeError::authorization_fatal("denied").is_retryable());
        assert!(BridgeError::transport_unreachable("down").is_retryable());
        assert!(!BridgeError::configuration("bad").is_retryable());
    }

    #[test]
    fn store_context_wraps_message() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk full"));
        let wrapped = result.store_context("writing tokens");
        match wrapped.unwrap_err() {
            BridgeError::Store { message } => {
                assert!(message.contains("writing tokens"));
                assert!(message.contains("disk full"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
