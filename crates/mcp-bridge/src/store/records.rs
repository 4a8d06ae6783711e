//! Record types persisted per server hash under the config root.
//!
//! Shapes mirror RFC 7591 registration responses and OAuth token responses,
//! the same fields `turbomcp-auth`'s `RegistrationResponse`/`TokenInfo` carry,
//! but with `expires_in` normalized to an absolute instant at write time:
//! `tokens.expires_at` is always absolute, never a relative duration.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Dynamic-registration result, persisted so the bridge doesn't re-register
/// on every launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub client_secret: Option<SecretString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Token set, normalized to an absolute expiry. `access_token` and
/// `refresh_token` are wrapped in `SecretString` so a stray `{:?}` on this
/// type (logging, panics) doesn't print the bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub access_token: SecretString,
    pub token_type: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_secret",
        deserialize_with = "deserialize_optional_secret"
    )]
    pub refresh_token: Option<SecretString>,
    /// Absolute expiry instant. Absent means "no expiry reported"; the
    /// bridge treats that as "refresh reactively on 401" rather than
    /// proactively.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(SecretString::new(s))
}

fn serialize_optional_secret<S>(
    secret: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    Ok(s.map(SecretString::new))
}

impl Tokens {
    /// Build a `Tokens` record from a relative `expires_in` duration reported
    /// by the token endpoint, normalizing to an absolute instant taken at
    /// `issued_at` (usually "now", threaded through so tests are deterministic).
    pub fn from_relative(
        access_token: String,
        token_type: String,
        refresh_token: Option<String>,
        expires_in: Option<std::time::Duration>,
        scope: Option<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: SecretString::new(access_token),
            token_type,
            refresh_token: refresh_token.map(SecretString::new),
            expires_at: expires_in.and_then(|d| {
                chrono::Duration::from_std(d)
                    .ok()
                    .map(|d| issued_at + d)
            }),
            scope,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// PKCE code verifier, kept only while a redirect is outstanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeVerifier(pub String);

/// The server URL a hash was computed from, persisted alongside the other
/// per-server records so a startup sweep can tell whether a stored hash
/// still corresponds to a live config (see `store::prune_stale_servers`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerUrl(pub String);

/// Negotiated scope string, stored separately from `client_info` so it
/// survives a client re-registration (see `ClientInfo.scope` for the
/// as-registered value; this one is the bridge's working value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scopes(pub String);

impl Scopes {
    pub const DEFAULT: &'static str = "openid email profile";
}

/// Lockfile contents: identifies which process is driving the auth flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub pid: u32,
    pub callback_port: u16,
    pub created_at: DateTime<Utc>,
}

impl Lock {
    /// Whether the lock is still "live": the owning process exists and the
    /// lock is younger than the staleness window (default 30 minutes).
    pub fn is_stale(&self, now: DateTime<Utc>, staleness_window: chrono::Duration) -> bool {
        if now - self.created_at > staleness_window {
            return true;
        }
        !process_exists(self.pid)
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    // Signal 0 performs no action but still validates the PID exists and is
    // reachable, the standard liveness probe on POSIX systems.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    // Non-POSIX platforms have no direct equivalent reachable without an
    // extra dependency; treat the lock as live and rely on the staleness
    // window alone to reclaim it.
    true
}
