//! RFC 7591 dynamic client registration.
//!
//! Adapted from `turbomcp-auth`'s `oauth2::dcr` module: same request/response
//! shapes, trimmed to the fields a public PKCE client actually sends, and
//! the scope-extraction logic the bridge needs (`redirect_to_authorization`
//! is not a DCR concern, so that half of the teacher's `DcrBuilder` fluent
//! API is dropped here).

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub redirect_uris: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl RegistrationRequest {
    /// Build the registration request for a native/CLI public client using
    /// PKCE: no client secret, authorization-code + refresh-token grants.
    pub fn public_pkce_client(redirect_uri: String, scope: Option<String>) -> Self {
        Self {
            redirect_uris: vec![redirect_uri],
            token_endpoint_auth_method: "none".to_string(),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            client_name: Some("mcp-bridge".to_string()),
            scope,
        }
    }
}

/// Dynamic shape of a registration response: scope can arrive as `scope`,
/// `default_scope`, `scopes[]`, or `default_scopes[]` (joined with spaces),
/// or be entirely absent. Fields beyond `client_id`/`client_secret` that the
/// bridge doesn't name explicitly are kept as forward-compatible extras.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Option<Vec<String>>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub default_scope: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub default_scopes: Option<Vec<String>>,
}

impl RegistrationResponse {
    /// Extract a non-empty scope string in priority order, falling back to
    /// the bridge's default scope set when the server reports none at all.
    pub fn extract_scope(&self) -> String {
        if let Some(s) = &self.scope {
            if !s.is_empty() {
                return s.clone();
            }
        }
        if let Some(s) = &self.default_scope {
            if !s.is_empty() {
                return s.clone();
            }
        }
        if let Some(v) = &self.scopes {
            if !v.is_empty() {
                return v.join(" ");
            }
        }
        if let Some(v) = &self.default_scopes {
            if !v.is_empty() {
                return v.join(" ");
            }
        }
        crate::store::records::Scopes::DEFAULT.to_string()
    }
}

/// Thin RFC 7591 client over `reqwest`, mirroring `turbomcp-auth::DcrClient`.
pub struct DcrClient {
    http: reqwest::Client,
    registration_endpoint: String,
}

impl DcrClient {
    pub fn new(http: reqwest::Client, registration_endpoint: String) -> Self {
        Self {
            http,
            registration_endpoint,
        }
    }

    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse, BridgeError> {
        let response = self
            .http
            .post(&self.registration_endpoint)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::authorization(format!(
                "client registration failed with {status}: {body}"
            )));
        }

        Ok(response.json::<RegistrationResponse>().await?)
    }
}
