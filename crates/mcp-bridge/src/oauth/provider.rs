//! OAuth Provider: the callback contract the bridge drives the authorization
//! flow through — metadata, redirect, token/verifier persistence, and
//! invalidation.
//!
//! PKCE mechanics (challenge generation, code exchange, refresh) mirror
//! `turbomcp-auth`'s `OAuth2Client`: `PkceCodeChallenge::new_random_sha256`,
//! `exchange_code().set_pkce_verifier(...).request_async(...)`, and
//! `exchange_refresh_token(...)`. Unlike that client, endpoints are resolved
//! per call from discovered/static metadata rather than from a fixed
//! provider table, since the bridge talks to an arbitrary MCP server's
//! authorization server rather than a known consumer IdP.

use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicTokenType},
};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::hash::ServerHash;
use crate::oauth::dcr::{DcrClient, RegistrationRequest};
use crate::oauth::metadata::{AuthorizationServerMetadata, StaticEndpoints};
use crate::oauth::sanitize::sanitize_authorization_url;
use crate::store::records::{ClientInfo, CodeVerifier, Scopes, Tokens};
use crate::store::{ConfigStore, InvalidateScope, ServerRecords};

type PkceClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Operator-supplied overrides that bypass discovery/registration.
#[derive(Debug, Clone, Default)]
pub struct StaticOAuthConfig {
    pub client_metadata: Option<serde_json::Value>,
    pub client_info: Option<serde_json::Value>,
    pub scopes: Option<String>,
    pub resource: Option<String>,
}

/// Drives one server's OAuth lifecycle: discovery, registration, the
/// authorization-code + PKCE exchange, refresh, and invalidation.
pub struct OAuthProvider<'a, S: ConfigStore> {
    records: ServerRecords<'a, S>,
    http: reqwest::Client,
    redirect_uri: String,
    config: StaticOAuthConfig,
}

impl<'a, S: ConfigStore> OAuthProvider<'a, S> {
    pub fn new(
        store: &'a S,
        hash: ServerHash,
        http: reqwest::Client,
        redirect_uri: String,
        config: StaticOAuthConfig,
    ) -> Self {
        Self {
            records: ServerRecords::new(store, hash),
            http,
            redirect_uri,
            config,
        }
    }

    /// Build the dynamic-registration payload: defaults, deep-merged with
    /// operator-supplied `static_client_metadata`.
    pub fn client_metadata(&self) -> RegistrationRequest {
        let scope = self.resolve_scope();
        let mut request =
            RegistrationRequest::public_pkce_client(self.redirect_uri.clone(), Some(scope));

        if let Some(overrides) = &self.config.client_metadata {
            if let Some(name) = overrides.get("client_name").and_then(|v| v.as_str()) {
                request.client_name = Some(name.to_string());
            }
            if let Some(scope) = overrides.get("scope").and_then(|v| v.as_str()) {
                request.scope = Some(scope.to_string());
            }
            if let Some(uris) = overrides.get("redirect_uris").and_then(|v| v.as_array()) {
                request.redirect_uris = uris
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }
        request
    }

    fn resolve_scope(&self) -> String {
        if let Some(scopes) = &self.config.scopes {
            return scopes.clone();
        }
        if let Some(scopes) = self.records.scopes() {
            return scopes.0;
        }
        Scopes::DEFAULT.to_string()
    }

    /// Load existing registration, registering via DCR if absent.
    pub async fn client_information(
        &self,
        as_metadata: &AuthorizationServerMetadata,
    ) -> BridgeResult<ClientInfo> {
        if let Some(info) = self.records.client_info() {
            if let Some(scope) = &info.scope {
                self.records.save_scopes(&Scopes(scope.clone()))?;
            }
            return Ok(info);
        }

        if let Some(static_info) = &self.config.client_info {
            let info = ClientInfo {
                client_id: static_info
                    .get("client_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        BridgeError::configuration("static client info missing client_id")
                    })?
                    .to_string(),
                client_secret: static_info
                    .get("client_secret")
                    .and_then(|v| v.as_str())
                    .map(|s| SecretString::new(s.to_string())),
                redirect_uris: None,
                scope: self.config.scopes.clone(),
            };
            self.save_client_information(&info)?;
            return Ok(info);
        }

        let registration_endpoint = as_metadata.registration_endpoint.clone().ok_or_else(|| {
            BridgeError::configuration(
                "server has no registration_endpoint and no static client info was supplied",
            )
        })?;
        let dcr = DcrClient::new(self.http.clone(), registration_endpoint);
        let response = dcr.register(self.client_metadata()).await?;
        let scope = response.extract_scope();

        let info = ClientInfo {
            client_id: response.client_id,
            client_secret: response.client_secret.map(SecretString::new),
            redirect_uris: response.redirect_uris,
            scope: Some(scope),
        };
        self.save_client_information(&info)?;
        Ok(info)
    }

    fn save_client_information(&self, info: &ClientInfo) -> BridgeResult<()> {
        self.records.save_client_info(info)?;
        if let Some(scope) = &info.scope {
            self.records.save_scopes(&Scopes(scope.clone()))?;
        }
        Ok(())
    }

    fn build_pkce_client(
        &self,
        as_metadata: &AuthorizationServerMetadata,
        client_info: &ClientInfo,
    ) -> BridgeResult<PkceClient> {
        let auth_url = AuthUrl::new(as_metadata.authorization_endpoint.clone())
            .map_err(|e| BridgeError::configuration(format!("invalid authorization endpoint: {e}")))?;
        let token_url = TokenUrl::new(as_metadata.token_endpoint.clone())
            .map_err(|e| BridgeError::configuration(format!("invalid token endpoint: {e}")))?;
        let redirect_url = RedirectUrl::new(self.redirect_uri.clone())
            .map_err(|e| BridgeError::configuration(format!("invalid redirect URI: {e}")))?;

        let mut client = BasicClient::new(ClientId::new(client_info.client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        if let Some(secret) = &client_info.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.expose_secret().to_string()));
        }

        Ok(client)
    }

    /// Build the sanitized authorization URL and persist the PKCE verifier.
    /// The caller is expected to open this URL in a browser (see
    /// `open_in_browser`).
    pub fn build_authorization_request(
        &self,
        as_metadata: &AuthorizationServerMetadata,
        client_info: &ClientInfo,
    ) -> BridgeResult<String> {
        let client = self.build_pkce_client(as_metadata, client_info)?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let scope = self.resolve_scope();

        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(scope.split_whitespace().map(|s| Scope::new(s.to_string())))
            .set_pkce_challenge(pkce_challenge);
        if let Some(resource) = &self.config.resource {
            request = request.add_extra_param("resource", resource.clone());
        }
        let (auth_url, _csrf_token) = request.url();

        self.records
            .save_code_verifier(&CodeVerifier(pkce_verifier.secret().to_string()))?;

        sanitize_authorization_url(auth_url.as_str())
    }

    /// Open `url` in the system browser; on failure, the caller is expected
    /// to print it to stderr so the user can paste it manually (handled by
    /// the runtime, since this module has no stderr-writing concern of its
    /// own beyond logging).
    pub fn open_in_browser(url: &str) -> bool {
        match webbrowser::open(url) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to open browser for authorization URL: {e}");
                false
            }
        }
    }

    /// Exchange the authorization code for tokens, using the persisted PKCE
    /// verifier, and persist the resulting tokens.
    pub async fn exchange_code(
        &self,
        as_metadata: &AuthorizationServerMetadata,
        client_info: &ClientInfo,
        code: String,
    ) -> BridgeResult<Tokens> {
        let verifier = self
            .records
            .code_verifier()
            .ok_or_else(|| BridgeError::authorization("no PKCE verifier on record for this server"))?;

        let client = self.build_pkce_client(as_metadata, client_info)?;
        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier.0))
            .request_async(&self.http)
            .await
            .map_err(|e| BridgeError::oauth(format!("token exchange failed: {e}")))?;

        let tokens = token_response_to_tokens(&response);
        self.records.save_tokens(&tokens)?;
        self.records.delete_code_verifier()?;
        info!("obtained access token via authorization code exchange");
        Ok(tokens)
    }

    /// Refresh the access token using the stored refresh token.
    pub async fn refresh(
        &self,
        as_metadata: &AuthorizationServerMetadata,
        client_info: &ClientInfo,
    ) -> BridgeResult<Tokens> {
        let current = self
            .records
            .tokens()
            .ok_or_else(|| BridgeError::authorization("no tokens on record to refresh"))?;
        let refresh_token = current
            .refresh_token
            .as_ref()
            .ok_or_else(|| BridgeError::authorization("stored tokens have no refresh_token"))?
            .expose_secret()
            .to_string();

        let client = self.build_pkce_client(as_metadata, client_info)?;
        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&self.http)
            .await
            .map_err(|e| BridgeError::oauth(format!("token refresh failed: {e}")))?;

        let mut tokens = token_response_to_tokens(&response);
        // Per RFC 9700, the rotation is optional: keep the old refresh token
        // if the server didn't issue a new one.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(SecretString::new(refresh_token));
        }
        self.records.save_tokens(&tokens)?;
        debug!("refreshed access token");
        Ok(tokens)
    }

    pub fn load_tokens(&self) -> Option<Tokens> {
        self.records.tokens()
    }

    /// Load existing registration without registering via DCR if absent,
    /// used by a silent-refresh attempt that must not have side effects
    /// when there's nothing on record yet.
    pub fn stored_client_info(&self) -> Option<ClientInfo> {
        self.records.client_info()
    }

    /// Invalidate credentials per the `all` ⊇ `client` ⊇ `tokens` lattice.
    pub fn invalidate(&self, scope: InvalidateScope) -> BridgeResult<()> {
        self.records.invalidate(scope)
    }
}

fn token_response_to_tokens(
    response: &oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, BasicTokenType>,
) -> Tokens {
    let issued_at = chrono::Utc::now();
    Tokens::from_relative(
        response.access_token().secret().clone(),
        format!("{:?}", response.token_type()),
        response.refresh_token().map(|t| t.secret().clone()),
        response.expires_in(),
        response.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }),
        issued_at,
    )
}

/// Resolve `StaticEndpoints` from the operator's `--static-oauth-client-metadata`
/// JSON, if endpoints were embedded in it.
pub fn static_endpoints_from_metadata(metadata: &serde_json::Value) -> Option<StaticEndpoints> {
    let authorization_endpoint = metadata.get("authorization_endpoint")?.as_str()?.to_string();
    let token_endpoint = metadata.get("token_endpoint")?.as_str()?.to_string();
    let registration_endpoint = metadata
        .get("registration_endpoint")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(StaticEndpoints {
        authorization_endpoint,
        token_endpoint,
        registration_endpoint,
    })
}
