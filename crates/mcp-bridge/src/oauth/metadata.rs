//! Authorization-server metadata discovery (RFC 8414) with OIDC and static
//! fallbacks.
//!
//! Shape grounded on `other_examples/2ac3f4f8_prismworks-ai-prism-mcp-rs__src-auth-types.rs.rs`'s
//! `AuthorizationServerMetadata`/`ProtectedResourceMetadata`, which keep a
//! `#[serde(flatten)]` bucket for fields the struct doesn't name explicitly —
//! authorization servers routinely add vendor fields, and a strict struct
//! would throw those away or, worse, fail to deserialize.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// RFC 8414 authorization server metadata (the subset the bridge needs),
/// plus everything else the server sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

/// Statically supplied endpoints, used when discovery fails or the operator
/// passes `--static-oauth-client-metadata`/`--static-oauth-client-info`.
#[derive(Debug, Clone)]
pub struct StaticEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
}

const AS_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";
const OIDC_METADATA_PATH: &str = "/.well-known/openid-configuration";

/// Discover authorization-server metadata for `server_url`'s origin,
/// trying RFC 8414 first, then OIDC discovery, then falling back to
/// `static_endpoints` if both fail. Servers that support neither well-known
/// document are common; that is why a static fallback exists at all.
pub async fn discover(
    client: &reqwest::Client,
    server_url: &url::Url,
    static_endpoints: Option<&StaticEndpoints>,
) -> Result<AuthorizationServerMetadata, BridgeError> {
    let origin = format!(
        "{}://{}",
        server_url.scheme(),
        server_url
            .host_str()
            .ok_or_else(|| BridgeError::configuration("server URL has no host"))?
    );
    let origin = match server_url.port() {
        Some(port) => format!("{origin}:{port}"),
        None => origin,
    };

    if let Some(meta) = try_fetch(client, &format!("{origin}{AS_METADATA_PATH}")).await {
        return Ok(meta);
    }
    if let Some(meta) = try_fetch(client, &format!("{origin}{OIDC_METADATA_PATH}")).await {
        return Ok(meta);
    }

    if let Some(static_eps) = static_endpoints {
        return Ok(AuthorizationServerMetadata {
            issuer: origin,
            authorization_endpoint: static_eps.authorization_endpoint.clone(),
            token_endpoint: static_eps.token_endpoint.clone(),
            registration_endpoint: static_eps.registration_endpoint.clone(),
            revocation_endpoint: None,
            scopes_supported: None,
            additional: HashMap::new(),
        });
    }

    Err(BridgeError::configuration(format!(
        "server at {origin} supports neither RFC 8414 nor OIDC discovery, \
         and no static OAuth endpoints were supplied"
    )))
}

async fn try_fetch(client: &reqwest::Client, url: &str) -> Option<AuthorizationServerMetadata> {
    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<AuthorizationServerMetadata>().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_metadata(base: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/register"),
            "vendor_extension": "kept",
        })
    }

    #[tokio::test]
    async fn discovers_via_rfc8414() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(AS_METADATA_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_metadata(&server.uri())))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let server_url = url::Url::parse(&format!("{}/sse", server.uri())).unwrap();
        let meta = discover(&client, &server_url, None).await.unwrap();

        assert_eq!(meta.token_endpoint, format!("{}/token", server.uri()));
        assert_eq!(
            meta.additional.get("vendor_extension").unwrap(),
            "kept"
        );
    }

    #[tokio::test]
    async fn falls_back_to_oidc_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(AS_METADATA_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(OIDC_METADATA_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_metadata(&server.uri())))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let server_url = url::Url::parse(&format!("{}/sse", server.uri())).unwrap();
        let meta = discover(&client, &server_url, None).await.unwrap();
        assert_eq!(meta.authorization_endpoint, format!("{}/authorize", server.uri()));
    }

    #[tokio::test]
    async fn falls_back_to_static_endpoints_when_discovery_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let server_url = url::Url::parse(&format!("{}/sse", server.uri())).unwrap();
        let static_eps = StaticEndpoints {
            authorization_endpoint: "https://static.example.com/authorize".into(),
            token_endpoint: "https://static.example.com/token".into(),
            registration_endpoint: None,
        };
        let meta = discover(&client, &server_url, Some(&static_eps)).await.unwrap();
        assert_eq!(meta.authorization_endpoint, static_eps.authorization_endpoint);
    }

    #[tokio::test]
    async fn errors_when_discovery_and_static_both_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let server_url = url::Url::parse(&format!("{}/sse", server.uri())).unwrap();
        assert!(discover(&client, &server_url, None).await.is_err());
    }
}
