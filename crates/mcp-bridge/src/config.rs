//! `BridgeConfig`: the parsed, validated configuration for one bridge run.
//!
//! The CLI grammar (`<serverUrl> [callbackPort] --flag...`) doesn't fit
//! clap's derive macros cleanly — a positional that's only sometimes present,
//! and flags that must silently fall back on bad values rather than erroring.
//! So this is a small hand-rolled pre-parser, following the same
//! `BridgeError::configuration` reporting convention the rest of this crate
//! uses, rather than clap's own error type.

use std::collections::HashMap;

use tracing::Level;

use crate::error::{BridgeError, BridgeResult};
use crate::transport::TransportStrategy;

const DEFAULT_HOST: &str = "localhost";

/// Fully parsed and validated bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub server_url: String,
    pub callback_port: u16,
    pub headers: HashMap<String, String>,
    pub transport_strategy: TransportStrategy,
    pub host: String,
    pub allow_http: bool,
    pub ignored_tools: Vec<String>,
    pub static_oauth_client_metadata: Option<serde_json::Value>,
    pub static_oauth_client_info: Option<serde_json::Value>,
    pub oauth_scopes: Option<String>,
    pub authorize_resource: Option<String>,
    pub verbosity: u8,
}

impl BridgeConfig {
    /// Parse from a full argv, including argv[0]. Mirrors `std::env::args()`
    /// so callers can pass it directly or substitute a fixed vector in tests.
    pub fn parse<I, T>(args: I) -> BridgeResult<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into).skip(1).peekable();

        let mut positionals = Vec::new();
        let mut headers = HashMap::new();
        let mut transport_strategy = TransportStrategy::default();
        let mut host = DEFAULT_HOST.to_string();
        let mut allow_http = false;
        let mut ignored_tools = Vec::new();
        let mut static_oauth_client_metadata = None;
        let mut static_oauth_client_info = None;
        let mut oauth_scopes = None;
        let mut authorize_resource = None;
        let mut verbosity = 0u8;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--header" => {
                    let raw = args.next().ok_or_else(|| {
                        BridgeError::configuration("--header requires a value")
                    })?;
                    if let Some((key, value)) = raw.split_once(':') {
                        headers.insert(key.trim().to_string(), value.to_string());
                    }
                    // Headers without a colon are discarded per the CLI grammar.
                }
                "--transport" => {
                    let raw = args.next().ok_or_else(|| {
                        BridgeError::configuration("--transport requires a value")
                    })?;
                    transport_strategy = TransportStrategy::parse_or_default(&raw);
                }
                "--host" => {
                    host = args
                        .next()
                        .ok_or_else(|| BridgeError::configuration("--host requires a value"))?;
                }
                "--allow-http" => allow_http = true,
                "--ignore-tool" => {
                    let name = args.next().ok_or_else(|| {
                        BridgeError::configuration("--ignore-tool requires a value")
                    })?;
                    ignored_tools.push(name);
                }
                "--static-oauth-client-metadata" => {
                    let raw = args.next().ok_or_else(|| {
                        BridgeError::configuration("--static-oauth-client-metadata requires a value")
                    })?;
                    static_oauth_client_metadata = Some(parse_json_arg(&raw, "--static-oauth-client-metadata")?);
                }
                "--static-oauth-client-info" => {
                    let raw = args.next().ok_or_else(|| {
                        BridgeError::configuration("--static-oauth-client-info requires a value")
                    })?;
                    static_oauth_client_info = Some(parse_json_arg(&raw, "--static-oauth-client-info")?);
                }
                "--oauth-scopes" => {
                    oauth_scopes = Some(args.next().ok_or_else(|| {
                        BridgeError::configuration("--oauth-scopes requires a value")
                    })?);
                }
                "--authorize-resource" => {
                    authorize_resource = Some(args.next().ok_or_else(|| {
                        BridgeError::configuration("--authorize-resource requires a value")
                    })?);
                }
                "-v" => verbosity = verbosity.saturating_add(1),
                flag if flag.starts_with("-v") && flag[1..].chars().all(|c| c == 'v') => {
                    verbosity = verbosity.saturating_add((flag.len() - 1) as u8);
                }
                other => positionals.push(other.to_string()),
            }
        }

        let server_url = positionals
            .first()
            .cloned()
            .ok_or_else(|| BridgeError::configuration("missing required <serverUrl> argument"))?;

        let callback_port = match positionals.get(1) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| BridgeError::configuration(format!("invalid callback port: {raw}")))?,
            None => 0,
        };

        validate_url(&server_url, allow_http)?;

        Ok(Self {
            server_url,
            callback_port,
            headers,
            transport_strategy,
            host,
            allow_http,
            ignored_tools,
            static_oauth_client_metadata,
            static_oauth_client_info,
            oauth_scopes,
            authorize_resource,
            verbosity,
        })
    }

    /// Tracing verbosity level derived from `-v` count, following
    /// `turbomcp-proxy::cli::Cli::init_tracing`'s mapping.
    pub fn log_level(&self) -> Level {
        match self.verbosity {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn parse_json_arg(raw: &str, flag: &str) -> BridgeResult<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| BridgeError::configuration_with_key(format!("invalid JSON: {e}"), flag))
}

/// `http://` is only allowed against loopback hosts unless `--allow-http` is
/// set; `https://` is always fine. Anything else is rejected outright.
fn validate_url(raw: &str, allow_http: bool) -> BridgeResult<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| BridgeError::configuration(format!("invalid server URL: {e}")))?;

    match url.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_loopback = matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("::1"));
            if is_loopback || allow_http {
                Ok(())
            } else {
                Err(BridgeError::configuration(
                    "http:// URLs require --allow-http unless the host is localhost/127.0.0.1",
                ))
            }
        }
        other => Err(BridgeError::configuration(format!(
            "unsupported URL scheme: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("mcp-bridge-proxy".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn minimal_args_fill_in_defaults() {
        let config = BridgeConfig::parse(argv(&["https://example.com/sse"])).unwrap();
        assert_eq!(config.server_url, "https://example.com/sse");
        assert_eq!(config.callback_port, 0);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.transport_strategy, TransportStrategy::HttpFirst);
        assert!(config.headers.is_empty());
    }

    #[test]
    fn numeric_second_positional_is_callback_port_and_header_keeps_leading_space() {
        let config = BridgeConfig::parse(argv(&[
            "http://example.com/sse",
            "4000",
            "--allow-http",
            "--header",
            "Authorization: Bearer abc",
        ]))
        .unwrap();
        assert_eq!(config.callback_port, 4000);
        assert_eq!(
            config.headers.get("Authorization").map(String::as_str),
            Some(" Bearer abc")
        );
    }

    #[test]
    fn unknown_transport_value_falls_back_silently() {
        let config =
            BridgeConfig::parse(argv(&["https://e/sse", "--transport", "invalid"])).unwrap();
        assert_eq!(config.transport_strategy, TransportStrategy::HttpFirst);
    }

    #[test]
    fn header_without_colon_is_discarded() {
        let config =
            BridgeConfig::parse(argv(&["https://e/sse", "--header", "not-a-header"])).unwrap();
        assert!(config.headers.is_empty());
    }

    #[test]
    fn plain_http_to_non_loopback_host_is_rejected_without_allow_http() {
        let err = BridgeConfig::parse(argv(&["http://example.com/sse"])).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration { .. }));
    }

    #[test]
    fn plain_http_to_loopback_host_is_allowed_without_the_flag() {
        let config = BridgeConfig::parse(argv(&["http://localhost:8080/sse"])).unwrap();
        assert_eq!(config.server_url, "http://localhost:8080/sse");
    }

    #[test]
    fn missing_server_url_is_a_configuration_error() {
        let err = BridgeConfig::parse(argv(&[])).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration { .. }));
    }

    #[test]
    fn repeated_flags_accumulate() {
        let config = BridgeConfig::parse(argv(&[
            "https://e/sse",
            "--ignore-tool",
            "delete_file",
            "--ignore-tool",
            "shell_exec",
            "-vv",
        ]))
        .unwrap();
        assert_eq!(config.ignored_tools, vec!["delete_file", "shell_exec"]);
        assert_eq!(config.verbosity, 2);
    }
}
