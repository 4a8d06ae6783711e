//! mcp-bridge: a local stdio<->HTTP/SSE bridge for remote MCP servers, with
//! OAuth 2.0 + PKCE authorization handled transparently on the client's
//! behalf.
//!
//! See `config::BridgeConfig` for the CLI surface and `runtime::BridgeRuntime`
//! for the orchestration this crate performs.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod listener;
pub mod oauth;
pub mod runtime;
pub mod store;
pub mod transport;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use runtime::BridgeRuntime;

/// Initialize the tracing subscriber from the config's `-v`-derived level.
/// Logs go to stderr unconditionally: stdout is reserved for the JSON-RPC
/// relay, following `turbomcp-proxy`'s own separation of protocol output
/// from diagnostics.
pub fn init_tracing(config: &BridgeConfig) {
    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}
