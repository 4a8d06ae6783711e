//! mcp-bridge-proxy: stdio<->remote bridge entry point.
//!
//! Thin wrapper following `turbomcp-proxy`'s `main.rs` shape: parse args,
//! initialize tracing, run, map the result to a process exit code.

#[tokio::main]
async fn main() {
    let config = match mcp_bridge::BridgeConfig::parse(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mcp-bridge-proxy: {e}");
            std::process::exit(e.exit_code());
        }
    };

    mcp_bridge::init_tracing(&config);

    let runtime = match mcp_bridge::BridgeRuntime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("mcp-bridge-proxy: {e}");
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = runtime.run().await {
        eprintln!("mcp-bridge-proxy: {e}");
        std::process::exit(e.exit_code());
    }
}
