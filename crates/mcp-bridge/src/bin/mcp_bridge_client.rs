//! mcp-bridge-client: same stdio<->remote bridge as `mcp-bridge-proxy`,
//! distributed as a second binary so test harnesses and editor configs can
//! invoke a client-facing name without caring which binary backs it — both
//! share the same `BridgeConfig`/`BridgeRuntime` behind the scenes.

#[tokio::main]
async fn main() {
    let config = match mcp_bridge::BridgeConfig::parse(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mcp-bridge-client: {e}");
            std::process::exit(e.exit_code());
        }
    };

    mcp_bridge::init_tracing(&config);

    let runtime = match mcp_bridge::BridgeRuntime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("mcp-bridge-client: {e}");
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = runtime.run().await {
        eprintln!("mcp-bridge-client: {e}");
        std::process::exit(e.exit_code());
    }
}
