use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;

pub async fn execute(config_path: Option<&Path>, port: Option<u16>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(port) = port {
        config.daemon.port = port;
    }
    let addr: SocketAddr = config.bind_address().parse()?;

    let state = match faceforge_daemon::load_models(&config).await {
        Ok(state) => state,
        Err(_) => {
            eprintln!("Failed to load models");
            std::process::exit(1);
        }
    };

    println!("Starting inference server...");
    println!("Listening on http://{}", addr);
    println!("\nAPI endpoints:");
    println!("  GET  /ping         - Health check");
    println!("  POST /invocations  - Generate a portrait");
    println!("\nPress Ctrl+C to stop.\n");

    faceforge_daemon::run_server(addr, state).await?;

    Ok(())
}
