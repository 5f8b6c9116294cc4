//! Hoodlink gateway process
//!
//! Loads the configuration, sets up logging and runs one session against the
//! serial bridge until the bridge disconnects or Ctrl-C is pressed. The last
//! known device state is printed as JSON on exit.
//!
//! Usage: cargo run --bin gateway [config.yaml]
//! Example: cargo run --bin gateway config/gateway.yaml

use hoodlink::{logging, Gateway, GatewayConfig};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gateway.yaml".to_string());

    let config = GatewayConfig::load(&config_path)?;
    logging::init(&config.logging)?;
    info!("{}", hoodlink::info());
    info!("Configuration: {}", config_path);

    let gateway = Gateway::new(config)?;
    let store = gateway.store();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
        // Keep the sender alive so receivers do not read a dropped channel as shutdown
        std::future::pending::<()>().await;
    });

    let report = gateway.run_session(shutdown_rx).await?;
    info!(
        "Session finished: {} response(s) applied, {} dropped",
        report.applied, report.dropped
    );

    println!("{}", serde_json::to_string_pretty(&store.get_all())?);
    Ok(())
}
