//! Relay process: runs the dispatch loop against Redis until signalled.

use std::sync::Arc;
use std::time::Duration;

use payment_relay::{init_tracing, HttpForwarder, PaymentRelay, RedisStore, RelayConfig};
use tokio::signal;
use tracing::{error, info};

/// Waits for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = RelayConfig::load()?;
    info!(prefix = %config.key_prefix, "starting payment relay");

    let store = RedisStore::connect(&config.redis_url).await?;
    let forwarder = HttpForwarder::new(Duration::from_millis(config.dispatcher.dispatch_timeout_ms));
    let relay = Arc::new(PaymentRelay::new(Arc::new(store), Arc::new(forwarder), &config));

    relay.start().await;
    shutdown_signal().await;
    relay.shutdown().await;

    let stats = relay.stats().await?;
    info!(
        ready = stats.ready_depth,
        retry = stats.retry_depth,
        "payment relay stopped"
    );
    Ok(())
}
