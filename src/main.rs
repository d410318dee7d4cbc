use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use embercast::bridge::ControlBridge;
use embercast::config::Config;
use embercast::router::{self, RouterHandle};

const DEFAULT_CONFIG_PATH: &str = "./config/embercast.json";

/// Resolves on SIGHUP, the reload-and-restart trigger. Never resolves where
/// the signal doesn't exist.
#[cfg(unix)]
async fn reload_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            hangup.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn reload_signal() {
    std::future::pending::<()>().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    info!(config = %config_path, "Embercast Art-Net router starting");
    let config = Config::from_file(&config_path)?;

    let bridge = ControlBridge::new(64);
    let mut router: Option<RouterHandle> = Some(router::start(config, bridge.clone())?);

    // Headless stand-in for the UI collaborator: consume status records and
    // log one line per device per tick for as long as we're watching.
    bridge.set_ui_active(true);
    let mut status_rx = bridge.subscribe_status();
    let status_logger = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(record) => info!(
                    device = %record.name,
                    ip = %record.ip,
                    connected = record.connected,
                    in_pps = record.in_pps,
                    out_fps = record.out_fps,
                    "status"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // run until interrupted or until the router flags itself down;
    // SIGHUP reloads the config file and restarts the router on it
    let mut exit = bridge.exit().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                bridge.exit().set();
            }
            _ = exit.wait_for(|stop| *stop) => break,
            _ = reload_signal() => {
                let Some(current) = router.take() else { continue };
                match Config::from_file(&config_path) {
                    Ok(new_config) => match current.restart(new_config).await {
                        Ok(next) => {
                            info!("configuration reloaded");
                            router = Some(next);
                        }
                        Err(e) => {
                            error!(error = %e, "restart failed");
                            bridge.exit().set();
                        }
                    },
                    Err(e) => {
                        error!(error = %e, "config reload failed, keeping the running router");
                        router = Some(current);
                    }
                }
            }
        }
    }

    bridge.set_ui_active(false);
    if let Some(router) = router {
        router.stop().await;
    }
    status_logger.abort();
    info!("Embercast shut down");
    Ok(())
}
