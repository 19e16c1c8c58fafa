mod config;
mod registry;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use mirrorline_page::HeartbeatManager;
use mirrorline_transport_websocket::{WebSocketServer, WebSocketServerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the page server (default)
    Run,
    /// Load the configuration, print it and exit
    CheckConfig,
}

fn demo_tick_task() -> Vec<u8> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("tick {millis}").into_bytes()
}

/// Runs one demo tick on the blocking pool, since enqueueing may wait on the output gate.
fn spawn_demo_tick(ticker: &Arc<HeartbeatManager>) -> JoinHandle<bool> {
    let ticker = Arc::clone(ticker);
    tokio::task::spawn_blocking(move || ticker.run())
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("MIRRORLINE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match ServerConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    if let Some(Commands::CheckConfig) = cli.command {
        println!("{config:#?}");
        return;
    }

    let registry = Arc::new(SessionRegistry::new(config.connection_config()));
    let mut ws_config = WebSocketServerConfig::new(config.bind_addr.clone());
    ws_config.client_queue_capacity = config.client_queue_capacity;
    ws_config.max_payload_hint = config.max_payload_bytes;
    ws_config.worker_threads = config.worker_threads;

    let server = match WebSocketServer::listen(ws_config, Arc::clone(&registry)) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to start websocket server: {err}");
            std::process::exit(1);
        }
    };
    info!(
        local_addr = %server.local_addr(),
        lossless = config.lossless,
        queue_backend = ?config.queue_backend,
        "mirrorline server started"
    );

    let demo_ticker = config.demo_tick_interval.map(|interval| {
        let registry = Arc::clone(&registry);
        info!(?interval, "demo tick producer enabled");
        Arc::new(HeartbeatManager::new(interval, move || {
            registry.broadcast(&demo_tick_task());
        }))
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = flag::register(SIGTERM, Arc::clone(&shutdown));
    let _ = flag::register(SIGINT, Arc::clone(&shutdown));

    let mut last_health_log = Instant::now();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested");
            break;
        }
        if !server.is_running() {
            error!("websocket server stopped unexpectedly");
            break;
        }

        if let Some(ticker) = &demo_ticker {
            spawn_demo_tick(ticker);
        }

        if last_health_log.elapsed() >= config.health_log_interval {
            let stats = registry.stats();
            let ws = server.metrics_snapshot();
            info!(
                sessions = stats.sessions,
                pages = stats.pages,
                queued_batches = stats.queued_batches,
                loss_failed_pages = stats.loss_failed_pages,
                accepted = ws.connections_accepted,
                rejected = ws.connections_rejected,
                outbound_ok = ws.outbound_send_ok,
                outbound_err = ws.outbound_send_err,
                inbound = ws.inbound_received,
                "health"
            );
            last_health_log = Instant::now();
        }

        tokio::time::sleep(config.tick_interval).await;
    }

    drop(server);
    info!("mirrorline server stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use mirrorline_page::HeartbeatManager;

    use super::{demo_tick_task, spawn_demo_tick, Cli, Commands};

    #[test]
    fn test_cli_parsing() {
        use clap::Parser;

        let cli = Cli::try_parse_from(["mirrorline-server"]).expect("implicit run");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["mirrorline-server", "run"]).expect("explicit run");
        assert!(matches!(cli.command, Some(Commands::Run)));

        let cli = Cli::try_parse_from([
            "mirrorline-server",
            "--config",
            "server.toml",
            "check-config",
        ])
        .expect("check-config");
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(std::path::PathBuf::from("server.toml")));
    }

    #[test]
    fn demo_tick_task_is_labelled() {
        assert!(demo_tick_task().starts_with(b"tick "));
    }

    #[tokio::test]
    async fn demo_tick_runs_off_the_async_runtime() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let ticker = Arc::new(HeartbeatManager::new(Duration::ZERO, move || {
            std::thread::sleep(Duration::from_millis(500));
            flag.store(true, Ordering::SeqCst);
        }));

        let started = Instant::now();
        let tick = spawn_demo_tick(&ticker);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!ran.load(Ordering::SeqCst));

        assert!(tick.await.expect("tick task"));
        assert!(ran.load(Ordering::SeqCst));
    }
}
