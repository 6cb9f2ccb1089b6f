use clap::Parser;
use log::info;

use logos_relay::{RelayServer, ServerConfig, DEFAULT_PORT};

/// Relay that fans out document and presence updates between Logos peers.
#[derive(Debug, Parser)]
#[command(name = "logos-relay", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "LOGOS_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let server = RelayServer::new(ServerConfig {
        bind_addr: format!("{}:{}", cli.host, cli.port),
    });

    let handle = match server.start().await {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Failed to start relay on {}: {e}", server.bind_addr());
            std::process::exit(1);
        }
    };
    info!("Relay ready at {}", handle.url());

    shutdown_signal().await;
    info!("Received shutdown signal, shutting down gracefully...");

    let status = handle.status().await;
    info!(
        "Closing {} client(s); forwarded {} message(s) this run",
        status.client_count, status.broker.messages_forwarded
    );
    handle.stop().await;
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
