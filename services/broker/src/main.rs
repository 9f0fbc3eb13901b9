use std::path::PathBuf;

use broker::{rpc, Broker};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "chat-broker", version, about = "Chat bot broker daemon")]
struct Args {
    /// Path to the YAML config file. Falls back to $CHAT_BROKER_CONFIG, then
    /// the built-in default path.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("CHAT_BROKER_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(cb_config::DEFAULT_CONFIG_PATH));

    info!(config_path = %config_path.display(), version = env!("CARGO_PKG_VERSION"), "chat-broker starting");

    let broker = match Broker::bootstrap(config_path).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    };

    let shutdown = broker.root_cancel();
    let socket_path = broker.socket_path().to_string();

    let serve_shutdown = shutdown.clone();
    let serve_broker = broker.clone();
    let serve_task = tokio::spawn(async move { rpc::serve(serve_broker, serve_shutdown).await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        res = wait_on(serve_task) => {
            if let Err(e) = res {
                error!(error = %e, socket_path = %socket_path, "control socket listener exited");
            }
        }
    }

    broker.shutdown().await;
    info!("chat-broker shut down");
    Ok(())
}

async fn wait_on(task: tokio::task::JoinHandle<std::io::Result<()>>) -> std::io::Result<()> {
    match task.await {
        Ok(res) => res,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}
