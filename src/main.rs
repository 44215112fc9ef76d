mod cleanup;
mod cli;
mod daemon;
mod downloader;
mod errors;
mod fetcher;
mod payloads;
mod proxy;
mod reader;
mod server;
mod session;
mod state;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cleanup::Cleaner;
use crate::cli::{Args, ProxyMode};
use crate::downloader::HttpFetcher;
use crate::proxy::{DirectConnection, ProxyController, TorProxy};
use crate::reader::ReaderSettings;
use crate::server::AppState;
use crate::session::SessionManager;

fn main() -> Result<()> {
    let mut args = Args::parse();
    // The daemon changes its working directory, so resolve paths first
    args.resolve_dirs();

    #[cfg(unix)]
    if args.stop {
        return crate::daemon::stop_daemon(&args.data_dir);
    }

    #[cfg(unix)]
    if args.daemon {
        crate::daemon::start_daemon(&args.data_dir)?;
    }

    init_logging();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(serve(&args));

    #[cfg(unix)]
    if args.daemon {
        crate::daemon::cleanup_pid_file(&args.data_dir);
    }
    result
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rsl=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(args: &Args) -> Result<()> {
    for dir in [&args.temp_dir, &args.data_dir, &args.download_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let proxy: Arc<dyn ProxyController> = match args.proxy {
        ProxyMode::Tor => Arc::new(TorProxy::new(
            args.tor_binary.clone(),
            args.data_dir.join("tor"),
            args.socks_port,
        )),
        ProxyMode::Direct => Arc::new(DirectConnection),
    };
    if args.proxy_on_start {
        proxy.launch().await.context("Failed to start the proxy")?;
    }

    let fetcher = Arc::new(HttpFetcher::new(proxy.clone(), args.rate_limit));
    let session = Arc::new(SessionManager::new(fetcher, proxy, args.session_settings()));
    let app = Arc::new(AppState {
        session: session.clone(),
        cleaner: Arc::new(Cleaner::new(args.auto_delete)),
        default_parts: args.parts.max(1),
        reader: ReaderSettings::default(),
    });

    let addr = args.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    info!(
        addr = %addr,
        downloads = %args.download_dir.display(),
        parts = args.parts,
        auto_delete = args.auto_delete,
        "Streamer is listening"
    );

    axum::serve(listener, server::router(app))
        .with_graceful_shutdown(shutdown_signal(session.clone()))
        .await
        .context("Server failed")?;

    session.terminate();
    info!("Streamer stopped");
    Ok(())
}

/// Resolves on the first shutdown signal. The running download is stopped
/// right away so streams still tailing it end and the server can drain.
async fn shutdown_signal(session: Arc<SessionManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let other = async {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => {},
                    _ = hup.recv() => {},
                }
            }
            _ => {
                warn!("Failed to install SIGTERM/SIGHUP handlers");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let other = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = other => {},
    }
    info!("Shutdown requested, stopping the streamer...");
    if session.terminate() {
        info!("Stopped the running download");
    }
}
