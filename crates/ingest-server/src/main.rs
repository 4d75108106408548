//! Ingest server entrypoint
//!
//! Wires the pieces together and runs until SIGTERM/SIGINT:
//! configuration, logging, the cached clock, the S3 uploader, the
//! failure queue, the pipeline manager, and the HTTP server. On
//! shutdown the HTTP server stops accepting first, then the pipeline
//! drains; the container's grace period must cover both.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ingest_core::prelude::*;
use ingest_server::dlq::DlqManager;
use ingest_server::encoder::Encoder;
use ingest_server::logging;
use ingest_server::server::{router, AppState};
use ingest_server::uploader::{ObjectUploader, S3Uploader};
use ingest_server::Manager;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ingest-server")]
#[command(about = "HTTP event ingestion server with batched S3 upload")]
#[command(version)]
struct Args {
    /// Optional config file; environment variables take precedence
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = Config::load(args.config.as_deref())?;
    logging::init(&cfg);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %cfg.instance_id,
        bucket = %cfg.raw_bucket,
        "starting ingest server"
    );

    let metrics = Arc::new(Metrics::new());
    let clock = TimeCache::new();
    clock.spawn_refresher();

    let keys = Arc::new(KeyFactory::new(Arc::clone(&clock), cfg.instance_id.clone()));
    let event_pool = EventPool::new();
    let buffer_pool = BufferPool::new();

    let uploader: Arc<dyn ObjectUploader> =
        Arc::new(S3Uploader::new(&cfg, Arc::clone(&metrics)).await);

    let dlq = Arc::new(DlqManager::new(
        &cfg,
        Arc::clone(&keys),
        Arc::clone(&clock),
        Arc::clone(&uploader),
        Arc::clone(&metrics),
    )?);

    let encoder = Encoder::new(Arc::clone(&event_pool), Arc::clone(&buffer_pool));
    let manager = Manager::start(&cfg, encoder, uploader, dlq, keys, Arc::clone(&metrics));

    let state = AppState {
        metrics,
        clock,
        events: manager.sender(),
        event_pool,
        max_body_size: cfg.max_body_size,
    };

    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    info!(addr = %cfg.http_addr, "listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // New requests are refused from here on; drain what was accepted.
    info!("http server stopped, draining pipeline");
    manager.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

/// Resolve on SIGTERM (orchestrator scale-in / deploy) or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "sigterm handler failed"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("sigint received"),
        _ = terminate => info!("sigterm received"),
    }
}
