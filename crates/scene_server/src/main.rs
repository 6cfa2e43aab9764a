mod service;

use anyhow::Context;
use clap::Parser;
use service::SceneServiceImpl;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio_stream::wrappers::TcpListenerStream;
use tracing_subscriber::{fmt, EnvFilter};

/// Content service for the scene viewer. Publishes scene manifests and
/// streams model files in bounded chunks with an explicit end-of-stream
/// marker.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Root directory containing one subdirectory of .obj files per scene.
    #[arg(default_value = "Media")]
    media_root: PathBuf,

    /// TCP port to listen on (all interfaces).
    #[arg(default_value_t = 50051)]
    port: u16,

    /// Bytes per streamed chunk.
    #[arg(default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// Artificial pause between chunks (ms), to exercise slow-network paths.
    /// Purely an operational knob; has no effect on correctness.
    #[arg(default_value_t = 30)]
    chunk_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let addr: SocketAddr = format!("0.0.0.0:{}", args.port)
        .parse()
        .context("Failed to build listen address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("Server listening on {addr}");
    println!("Media root: {}", args.media_root.display());
    println!(
        "Chunk size: {} bytes, chunk delay: {} ms",
        args.chunk_size, args.chunk_delay_ms
    );

    let svc = SceneServiceImpl::new(
        args.media_root,
        args.chunk_size,
        Duration::from_millis(args.chunk_delay_ms),
    );

    tonic::transport::Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(20)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .add_service(svc.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown_signal())
        .await
        .context("gRPC server failed")?;

    tracing::info!("Server shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
