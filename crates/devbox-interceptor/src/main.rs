use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use devbox_core::interceptor::INTERCEPTOR_PORT;
use devbox_core::storage;
use devbox_core::telemetry::init_tracing;
use devbox_interceptor::{router, MutationConfig};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "devbox-interceptor")]
#[command(about = "Admission webhook serving devbox-built workflow binaries", long_about = None)]
#[command(version)]
struct Args {
    /// Image of the workflow init process
    init_image: String,

    /// Image of the workflow toolkit
    toolkit_image: String,

    /// Base URL serving the built binaries
    #[arg(long, default_value_t = storage::download_base())]
    storage_url: String,

    #[arg(long, default_value = "/certs/tls.crt")]
    cert: PathBuf,

    #[arg(long, default_value = "/certs/tls.key")]
    key: PathBuf,

    #[arg(long, default_value_t = INTERCEPTOR_PORT)]
    port: u16,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json, Level::INFO);

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    let tls = RustlsConfig::from_pem_file(&args.cert, &args.key)
        .await
        .with_context(|| format!("failed to load certificate {}", args.cert.display()))?;

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let app = router(MutationConfig::new(
        &args.init_image,
        &args.toolkit_image,
        &args.storage_url,
    ));
    info!(addr = %addr, "interceptor listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("interceptor server failed")?;
    Ok(())
}

async fn shutdown_on_signal(handle: Handle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(1)));
}
