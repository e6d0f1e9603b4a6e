//! Devbox - ephemeral development environments
//!
//! The `devbox` command provisions a throwaway sandbox in the current
//! cluster, binds it to a fresh control-plane environment and keeps it in
//! sync with the local source tree until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use devbox_core::config::{DEFAULT_AGENT_IMAGE, DEFAULT_INIT_IMAGE, DEFAULT_TOOLKIT_IMAGE};
use devbox_core::obs::SessionSpan;
use devbox_core::storage::{ACCESS_KEY, BUCKET, SECRET_KEY};
use devbox_core::{
    delete_environments, init_tracing, ControlPlane, ControlPlaneConfig, Devbox, DevboxConfig,
    DevboxContext, HttpControlPlane, Images, KubeCluster, S3BlobConnector, SessionInfo,
};
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "devbox")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ephemeral development environment in your cluster", long_about = None)]
struct Cli {
    /// Session name (default: current unix time in nanoseconds)
    #[arg(short, long, env = "DEVBOX_NAME")]
    name: Option<String>,

    #[arg(long, default_value = DEFAULT_AGENT_IMAGE)]
    agent_image: String,

    #[arg(long, default_value = DEFAULT_INIT_IMAGE)]
    init_image: String,

    #[arg(long, default_value = DEFAULT_TOOLKIT_IMAGE)]
    toolkit_image: String,

    /// Paths with workflow resources to keep in sync (repeatable)
    #[arg(short, long = "sync")]
    sync: Vec<PathBuf>,

    /// Skip confirmation prompts
    #[arg(short, long)]
    yes: bool,

    /// Root of the source tree to build from
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn session_name(&self) -> String {
        self.name.clone().unwrap_or_else(default_name)
    }

    fn images(&self) -> Images {
        Images {
            agent: self.agent_image.clone(),
            init: self.init_image.clone(),
            toolkit: self.toolkit_image.clone(),
            ..Images::default()
        }
    }
}

fn default_name() -> String {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros())
        .to_string()
}

fn confirm(skip: bool, prompt: &str) -> Result<bool> {
    if skip {
        return Ok(true);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(true)
        .interact()
        .context("failed to read confirmation")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let name = cli.session_name();
    let _span = SessionSpan::enter(&name);

    let workspace = std::fs::canonicalize(&cli.workspace)
        .with_context(|| format!("workspace {} not found", cli.workspace.display()))?;

    let control_plane_config = ControlPlaneConfig::from_env();
    let organization = control_plane_config.organization_id.clone();
    let control_plane = Arc::new(
        HttpControlPlane::new(control_plane_config).context("invalid control plane configuration")?,
    );

    let kube_config = kube::Config::infer()
        .await
        .context("failed to load cluster configuration")?;
    let cluster_url = kube_config.cluster_url.to_string();
    let client = kube::Client::try_from(kube_config).context("failed to create cluster client")?;
    let cluster = Arc::new(KubeCluster::new(client));

    if !confirm(cli.yes, &format!("Use organization {organization}?"))?
        || !confirm(cli.yes, &format!("Use cluster {cluster_url}?"))?
    {
        return Ok(());
    }

    clean_obsolete(control_plane.as_ref(), cli.yes).await?;

    if !confirm(cli.yes, &format!("Create devbox '{name}'?"))? {
        return Ok(());
    }

    let config = DevboxConfig::new(name, workspace)
        .with_images(cli.images())
        .with_sync_paths(cli.sync.clone());
    let devbox = Devbox::new(DevboxContext {
        cluster,
        control_plane,
        blobs: Arc::new(S3BlobConnector::new(ACCESS_KEY, SECRET_KEY, BUCKET)),
        config,
    });

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    devbox
        .run(&token, print_summary)
        .await
        .context("devbox session failed")?;

    let counts = devbox.rebuild_counts();
    info!(
        completed = counts.completed,
        cancelled = counts.cancelled,
        failed = counts.failed,
        restarts = counts.restarts,
        "session ended"
    );
    Ok(())
}

async fn clean_obsolete(control_plane: &dyn ControlPlane, yes: bool) -> Result<()> {
    let obsolete = control_plane
        .list_obsolete_environments()
        .await
        .context("failed to list environments")?;
    if obsolete.is_empty() {
        return Ok(());
    }
    let total = obsolete.len();
    if !confirm(yes, &format!("Delete {total} obsolete devbox environments?"))? {
        return Ok(());
    }
    let deleted = delete_environments(control_plane, &obsolete).await;
    if deleted < total {
        warn!(deleted, total, "some obsolete environments were not deleted");
    }
    println!("Deleted {deleted}/{total} obsolete environments");
    Ok(())
}

fn print_summary(info: &SessionInfo) {
    println!();
    println!("Devbox is ready");
    println!("  Environment: {}", info.environment.id);
    println!("  Agent token: {}", info.environment.agent_token);
    println!("  Namespace:   {}", info.namespace);
    println!("  Dashboard:   {}", info.dashboard_url);
    println!();
    println!("Watching for changes, press Ctrl+C to stop.");
}

async fn cancel_on_signal(token: CancellationToken) {
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
    info!("interrupted, tearing down");
    token.cancel();
}
