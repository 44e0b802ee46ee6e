//! kubedock server

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kubedock::api::{AppState, Server};
use kubedock::kubernetes::KubeCluster;
use kubedock::{Config, Orchestrator, Registry, Result};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kubedock")]
#[command(about = "Docker API that runs containers as Kubernetes pods")]
#[command(version)]
struct Cli {
    /// Config file (default: ./config.yaml, then ~/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. `:8080` or `127.0.0.1:2475`
    #[arg(long, env = "SERVER_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Namespace pods are created in
    #[arg(long, env = "NAMESPACE")]
    namespace: Option<String>,

    /// Kubeconfig to use instead of the in-cluster or default one
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Seconds a pod may stay pending before start fails
    #[arg(long)]
    start_timeout: Option<u64>,

    /// Seconds to wait for a deleted pod to disappear
    #[arg(long)]
    delete_timeout: Option<u64>,

    /// Address port tunnels listen on
    #[arg(long)]
    tunnel_bind: Option<IpAddr>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log request and response bodies (may include credentials)
    #[arg(short = 'r', long)]
    log_request: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.listen_addr {
            config.server.listen_addr = addr;
        }
        if let Some(ns) = self.namespace {
            config.kubernetes.namespace = ns;
        }
        if let Some(path) = self.kubeconfig {
            config.kubernetes.kubeconfig = Some(path);
        }
        if let Some(secs) = self.start_timeout {
            config.kubernetes.start_timeout = secs;
        }
        if let Some(secs) = self.delete_timeout {
            config.kubernetes.delete_timeout = secs;
        }
        if let Some(addr) = self.tunnel_bind {
            config.tunnel.bind_address = addr;
        }
        config.generic.verbose |= self.verbose;
        config.generic.log_request |= self.log_request;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut config = Config::load(cli.config.as_deref(), home.as_deref())?;
    cli.apply(&mut config);

    // Initialize logging
    let level = if config.generic.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("kubedock={}", level))),
        )
        .init();

    config.validate()?;
    let addr = config.listen_addr()?;

    let cluster = KubeCluster::connect(
        config.kubernetes.kubeconfig.as_deref(),
        &config.kubernetes.namespace,
    )
    .await?;
    let orchestrator = Arc::new(Orchestrator::with_config(
        Arc::new(cluster),
        config.orchestrator(),
    ));
    let registry = Registry::new();

    let state = AppState::new(registry.clone(), orchestrator.clone());
    Server::new(state, addr, config.generic.log_request)
        .run(shutdown_signal())
        .await?;

    cleanup(&registry, &orchestrator).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Remove the pods of every container still known
async fn cleanup(registry: &Registry, orchestrator: &Orchestrator) {
    for mut container in registry.list() {
        container.signal_stop();
        match orchestrator.delete_container(&mut container).await {
            Ok(()) => {
                let _ = container.delete();
            }
            Err(e) => {
                tracing::warn!(container = %container.short_id(), error = %e, "Cleanup failed")
            }
        }
    }
    orchestrator.shutdown();
}
