//! Access to the cluster's pod API
//!
//! The orchestrator only talks to the cluster through [`PodApi`], so tests can
//! swap in an in-memory cluster. [`KubeCluster`] is the real implementation,
//! backed by `kube` and scoped to one namespace.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::net::TcpStream;

use crate::{Error, Result};

/// Pod operations needed to back containers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Fetch a pod, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Pod>>;

    /// Submit a pod manifest. An existing pod with the same name is reported
    /// as an API error with code 409.
    async fn create(&self, pod: &Pod) -> Result<()>;

    /// Request deletion. Returns `false` if there was no such pod.
    async fn delete(&self, name: &str, grace_period_seconds: Option<u32>) -> Result<bool>;

    /// Pipe `client` to `port` inside the pod until either side closes
    async fn forward(&self, name: &str, port: u16, client: TcpStream) -> Result<()>;
}

/// [`PodApi`] over a live Kubernetes API server
pub struct KubeCluster {
    pods: Api<Pod>,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Connect using `kubeconfig` if it exists, else the ambient configuration
    /// (in-cluster service account or `~/.kube/config`)
    pub async fn connect(kubeconfig: Option<&Path>, namespace: &str) -> Result<Self> {
        let client = match kubeconfig.filter(|p| p.exists()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Config(format!("reading {}: {}", path.display(), e))
                })?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| Error::Config(format!("kubeconfig: {}", e)))?;
                Client::try_from(config)?
            }
            None => Client::try_default().await?,
        };

        tracing::info!(namespace = %namespace, "Connected to Kubernetes");
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl PodApi for KubeCluster {
    async fn get(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods.get_opt(name).await?)
    }

    async fn create(&self, pod: &Pod) -> Result<()> {
        self.pods.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete(&self, name: &str, grace_period_seconds: Option<u32>) -> Result<bool> {
        let params = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        match self.pods.delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn forward(&self, name: &str, port: u16, mut client: TcpStream) -> Result<()> {
        let mut forwarder = self.pods.portforward(name, &[port]).await?;
        let mut upstream = forwarder
            .take_stream(port)
            .ok_or_else(|| Error::Tunnel(format!("no stream for port {} of {}", port, name)))?;

        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        drop(upstream);

        forwarder
            .join()
            .await
            .map_err(|e| Error::Tunnel(format!("port-forward to {}: {}", name, e)))
    }
}
