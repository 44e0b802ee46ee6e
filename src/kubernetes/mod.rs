//! Kubernetes backend: containers become pods
//!
//! - [`cluster`] - the pod API seam and its kube-rs implementation
//! - [`manifest`] - container to pod manifest
//! - [`status`] - pod state in docker vocabulary
//! - [`tunnel`] - local listeners forwarding to pod ports
//! - [`orchestrator`] - start, stop, delete and status of containers

pub mod cluster;
pub mod manifest;
pub mod orchestrator;
pub mod retry;
pub mod status;
pub mod tunnel;

pub use cluster::{KubeCluster, PodApi};
pub use manifest::{pod_name, ManifestOptions};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use retry::RetryPolicy;
pub use status::{ContainerStatus, Health, PodPhase, RunState};
pub use tunnel::{Tunnel, TunnelSet};
