//! kubedock
//!
//! Serves the Docker Engine API and runs every container as a Kubernetes pod.
//! Docker clients (test harnesses, CI jobs) work unchanged against a cluster,
//! with no local container runtime.
//!
//! # Key Pieces
//!
//! - [`Registry`] - in-memory store of [`Container`] entities
//! - [`Orchestrator`] - maps container lifecycle onto pods and keeps local
//!   port tunnels to them
//! - [`api`] - the docker-compatible HTTP surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kubedock::kubernetes::KubeCluster;
//! use kubedock::{Orchestrator, Registry};
//!
//! # async fn run() -> kubedock::Result<()> {
//! let cluster = KubeCluster::connect(None, "default").await?;
//! let orchestrator = Orchestrator::new(Arc::new(cluster));
//! let registry = Registry::new();
//!
//! let mut container = registry.create()?;
//! container.image = "nginx:1.25".into();
//! container.exposed_ports.insert(80);
//! container.update()?;
//!
//! orchestrator.start_container(&mut container).await?;
//! println!("nginx on localhost:{}", container.mapped_ports[&80]);
//!
//! container.signal_stop();
//! orchestrator.delete_container(&mut container).await?;
//! container.delete()?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod kubernetes;
pub mod registry;

pub use config::Config;
pub use container::Container;
pub use error::{Error, Result};
pub use kubernetes::{ContainerStatus, Orchestrator, OrchestratorConfig};
pub use registry::Registry;
