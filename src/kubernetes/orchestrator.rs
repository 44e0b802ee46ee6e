//! Container lifecycle on top of pods

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::cluster::PodApi;
use super::manifest::{self, pod_name, ManifestOptions};
use super::retry::RetryPolicy;
use super::status::{self, ContainerStatus, PodPhase};
use super::tunnel::{tunnel_error, Tunnel, TunnelSet};
use crate::{Container, Error, Result};

/// Runs containers as pods and keeps their port tunnels up
pub struct Orchestrator {
    cluster: Arc<dyn PodApi>,
    config: OrchestratorConfig,
    /// Container id -> open tunnels. An entry is only changed while holding
    /// that container's lifecycle lock.
    tunnels: Mutex<HashMap<String, TunnelSet>>,
}

impl Orchestrator {
    pub fn new(cluster: Arc<dyn PodApi>) -> Self {
        Self::with_config(cluster, OrchestratorConfig::default())
    }

    pub fn with_config(cluster: Arc<dyn PodApi>, config: OrchestratorConfig) -> Self {
        Self {
            cluster,
            config,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Whether the container's pod exists and is running
    pub async fn is_container_running(&self, container: &Container) -> Result<bool> {
        let pod = self.observe(&pod_name(container)).await?;
        Ok(pod.map(|p| PodPhase::of(&p) == PodPhase::Running).unwrap_or(false))
    }

    /// Run the container's pod and open one tunnel per exposed port
    pub async fn start_container(&self, container: &mut Container) -> Result<()> {
        let _guard = container.lock_lifecycle().await;
        if container.is_stop_signaled() {
            return Err(Error::Cancelled(container.id().to_string()));
        }
        container.refresh()?;
        let name = pod_name(container);
        // local ports to ask for again, even after the old tunnels are gone
        let previous = container.mapped_ports.clone();

        match self.observe(&name).await?.map(|p| PodPhase::of(&p)) {
            Some(PodPhase::Running) => {
                tracing::info!(container = %container.short_id(), pod = %name, "Container already running");
                return self.ensure_tunnels(container, &name).await;
            }
            Some(PodPhase::Pending) | Some(PodPhase::Unknown) => {
                tracing::debug!(pod = %name, "Pod already submitted, waiting for it");
            }
            Some(PodPhase::Terminating) => {
                tracing::info!(pod = %name, "Waiting for previous pod to go away");
                self.close_tunnels(container.id());
                clear_ports(container);
                self.wait_gone(&name).await?;
                self.create_pod(container, &name).await?;
            }
            Some(phase) => {
                tracing::info!(pod = %name, phase = ?phase, "Replacing finished pod");
                self.close_tunnels(container.id());
                clear_ports(container);
                self.request_delete(&name).await?;
                self.wait_gone(&name).await?;
                self.create_pod(container, &name).await?;
            }
            None => {
                self.close_tunnels(container.id());
                clear_ports(container);
                self.create_pod(container, &name).await?;
            }
        }

        match self.wait_running(container, &name).await {
            Ok(()) => {}
            Err(Error::Cancelled(id)) => {
                tracing::info!(pod = %name, "Start cancelled, removing pod");
                if let Err(e) = self.teardown_pod(&name).await {
                    tracing::warn!(pod = %name, error = %e, "Rollback failed");
                }
                return Err(Error::Cancelled(id));
            }
            Err(e) => return Err(e),
        }

        let mut set = TunnelSet::default();
        for port in container.exposed_ports.clone() {
            let preferred = previous.get(&port).copied().unwrap_or(0);
            // on error `set` drops and closes what this attempt opened
            set.insert(self.open_tunnel(&name, port, preferred).await?);
        }

        container.mapped_ports = set.mapped_ports();
        container.started_at = Some(Utc::now());
        container.finished_at = None;
        container.update()?;
        self.tunnels.lock().insert(container.id().to_string(), set);

        tracing::info!(
            container = %container.short_id(),
            pod = %name,
            ports = ?container.mapped_ports,
            "Container started"
        );
        Ok(())
    }

    /// Remove the pod but keep the container, so it can be started again
    pub async fn stop_container(&self, container: &mut Container) -> Result<()> {
        let _guard = container.lock_lifecycle().await;
        container.refresh()?;
        let name = pod_name(container);
        // local ports to ask for again, even after the old tunnels are gone
        let previous = container.mapped_ports.clone();
        self.close_tunnels(container.id());

        let result = self.teardown_pod(&name).await;
        container.mapped_ports.clear();
        if result.is_ok() && container.started_at.is_some() {
            container.finished_at = Some(Utc::now());
        }
        container.update()?;
        result?;

        tracing::info!(container = %container.short_id(), pod = %name, "Container stopped");
        Ok(())
    }

    /// Remove the container's pod and tunnels, waiting until the pod is gone
    pub async fn delete_container(&self, container: &mut Container) -> Result<()> {
        container.signal_stop();
        let _guard = container.lock_lifecycle().await;
        match container.refresh() {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let name = pod_name(container);
        self.close_tunnels(container.id());

        let result = self.teardown_pod(&name).await;
        clear_ports(container);
        result?;

        tracing::info!(container = %container.short_id(), pod = %name, "Container deleted");
        Ok(())
    }

    /// Observe the pod once and repair tunnels to match it
    pub async fn get_container_status(&self, container: &mut Container) -> Result<ContainerStatus> {
        let name = pod_name(container);
        let pod = self.observe(&name).await?;
        // observation only while start, stop or delete is in flight
        let guard = container.try_lock_lifecycle();

        let Some(pod) = pod else {
            if guard.is_some() {
                self.close_tunnels(container.id());
                clear_ports(container);
            }
            return Err(Error::PodNotFound(name));
        };

        let status = ContainerStatus::from_pod(&pod);
        if guard.is_some() {
            match status.phase {
                PodPhase::Running => self.ensure_tunnels(container, &name).await?,
                phase if phase.is_terminal() => {
                    self.close_tunnels(container.id());
                    clear_ports(container);
                }
                _ => {}
            }
        }
        Ok(status)
    }

    /// Number of open tunnels for a container
    pub fn tunnel_count(&self, id: &str) -> usize {
        self.tunnels.lock().get(id).map(TunnelSet::len).unwrap_or(0)
    }

    /// Close every tunnel
    pub fn shutdown(&self) {
        let closed: usize = self.tunnels.lock().drain().map(|(_, set)| set.len()).sum();
        tracing::debug!(tunnels = closed, "Closed all tunnels");
    }

    fn close_tunnels(&self, id: &str) {
        if let Some(set) = self.tunnels.lock().remove(id) {
            tracing::debug!(container = %&id[..id.len().min(12)], tunnels = set.len(), "Closing tunnels");
        }
    }

    async fn observe(&self, name: &str) -> Result<Option<Pod>> {
        let cluster = &self.cluster;
        self.config
            .retry
            .run("get pod", move || cluster.get(name))
            .await
    }

    async fn request_delete(&self, name: &str) -> Result<bool> {
        let cluster = &self.cluster;
        let grace = Some(self.config.manifest.termination_grace_period);
        let existed = self
            .config
            .retry
            .run("delete pod", move || cluster.delete(name, grace))
            .await?;
        if existed {
            tracing::info!(pod = %name, "Pod deletion requested");
        }
        Ok(existed)
    }

    async fn create_pod(&self, container: &Container, name: &str) -> Result<()> {
        let pod = manifest::build_pod(container, &self.config.manifest)?;
        let cluster = &self.cluster;
        let pod = &pod;
        match self
            .config
            .retry
            .run("create pod", move || cluster.create(pod))
            .await
        {
            Ok(()) => {
                tracing::info!(
                    container = %container.short_id(),
                    pod = %name,
                    image = %container.image,
                    "Pod created"
                );
                Ok(())
            }
            Err(e) if e.api_code() == Some(409) => {
                tracing::debug!(pod = %name, "Pod already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the pod if there is one and wait for it to disappear
    async fn teardown_pod(&self, name: &str) -> Result<()> {
        match self.observe(name).await? {
            None => {
                tracing::debug!(pod = %name, "No pod to remove");
                Ok(())
            }
            Some(pod) => {
                if PodPhase::of(&pod) != PodPhase::Terminating {
                    self.request_delete(name).await?;
                }
                self.wait_gone(name).await
            }
        }
    }

    async fn wait_gone(&self, name: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.observe(name).await?.is_none() {
                return Ok(());
            }
            if started.elapsed() >= self.config.delete_timeout {
                return Err(Error::Timeout(format!(
                    "pod {} still present after {}s",
                    name,
                    self.config.delete_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn wait_running(&self, container: &Container, name: &str) -> Result<()> {
        let started = Instant::now();
        let mut last_reason = String::from("pod not scheduled yet");

        loop {
            if container.is_stop_signaled() {
                return Err(Error::Cancelled(container.id().to_string()));
            }

            let Some(pod) = self.observe(name).await? else {
                return Err(Error::SchedulingFailure {
                    pod: name.to_string(),
                    reason: "pod disappeared while starting".to_string(),
                });
            };
            if PodPhase::of(&pod) == PodPhase::Running {
                return Ok(());
            }
            if let Some(reason) = status::fatal_reason(&pod) {
                tracing::warn!(pod = %name, reason = %reason, "Pod cannot start");
                return Err(Error::SchedulingFailure {
                    pod: name.to_string(),
                    reason,
                });
            }
            if let Some(reason) = status::waiting_reason(&pod) {
                if reason != last_reason {
                    tracing::debug!(pod = %name, reason = %reason, "Pod waiting");
                }
                last_reason = reason;
            }

            if started.elapsed() >= self.config.start_timeout {
                tracing::warn!(pod = %name, reason = %last_reason, "Pod did not start in time");
                return Err(Error::SchedulingFailure {
                    pod: name.to_string(),
                    reason: format!(
                        "not running after {}s: {}",
                        self.config.start_timeout.as_secs(),
                        last_reason
                    ),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = container.stopped() => {}
            }
        }
    }

    /// Open tunnels for exposed ports that have none (or a dead one), preferring
    /// the local port recorded before
    async fn ensure_tunnels(&self, container: &mut Container, pod: &str) -> Result<()> {
        let id = container.id().to_string();
        let mut set = self.tunnels.lock().remove(&id).unwrap_or_default();
        let exposed = container.exposed_ports.clone();
        set.retain_alive(|port| exposed.contains(&port));

        let mut failure = None;
        let missing: Vec<u16> = exposed.iter().copied().filter(|p| !set.contains(*p)).collect();
        for port in missing {
            let preferred = container.mapped_ports.get(&port).copied().unwrap_or(0);
            match self.open_tunnel(pod, port, preferred).await {
                Ok(tunnel) => {
                    if preferred != 0 && tunnel.local_port() != preferred {
                        tracing::warn!(
                            pod = %pod,
                            port,
                            old = preferred,
                            new = tunnel.local_port(),
                            "Tunnel re-established on a different port"
                        );
                    }
                    set.insert(tunnel);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mapped = set.mapped_ports();
        if mapped != container.mapped_ports {
            container.mapped_ports = mapped;
            container.update()?;
        }
        self.tunnels.lock().insert(id, set);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn open_tunnel(&self, pod: &str, port: u16, preferred: u16) -> Result<Tunnel> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            match Tunnel::open(
                self.cluster.clone(),
                pod,
                self.config.tunnel_bind,
                port,
                preferred,
            )
            .await
            {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) if attempt + 1 < retry.max_attempts => {
                    tracing::warn!(pod = %pod, port, error = %e, "Opening tunnel failed, retrying");
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(tunnel_error(port, e)),
            }
        }
    }
}

/// Forget mapped ports; the container may already be gone from the registry
fn clear_ports(container: &mut Container) {
    if container.mapped_ports.is_empty() {
        return;
    }
    container.mapped_ports.clear();
    match container.update() {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => tracing::warn!(container = %container.short_id(), error = %e, "Failed to clear ports"),
    }
}

/// Timeouts and pod settings for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a pod may stay pending before the start fails
    pub start_timeout: Duration,
    /// How long to wait for a deleted pod to disappear
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
    /// Address the local end of port tunnels listens on
    pub tunnel_bind: IpAddr,
    pub retry: RetryPolicy,
    pub manifest: ManifestOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            tunnel_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            retry: RetryPolicy::default(),
            manifest: ManifestOptions::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn tunnel_bind(mut self, addr: IpAddr) -> Self {
        self.tunnel_bind = addr;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn image_pull_policy(mut self, policy: impl Into<String>) -> Self {
        self.manifest.image_pull_policy = Some(policy.into());
        self
    }

    pub fn termination_grace_period(mut self, seconds: u32) -> Self {
        self.manifest.termination_grace_period = seconds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::cluster::MockPodApi;
    use crate::Registry;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus as PodContainerStatus, PodStatus,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pod_in(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    fn pod_waiting(reason: &str) -> Pod {
        let mut pod = pod_in("Pending");
        pod.status.as_mut().unwrap().container_statuses = Some(vec![PodContainerStatus {
            name: manifest::MAIN_CONTAINER.to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: None,
                }),
                ..ContainerState::default()
            }),
            ..PodContainerStatus::default()
        }]);
        pod
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new()
            .start_timeout(Duration::from_secs(5))
            .delete_timeout(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(100))
            .retry(RetryPolicy::default().max_attempts(2).initial_delay(Duration::from_millis(10)))
    }

    fn container(registry: &Registry) -> Container {
        let mut c = registry.create().unwrap();
        c.image = "alpine".into();
        c.update().unwrap();
        c
    }

    #[tokio::test]
    async fn test_not_running_without_pod() {
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(|_| Ok(None));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let c = container(&registry);
        assert!(!orch.is_container_running(&c).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_retries() {
        let mut mock = MockPodApi::new();
        mock.expect_get()
            .times(2)
            .returning(|_| Err(Error::from_status(503, "ServiceUnavailable", "down")));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let c = container(&registry);
        let err = orch.is_container_running(&c).await.unwrap_err();
        assert_eq!(err.api_code(), Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_creates_pod_and_waits() {
        let gets = Arc::new(AtomicUsize::new(0));
        let g = gets.clone();
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(move |_| {
            Ok(match g.fetch_add(1, Ordering::SeqCst) {
                0 => None,
                1 => Some(pod_in("Pending")),
                _ => Some(pod_in("Running")),
            })
        });
        mock.expect_create().times(1).returning(|_| Ok(()));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        orch.start_container(&mut c).await.unwrap();

        let stored = registry.load(c.id()).unwrap();
        assert!(stored.started_at.is_some());
        assert!(stored.mapped_ports.is_empty());
    }

    #[tokio::test]
    async fn test_start_already_exists_is_success() {
        let gets = Arc::new(AtomicUsize::new(0));
        let g = gets.clone();
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(move |_| {
            Ok((g.fetch_add(1, Ordering::SeqCst) > 0).then(|| pod_in("Running")))
        });
        mock.expect_create()
            .times(1)
            .returning(|_| Err(Error::from_status(409, "AlreadyExists", "exists")));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        orch.start_container(&mut c).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_running_is_noop() {
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(|_| Ok(Some(pod_in("Running"))));
        mock.expect_create().times(0);
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        orch.start_container(&mut c).await.unwrap();
        orch.start_container(&mut c).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_fast_on_invalid_image() {
        let gets = Arc::new(AtomicUsize::new(0));
        let g = gets.clone();
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(move |_| {
            Ok((g.fetch_add(1, Ordering::SeqCst) > 0).then(|| pod_waiting("InvalidImageName")))
        });
        mock.expect_create().times(1).returning(|_| Ok(()));
        mock.expect_delete().times(0);
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        c.exposed_ports.insert(80);
        c.update().unwrap();
        let err = orch.start_container(&mut c).await.unwrap_err();

        match err {
            Error::SchedulingFailure { reason, .. } => assert!(reason.contains("InvalidImageName")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(orch.tunnel_count(c.id()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_with_last_reason() {
        let gets = Arc::new(AtomicUsize::new(0));
        let g = gets.clone();
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(move |_| {
            Ok((g.fetch_add(1, Ordering::SeqCst) > 0).then(|| pod_waiting("ImagePullBackOff")))
        });
        mock.expect_create().times(1).returning(|_| Ok(()));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        let err = orch.start_container(&mut c).await.unwrap_err();

        match err {
            Error::SchedulingFailure { reason, .. } => assert!(reason.contains("ImagePullBackOff")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.load(c.id()).unwrap().started_at.is_none());
    }

    #[tokio::test]
    async fn test_start_after_stop_signal_is_cancelled() {
        let mut mock = MockPodApi::new();
        mock.expect_get().times(0);
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        c.signal_stop();
        assert!(matches!(
            orch.start_container(&mut c).await,
            Err(Error::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_without_pod_sends_nothing() {
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(|_| Ok(None));
        mock.expect_delete().times(0);
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        orch.delete_container(&mut c).await.unwrap();
        assert!(c.is_stop_signaled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_times_out() {
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(|_| Ok(Some(pod_in("Running"))));
        mock.expect_delete().times(1).returning(|_, _| Ok(true));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        assert!(matches!(
            orch.delete_container(&mut c).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_passes_grace_period() {
        let gets = Arc::new(AtomicUsize::new(0));
        let g = gets.clone();
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(move |_| {
            Ok((g.fetch_add(1, Ordering::SeqCst) == 0).then(|| pod_in("Running")))
        });
        mock.expect_delete()
            .withf(|_, grace| *grace == Some(7))
            .times(1)
            .returning(|_, _| Ok(true));
        let orch = Orchestrator::with_config(Arc::new(mock), config().termination_grace_period(7));

        let registry = Registry::new();
        let mut c = container(&registry);
        orch.delete_container(&mut c).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_without_pod() {
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(|_| Ok(None));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        assert!(matches!(
            orch.get_container_status(&mut c).await,
            Err(Error::PodNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_phase() {
        let mut mock = MockPodApi::new();
        mock.expect_get().returning(|_| Ok(Some(pod_in("Succeeded"))));
        let orch = Orchestrator::with_config(Arc::new(mock), config());

        let registry = Registry::new();
        let mut c = container(&registry);
        let status = orch.get_container_status(&mut c).await.unwrap();
        assert_eq!(status.phase, PodPhase::Succeeded);
        assert_eq!(status.state.as_str(), "exited");
        assert!(!status.is_running());
    }

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new()
            .start_timeout(Duration::from_secs(1))
            .image_pull_policy("Never")
            .tunnel_bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.start_timeout, Duration::from_secs(1));
        assert_eq!(config.manifest.image_pull_policy.as_deref(), Some("Never"));
        assert!(config.tunnel_bind.is_unspecified());
    }
}
