//! In-memory cluster for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kubedock::kubernetes::{PodApi, RetryPolicy};
use kubedock::{Error, OrchestratorConfig, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct FakePod {
    pod: Pod,
    /// Observations so far
    polls: usize,
    /// Observations left before a deleted pod disappears
    deleting: Option<usize>,
    /// Phase forced by the test
    phase: Option<&'static str>,
}

#[derive(Default)]
struct Behavior {
    /// Observations a new pod stays pending
    pending_polls: usize,
    /// Keep new pods pending with this container waiting reason
    stuck_reason: Option<String>,
    /// Observations a deleted pod stays terminating
    deletion_polls: usize,
    /// Upcoming `get` calls that fail with a 503
    failing_gets: usize,
}

/// A cluster whose pods run instantly (or as configured) and whose port
/// forwards go to local backends
#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<HashMap<String, FakePod>>,
    behavior: Mutex<Behavior>,
    backends: Mutex<BTreeMap<u16, SocketAddr>>,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending_polls(&self, n: usize) {
        self.behavior.lock().pending_polls = n;
    }

    pub fn stuck_with(&self, reason: &str) {
        self.behavior.lock().stuck_reason = Some(reason.to_string());
    }

    pub fn deletion_polls(&self, n: usize) {
        self.behavior.lock().deletion_polls = n;
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.behavior.lock().failing_gets = n;
    }

    /// Route forwards for `container_port` to `addr`
    pub fn backend(&self, container_port: u16, addr: SocketAddr) {
        self.backends.lock().insert(container_port, addr);
    }

    pub fn set_phase(&self, name: &str, phase: &'static str) {
        if let Some(p) = self.pods.lock().get_mut(name) {
            p.phase = Some(phase);
        }
    }

    /// Drop a pod behind the orchestrator's back
    pub fn remove(&self, name: &str) {
        self.pods.lock().remove(name);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.pods.lock().contains_key(name)
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.pods.lock().get(name).map(|p| p.pod.clone())
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn observe(&self, fake: &mut FakePod) -> Pod {
        let behavior = self.behavior.lock();
        fake.polls += 1;
        let mut pod = fake.pod.clone();

        let mut status = PodStatus::default();
        let mut waiting = None;
        let phase = match fake.phase {
            Some(phase) => phase,
            None => match &behavior.stuck_reason {
                Some(reason) => {
                    waiting = Some(reason.clone());
                    "Pending"
                }
                None if fake.polls <= behavior.pending_polls => {
                    waiting = Some("ContainerCreating".to_string());
                    "Pending"
                }
                None => "Running",
            },
        };
        status.phase = Some(phase.to_string());
        status.conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if phase == "Running" { "True" } else { "False" }.to_string(),
            ..PodCondition::default()
        }]);
        status.container_statuses = Some(vec![ContainerStatus {
            name: "main".to_string(),
            state: Some(ContainerState {
                waiting: waiting.map(|reason| ContainerStateWaiting {
                    reason: Some(reason),
                    message: None,
                }),
                ..ContainerState::default()
            }),
            ..ContainerStatus::default()
        }]);
        pod.status = Some(status);
        if fake.deleting.is_some() {
            pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        pod
    }
}

#[async_trait]
impl PodApi for FakeCluster {
    async fn get(&self, name: &str) -> Result<Option<Pod>> {
        {
            let mut behavior = self.behavior.lock();
            if behavior.failing_gets > 0 {
                behavior.failing_gets -= 1;
                return Err(Error::from_status(503, "ServiceUnavailable", "try again"));
            }
        }

        let mut pods = self.pods.lock();
        let Some(fake) = pods.get_mut(name) else {
            return Ok(None);
        };
        if let Some(left) = fake.deleting {
            if left == 0 {
                pods.remove(name);
                return Ok(None);
            }
            fake.deleting = Some(left - 1);
        }
        Ok(Some(self.observe(fake)))
    }

    async fn create(&self, pod: &Pod) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut pods = self.pods.lock();
        if pods.contains_key(&name) {
            return Err(Error::from_status(409, "AlreadyExists", "pod exists"));
        }
        pods.insert(
            name,
            FakePod {
                pod: pod.clone(),
                polls: 0,
                deleting: None,
                phase: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str, _grace: Option<u32>) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let polls = self.behavior.lock().deletion_polls;
        let mut pods = self.pods.lock();
        match pods.get_mut(name) {
            Some(fake) => {
                if fake.deleting.is_none() {
                    fake.deleting = Some(polls);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn forward(&self, name: &str, port: u16, mut client: TcpStream) -> Result<()> {
        if !self.exists(name) {
            return Err(Error::Tunnel(format!("pod {} not found", name)));
        }
        let addr = self
            .backends
            .lock()
            .get(&port)
            .copied()
            .ok_or_else(|| Error::Tunnel(format!("nothing listens on port {}", port)))?;
        let mut upstream = TcpStream::connect(addr).await?;
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        Ok(())
    }
}

/// Fast timings for tests
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .start_timeout(Duration::from_secs(5))
        .delete_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(10))
        .retry(
            RetryPolicy::default()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(5)),
        )
}

/// A backend that answers every connection with `reply` and closes
pub async fn spawn_backend(reply: &'static str) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = conn.read(&mut buf).await;
                let _ = conn.write_all(reply.as_bytes()).await;
                let _ = conn.shutdown().await;
            });
        }
    });
    addr
}

/// Send a request through `localhost:port` and read the whole answer
pub async fn roundtrip(port: u16, request: &str) -> std::io::Result<String> {
    let mut conn = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
    conn.write_all(request.as_bytes()).await?;
    let mut out = String::new();
    conn.read_to_string(&mut out).await?;
    Ok(out)
}
