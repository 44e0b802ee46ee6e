//! Local port tunnels into pods
//!
//! A [`Tunnel`] is one TCP listener on the local host. Every accepted
//! connection is piped to the same port inside the pod through
//! [`PodApi::forward`]. Tunnels shut down when dropped, taking their open
//! connections with them.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cluster::PodApi;
use crate::{Error, Result};

/// A listener forwarding to one pod port
pub struct Tunnel {
    container_port: u16,
    local_port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Tunnel {
    /// Listen on `bind`, on `preferred` if it is free, else on an ephemeral port
    pub async fn open(
        cluster: Arc<dyn PodApi>,
        pod: &str,
        bind: IpAddr,
        container_port: u16,
        preferred: u16,
    ) -> Result<Self> {
        let listener = match TcpListener::bind(SocketAddr::new(bind, preferred)).await {
            Ok(l) => l,
            Err(e) if preferred != 0 => {
                tracing::debug!(port = preferred, error = %e, "Preferred port unavailable");
                TcpListener::bind(SocketAddr::new(bind, 0)).await?
            }
            Err(e) => return Err(e.into()),
        };
        let local_port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            cluster,
            pod.to_string(),
            container_port,
            cancel.clone(),
        ));

        tracing::info!(
            pod = %pod,
            "Tunnel {}:{} -> pod :{}",
            bind,
            local_port,
            container_port
        );

        Ok(Self {
            container_port,
            local_port,
            cancel,
            task,
        })
    }

    pub fn container_port(&self) -> u16 {
        self.container_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The listener is still accepting connections
    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("container_port", &self.container_port)
            .field("local_port", &self.local_port)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    cluster: Arc<dyn PodApi>,
    pod: String,
    port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(pod = %pod, port, peer = %peer, "Tunnel connection");
                    let cluster = cluster.clone();
                    let pod = pod.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = cluster.forward(&pod, port, stream) => {
                                if let Err(e) = res {
                                    tracing::warn!(pod = %pod, port, error = %e, "Forwarding failed");
                                }
                            }
                        }
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    tracing::debug!(pod = %pod, port, error = %e, "Accept failed");
                }
                Err(e) => {
                    tracing::warn!(pod = %pod, port, error = %e, "Tunnel listener failed");
                    break;
                }
            }
        }
    }
    tracing::debug!(pod = %pod, port, "Tunnel closed");
}

fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

/// All tunnels of one container, keyed by container port
#[derive(Debug, Default)]
pub struct TunnelSet {
    tunnels: BTreeMap<u16, Tunnel>,
}

impl TunnelSet {
    pub fn insert(&mut self, tunnel: Tunnel) {
        // a replaced tunnel closes on drop
        self.tunnels.insert(tunnel.container_port(), tunnel);
    }

    pub fn get(&self, container_port: u16) -> Option<&Tunnel> {
        self.tunnels.get(&container_port)
    }

    pub fn contains(&self, container_port: u16) -> bool {
        self.tunnels.contains_key(&container_port)
    }

    /// Drop tunnels that died or whose port is no longer wanted
    pub fn retain_alive(&mut self, wanted: impl Fn(u16) -> bool) {
        self.tunnels.retain(|port, tunnel| {
            let keep = tunnel.is_alive() && wanted(*port);
            if !keep {
                tracing::debug!(port = *port, local = tunnel.local_port(), "Dropping tunnel");
            }
            keep
        });
    }

    /// Container port -> local port
    pub fn mapped_ports(&self) -> BTreeMap<u16, u16> {
        self.tunnels
            .iter()
            .map(|(port, tunnel)| (*port, tunnel.local_port()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

pub(crate) fn tunnel_error(port: u16, err: Error) -> Error {
    match err {
        Error::Tunnel(msg) => Error::Tunnel(format!("port {}: {}", port, msg)),
        other => Error::Tunnel(format!("port {}: {}", port, other)),
    }
}
