//! The in-memory container entity
//!
//! A [`Container`] is a snapshot of one logical Docker container: the spec the
//! client asked for and the facts observed while running it. Snapshots are
//! handed out by the [`Registry`](crate::Registry); mutations become visible
//! to other callers only after [`Container::update`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::registry::Store;
use crate::{Error, Result};

/// Length of the abbreviated identifier, as printed by the docker cli
pub const SHORT_ID_LEN: usize = 12;

/// State shared by every snapshot of the same container
#[derive(Debug, Default)]
pub(crate) struct Shared {
    stop: CancellationToken,
    lifecycle: Arc<AsyncMutex<()>>,
}

/// A logical container backed by (at most) one pod
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries, in request order
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<String>,
    /// Container-internal TCP ports requested by the client
    pub exposed_ports: BTreeSet<u16>,
    /// Container port -> local tunnel port; empty unless the pod is running
    pub mapped_ports: BTreeMap<u16, u16>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    shared: Arc<Shared>,
    store: Weak<RwLock<Store>>,
}

impl Container {
    pub(crate) fn new(id: String, store: Weak<RwLock<Store>>) -> Self {
        Self {
            id,
            name: String::new(),
            image: String::new(),
            cmd: Vec::new(),
            env: Vec::new(),
            labels: BTreeMap::new(),
            binds: Vec::new(),
            exposed_ports: BTreeSet::new(),
            mapped_ports: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            shared: Arc::new(Shared::default()),
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        &self.id[..SHORT_ID_LEN.min(self.id.len())]
    }

    /// Name of the pod backing this container
    pub fn pod_name(&self) -> String {
        crate::kubernetes::pod_name(self)
    }

    /// Persist the current field values through the owning registry
    pub fn update(&self) -> Result<()> {
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| Error::ContainerNotFound(self.id.clone()))?;
        Store::update(&store, self)
    }

    /// Reload the fields from the registry, dropping local edits
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| Error::ContainerNotFound(self.id.clone()))?;
        let current = Store::get(&store, &self.id)?;
        self.assign(&current);
        Ok(())
    }

    /// Remove this container from the owning registry
    pub fn delete(&self) -> Result<()> {
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| Error::ContainerNotFound(self.id.clone()))?;
        Store::delete(&store, &self.id)
    }

    /// Mark the container as going away. Never blocks; calling it again is a no-op.
    pub fn signal_stop(&self) {
        if !self.shared.stop.is_cancelled() {
            tracing::debug!(container = %self.short_id(), "Stop signalled");
        }
        self.shared.stop.cancel();
    }

    pub fn is_stop_signaled(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Resolves once [`signal_stop`](Self::signal_stop) was called on any snapshot
    pub async fn stopped(&self) {
        self.shared.stop.cancelled().await
    }

    /// Serialize lifecycle operations (start, stop, delete) on this container.
    /// Waiters are served in arrival order.
    pub async fn lock_lifecycle(&self) -> OwnedMutexGuard<()> {
        self.shared.lifecycle.clone().lock_owned().await
    }

    /// Like [`lock_lifecycle`](Self::lock_lifecycle) but gives up if an operation is in flight
    pub fn try_lock_lifecycle(&self) -> Option<OwnedMutexGuard<()>> {
        self.shared.lifecycle.clone().try_lock_owned().ok()
    }

    /// Copy the mutable fields of `other` into `self`, keeping identity
    pub(crate) fn assign(&mut self, other: &Container) {
        self.name = other.name.clone();
        self.image = other.image.clone();
        self.cmd = other.cmd.clone();
        self.env = other.env.clone();
        self.labels = other.labels.clone();
        self.binds = other.binds.clone();
        self.exposed_ports = other.exposed_ports.clone();
        self.mapped_ports = other.mapped_ports.clone();
        self.started_at = other.started_at;
        self.finished_at = other.finished_at;
    }

    /// Split `env` into key/value pairs. Entries without `=` get an empty value.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| match e.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (e.clone(), String::new()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registry;

    #[test]
    fn test_short_id() {
        let registry = Registry::new();
        let c = registry.create().unwrap();
        assert_eq!(c.id().len(), 64);
        assert_eq!(c.short_id().len(), SHORT_ID_LEN);
        assert!(c.id().starts_with(c.short_id()));
        assert_eq!(c.pod_name(), format!("kubedock-{}", c.short_id()));
    }

    #[test]
    fn test_update_after_delete_fails() {
        let registry = Registry::new();
        let mut c = registry.create().unwrap();
        c.delete().unwrap();

        c.image = "alpine".into();
        assert!(matches!(c.update(), Err(Error::ContainerNotFound(_))));
        assert!(matches!(c.delete(), Err(Error::ContainerNotFound(_))));
    }

    #[test]
    fn test_update_after_registry_dropped() {
        let registry = Registry::new();
        let c = registry.create().unwrap();
        drop(registry);
        assert!(c.update().is_err());
    }

    #[test]
    fn test_refresh_picks_up_newer_update() {
        let registry = Registry::new();
        let mut stale = registry.create().unwrap();
        let mut fresh = registry.load(stale.id()).unwrap();
        fresh.mapped_ports.insert(80, 40000);
        fresh.started_at = Some(Utc::now());
        fresh.update().unwrap();

        stale.refresh().unwrap();
        assert_eq!(stale.mapped_ports, fresh.mapped_ports);
        assert_eq!(stale.started_at, fresh.started_at);

        stale.delete().unwrap();
        assert!(matches!(stale.refresh(), Err(Error::ContainerNotFound(_))));
    }

    #[test]
    fn test_signal_stop_shared_between_snapshots() {
        let registry = Registry::new();
        let c = registry.create().unwrap();
        let other = registry.load(c.id()).unwrap();

        assert!(!other.is_stop_signaled());
        c.signal_stop();
        c.signal_stop();
        assert!(other.is_stop_signaled());
    }

    #[tokio::test]
    async fn test_stopped_resolves() {
        let registry = Registry::new();
        let c = registry.create().unwrap();
        let waiter = registry.load(c.id()).unwrap();

        let handle = tokio::spawn(async move { waiter.stopped().await });
        c.signal_stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_lock_is_per_container() {
        let registry = Registry::new();
        let a = registry.create().unwrap();
        let b = registry.create().unwrap();
        let a2 = registry.load(a.id()).unwrap();

        let _guard = a.lock_lifecycle().await;
        assert!(a2.try_lock_lifecycle().is_none());
        assert!(b.try_lock_lifecycle().is_some());
    }

    #[test]
    fn test_env_pairs() {
        let registry = Registry::new();
        let mut c = registry.create().unwrap();
        c.env = vec!["A=1".into(), "B=x=y".into(), "EMPTY".into(), "".into()];

        let pairs = c.env_pairs();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("A".into(), "1".into()));
        assert_eq!(pairs[1], ("B".into(), "x=y".into()));
        assert_eq!(pairs[2], ("EMPTY".into(), String::new()));
    }
}
