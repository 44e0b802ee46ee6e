//! Container registry
//!
//! Owns every known [`Container`] for the lifetime of the process. Each entry
//! sits behind its own lock; the map itself is only write-locked to add or
//! remove entries and to move a name between entries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::container::{Container, SHORT_ID_LEN};
use crate::{Error, Result};

/// How many fresh identifiers `create` tries before giving up
const MAX_ID_ATTEMPTS: usize = 8;

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub(crate) struct Store {
    entries: HashMap<String, Arc<Mutex<Container>>>,
    names: HashMap<String, String>,
    /// Short ids handed out so far, including deleted containers
    issued: HashSet<String>,
    generate_id: IdGenerator,
}

impl Store {
    pub(crate) fn update(store: &RwLock<Store>, container: &Container) -> Result<()> {
        let guard = store.upgradable_read();
        let slot = guard
            .entries
            .get(container.id())
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(container.id().to_string()))?;

        let current_name = slot.lock().name.clone();
        if current_name == container.name {
            slot.lock().assign(container);
            return Ok(());
        }

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        if !container.name.is_empty() {
            if let Some(owner) = guard.names.get(&container.name) {
                if owner != container.id() {
                    return Err(Error::NameConflict(container.name.clone()));
                }
            }
        }
        if !current_name.is_empty() {
            guard.names.remove(&current_name);
        }
        if !container.name.is_empty() {
            guard
                .names
                .insert(container.name.clone(), container.id().to_string());
        }
        slot.lock().assign(container);
        Ok(())
    }

    pub(crate) fn get(store: &RwLock<Store>, id: &str) -> Result<Container> {
        let guard = store.read();
        let slot = guard
            .entries
            .get(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        let container = slot.lock().clone();
        Ok(container)
    }

    pub(crate) fn delete(store: &RwLock<Store>, id: &str) -> Result<()> {
        let mut guard = store.write();
        let slot = guard
            .entries
            .remove(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let name = slot.lock().name.clone();
        if guard.names.get(&name).map(String::as_str) == Some(id) {
            guard.names.remove(&name);
        }
        tracing::debug!(container = %&id[..SHORT_ID_LEN.min(id.len())], "Removed from registry");
        Ok(())
    }
}

/// Process-wide store of containers. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct Registry {
    store: Arc<RwLock<Store>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_id_generator(docker_id)
    }

    /// Create a registry that draws identifiers from `generate`
    pub fn with_id_generator(generate: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            store: Arc::new(RwLock::new(Store {
                entries: HashMap::new(),
                names: HashMap::new(),
                issued: HashSet::new(),
                generate_id: Arc::new(generate),
            })),
        }
    }

    /// Mint a new container with empty fields and store it
    pub fn create(&self) -> Result<Container> {
        let mut store = self.store.write();

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = (store.generate_id)();
            if id.len() < SHORT_ID_LEN {
                continue;
            }
            let short = id[..SHORT_ID_LEN].to_string();
            if store.issued.contains(&short) {
                tracing::debug!(id = %short, "Container id collision, retrying");
                continue;
            }

            let container = Container::new(id.clone(), Arc::downgrade(&self.store));
            store.issued.insert(short);
            store
                .entries
                .insert(id, Arc::new(Mutex::new(container.clone())));
            return Ok(container);
        }

        tracing::error!("Container id space exhausted");
        Err(Error::IdExhausted)
    }

    /// Look a container up by id, falling back to its name
    pub fn load(&self, id_or_name: &str) -> Result<Container> {
        let store = self.store.read();
        let slot = store
            .entries
            .get(id_or_name)
            .or_else(|| {
                store
                    .names
                    .get(id_or_name.trim_start_matches('/'))
                    .and_then(|id| store.entries.get(id))
            })
            .ok_or_else(|| Error::ContainerNotFound(id_or_name.to_string()))?;
        let container = slot.lock().clone();
        Ok(container)
    }

    /// Overwrite the stored fields of `container`
    pub fn update(&self, container: &Container) -> Result<()> {
        Store::update(&self.store, container)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        Store::delete(&self.store, id)
    }

    /// Snapshots of all containers, oldest first
    pub fn list(&self) -> Vec<Container> {
        let store = self.store.read();
        let mut all: Vec<Container> = store.entries.values().map(|s| s.lock().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// 64 hex characters, the shape docker clients expect
fn docker_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
