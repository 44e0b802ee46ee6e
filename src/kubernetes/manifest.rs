//! Pod manifests for containers

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container as PodContainer, ContainerPort, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{Container, Result};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const ID_LABEL: &str = "kubedock.id";
pub const LABELS_ANNOTATION: &str = "kubedock.labels";
pub const NAME_ANNOTATION: &str = "kubedock.name";
pub const BINDS_ANNOTATION: &str = "kubedock.binds";

/// Name of the single container inside every pod
pub const MAIN_CONTAINER: &str = "main";

/// Pod-level settings that do not come from the docker request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestOptions {
    /// `Always`, `IfNotPresent` or `Never`; the cluster default when unset
    pub image_pull_policy: Option<String>,
    pub termination_grace_period: u32,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            image_pull_policy: None,
            termination_grace_period: 3,
        }
    }
}

/// Pod name backing `container`; stable for the container's lifetime
pub fn pod_name(container: &Container) -> String {
    format!("kubedock-{}", container.short_id())
}

/// Build the pod that runs `container`
pub fn build_pod(container: &Container, opts: &ManifestOptions) -> Result<Pod> {
    let mut labels = BTreeMap::new();
    for (key, value) in &container.labels {
        if is_label_key(key) && is_label_value(value) {
            labels.insert(key.clone(), value.clone());
        }
    }
    labels.insert(MANAGED_BY_LABEL.to_string(), "kubedock".to_string());
    labels.insert(ID_LABEL.to_string(), container.short_id().to_string());

    let mut annotations = BTreeMap::new();
    if !container.labels.is_empty() {
        annotations.insert(
            LABELS_ANNOTATION.to_string(),
            serde_json::to_string(&container.labels)?,
        );
    }
    if !container.name.is_empty() {
        annotations.insert(NAME_ANNOTATION.to_string(), container.name.clone());
    }
    if !container.binds.is_empty() {
        tracing::warn!(
            container = %container.short_id(),
            binds = ?container.binds,
            "Bind mounts are not supported, ignoring"
        );
        annotations.insert(
            BINDS_ANNOTATION.to_string(),
            serde_json::to_string(&container.binds)?,
        );
    }

    let env: Vec<EnvVar> = container
        .env_pairs()
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            value_from: None,
        })
        .collect();

    let ports: Vec<ContainerPort> = container
        .exposed_ports
        .iter()
        .map(|port| ContainerPort {
            container_port: i32::from(*port),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        })
        .collect();

    let main = PodContainer {
        name: MAIN_CONTAINER.to_string(),
        image: Some(container.image.clone()),
        args: (!container.cmd.is_empty()).then(|| container.cmd.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        image_pull_policy: opts.image_pull_policy.clone(),
        ..PodContainer::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(container)),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![main],
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(i64::from(opts.termination_grace_period)),
            ..PodSpec::default()
        }),
        status: None,
    })
}

/// Label keys are `[prefix/]name`, name at most 63 characters
fn is_label_key(key: &str) -> bool {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty()
            || prefix.len() > 253
            || !prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return false;
        }
    }
    !name.is_empty() && is_label_value(name)
}

fn is_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let bytes = value.as_bytes();
    value.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
