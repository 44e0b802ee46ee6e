//! Docker API request handlers

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, Method, StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};

use super::types::*;
use crate::kubernetes::{ContainerStatus, Health, RunState};
use crate::{Container, Error, Orchestrator, Registry};

/// Newest docker API version served
pub const API_VERSION: &str = "1.45";
/// Oldest docker API version served
pub const MIN_API_VERSION: &str = "1.24";

/// Docker's rendering of "never"
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(registry: Registry, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            registry,
            orchestrator,
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

// === System ===

pub async fn ping() -> &'static str {
    "OK"
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION.to_string(),
        min_api_version: MIN_API_VERSION.to_string(),
        git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
        go_version: "n/a".to_string(),
        os: "linux".to_string(),
        arch: std::env::consts::ARCH.to_string(),
        kernel_version: "kubernetes".to_string(),
    })
}

pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let containers = state.registry.list();
    let running = containers
        .iter()
        .filter(|c| c.started_at.is_some() && c.finished_at.is_none())
        .count();
    let images: BTreeSet<&str> = containers.iter().map(|c| c.image.as_str()).collect();

    Json(InfoResponse {
        id: "kubedock".to_string(),
        name: "kubedock".to_string(),
        containers: containers.len(),
        containers_running: running,
        containers_paused: 0,
        containers_stopped: containers.len() - running,
        images: images.len(),
        driver: "kubernetes".to_string(),
        operating_system: "kubernetes".to_string(),
        os_type: "linux".to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        ncpu: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        labels: Vec::new(),
    })
}

// === Images ===

/// Images are pulled by the cluster when the pod starts, so this only reports success
pub async fn pull_image(Query(params): Query<PullImageQuery>) -> impl IntoResponse {
    let image = params.from_image.unwrap_or_default();
    let reference = match params.tag.as_deref() {
        Some(tag) if !tag.is_empty() && !image.contains('@') => format!("{}:{}", image, tag),
        _ => image,
    };
    tracing::debug!(image = %reference, "Image pull delegated to the cluster");

    let line = serde_json::json!({ "status": format!("Pulled {}", reference) });
    (
        [(header::CONTENT_TYPE, "application/json")],
        format!("{}\n", line),
    )
}

/// Serves `GET /images/{name}/json`, where `name` may contain slashes and so
/// cannot be a route parameter. Everything else is a 404.
pub async fn fallback(method: Method, uri: Uri) -> ApiResult<Json<ImageInspectResponse>> {
    let path = uri.path();
    let name = (method == Method::GET)
        .then(|| strip_version(path))
        .and_then(|p| p.strip_prefix("/images/"))
        .and_then(|p| p.strip_suffix("/json"))
        .filter(|n| !n.is_empty())
        .ok_or_else(|| not_found(&format!("page not found: {} {}", method, path)))?;

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);

    Ok(Json(ImageInspectResponse {
        id: format!("sha256:{:064x}", hasher.finish()),
        repo_tags: vec![name.to_string()],
        created: timestamp(Utc::now()),
        size: 0,
        architecture: std::env::consts::ARCH.to_string(),
        os: "linux".to_string(),
    }))
}

/// Drop a leading `/v1.NN` from `path`
fn strip_version(path: &str) -> &str {
    let Some((version, _)) = path.strip_prefix("/v").and_then(|rest| rest.split_once('/')) else {
        return path;
    };
    let numeric = version
        .split('.')
        .all(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
    if numeric {
        &path[version.len() + 2..]
    } else {
        path
    }
}

// === Containers ===

pub async fn create_container(
    State(state): State<AppState>,
    Query(params): Query<CreateContainerQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ContainerCreateResponse>)> {
    let req: ContainerCreateRequest = serde_json::from_slice(&body)
        .map_err(|e| to_api_error(Error::Config(format!("invalid request body: {}", e))))?;

    let image = req
        .image
        .filter(|i| !i.is_empty())
        .ok_or_else(|| to_api_error(Error::Config("image is required".into())))?;
    let host_config = req.host_config.unwrap_or_default();

    let mut warnings = Vec::new();
    let mut exposed = BTreeSet::new();
    let keys = req
        .exposed_ports
        .unwrap_or_default()
        .into_keys()
        .chain(host_config.port_bindings.unwrap_or_default().into_keys());
    for key in keys {
        match parse_port(&key).map_err(to_api_error)? {
            Some(port) => {
                exposed.insert(port);
            }
            None => {
                tracing::warn!(port = %key, "Only tcp ports are supported, ignoring");
                warnings.push(format!("port {} ignored: only tcp is supported", key));
            }
        }
    }

    let mut container = state.registry.create().map_err(to_api_error)?;
    container.name = params
        .name
        .or(req.name)
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    container.image = image;
    container.cmd = req.cmd.map(StringOrVec::into_vec).unwrap_or_default();
    container.env = req.env.unwrap_or_default();
    container.labels = req.labels.unwrap_or_default();
    container.binds = host_config.binds.unwrap_or_default();
    container.exposed_ports = exposed;

    if let Err(e) = container.update() {
        // the fresh entry is unusable without its name
        let _ = container.delete();
        return Err(to_api_error(e));
    }

    tracing::info!(
        container = %container.short_id(),
        name = %container.name,
        image = %container.image,
        "Container created"
    );
    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id: container.id().to_string(),
            warnings,
        }),
    ))
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut container = state.registry.load(&id).map_err(to_api_error)?;
    state
        .orchestrator
        .start_container(&mut container)
        .await
        .map_err(to_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut container = state.registry.load(&id).map_err(to_api_error)?;
    state
        .orchestrator
        .stop_container(&mut container)
        .await
        .map_err(to_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut container = state.registry.load(&id).map_err(to_api_error)?;
    container.signal_stop();
    state
        .orchestrator
        .delete_container(&mut container)
        .await
        .map_err(to_api_error)?;
    container.delete().map_err(to_api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContainerInspectResponse>> {
    let mut container = state.registry.load(&id).map_err(to_api_error)?;

    let status = match state.orchestrator.get_container_status(&mut container).await {
        Ok(status) => Some(status),
        Err(Error::PodNotFound(_)) => None,
        Err(e) => return Err(to_api_error(e)),
    };
    let host_ip = state.orchestrator.config().tunnel_bind.to_string();
    Ok(Json(inspect_response(&container, status.as_ref(), &host_ip)))
}

// === Helpers ===

fn inspect_response(
    c: &Container,
    status: Option<&ContainerStatus>,
    host_ip: &str,
) -> ContainerInspectResponse {
    // without a pod the container either never ran or has been stopped
    let (state, health) = match status {
        Some(s) => (s.state, s.health),
        None if c.started_at.is_some() => (RunState::Exited, Health::None),
        None => (RunState::Created, Health::None),
    };
    let started_at = status.and_then(|s| s.started_at).or(c.started_at);
    let finished_at = status.and_then(|s| s.finished_at).or(c.finished_at);
    let error = status
        .filter(|s| s.health == Health::Unhealthy)
        .and_then(|s| s.reason.clone())
        .unwrap_or_default();

    let ports = c
        .mapped_ports
        .iter()
        .map(|(port, local)| {
            (
                format!("{}/tcp", port),
                vec![PortBinding {
                    host_ip: host_ip.to_string(),
                    host_port: local.to_string(),
                }],
            )
        })
        .collect();

    ContainerInspectResponse {
        id: c.id().to_string(),
        name: format!("/{}", c.name),
        image: c.image.clone(),
        created: timestamp(c.created_at),
        config: ContainerConfig {
            image: c.image.clone(),
            labels: c.labels.clone(),
            env: c.env.clone(),
            cmd: c.cmd.clone(),
        },
        network_settings: NetworkSettings {
            networks: BTreeMap::from([("bridge".to_string(), serde_json::json!({}))]),
            ports,
        },
        host_config: HostConfig {
            network_mode: "host".to_string(),
        },
        state: ContainerState {
            status: state.to_string(),
            running: state == RunState::Running,
            paused: false,
            restarting: false,
            oom_killed: status.and_then(|s| s.reason.as_deref()) == Some("OOMKilled"),
            dead: state == RunState::Dead,
            exit_code: status.and_then(|s| s.exit_code).unwrap_or(0),
            error,
            started_at: started_at.map(timestamp).unwrap_or_else(|| ZERO_TIME.to_string()),
            finished_at: finished_at.map(timestamp).unwrap_or_else(|| ZERO_TIME.to_string()),
            health: HealthState {
                status: health.to_string(),
            },
        },
    }
}

/// Parse a `port/proto` key. `None` for protocols other than tcp.
pub(crate) fn parse_port(key: &str) -> crate::Result<Option<u16>> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::Config(format!("invalid port: {}", key)))?;
    match proto.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Some(port)),
        "udp" | "sctp" => Ok(None),
        _ => Err(Error::Config(format!("invalid protocol in port: {}", key))),
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_api_error(e: Error) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        Error::ContainerNotFound(_) | Error::PodNotFound(_) => StatusCode::NOT_FOUND,
        Error::Config(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::NameConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    }

    (status, Json(ApiError { message: e.to_string() }))
}

fn not_found(message: &str) -> (StatusCode, Json<ApiError>) {
    (StatusCode::NOT_FOUND, Json(ApiError { message: message.to_string() }))
}
