//! HTTP server

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};

/// Oldest and newest `/v1.NN` prefixes routed
const MIN_API_MINOR: u32 = 24;
const MAX_API_MINOR: u32 = 45;

/// Bodies larger than this are not logged
const MAX_LOGGED_BODY: usize = 1 << 20;

/// Docker API server
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    pub fn new(state: AppState, addr: SocketAddr, log_request: bool) -> Self {
        Self {
            router: create_router(state, log_request),
            addr,
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
        tracing::info!("Starting docker API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Build the docker API router, also served under every `/v1.NN` prefix
pub fn create_router(state: AppState, log_request: bool) -> Router {
    let mut router = api_routes();
    for minor in MIN_API_MINOR..=MAX_API_MINOR {
        router = router.nest(&format!("/v1.{}", minor), api_routes());
    }
    router = router
        .fallback(handlers::fallback)
        .layer(TraceLayer::new_for_http());
    if log_request {
        router = router.layer(middleware::from_fn(log_bodies));
    }
    router.with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // System (get also answers HEAD)
        .route("/_ping", get(handlers::ping))
        .route("/version", get(handlers::version))
        .route("/info", get(handlers::info))
        // Images
        .route("/images/create", post(handlers::pull_image))
        // Containers
        .route("/containers/create", post(handlers::create_container))
        .route("/containers/:id/start", post(handlers::start_container))
        .route("/containers/:id/stop", post(handlers::stop_container))
        .route("/containers/:id/json", get(handlers::inspect_container))
        .route("/containers/:id", delete(handlers::remove_container))
}

/// Log request and response bodies at debug level
async fn log_bodies(req: Request, next: Next) -> Result<Response, StatusCode> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_LOGGED_BODY)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;
    tracing::debug!(
        method = %parts.method,
        uri = %parts.uri,
        body = %String::from_utf8_lossy(&bytes),
        "Request"
    );

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    tracing::debug!(
        status = %parts.status,
        body = %String::from_utf8_lossy(&bytes),
        "Response"
    );
    Ok(Response::from_parts(parts, Body::from(bytes)))
}
