use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use drophost_jad::JadMaker;
use drophost_limit::RateLimiter;
use drophost_store::FileStore;

use crate::{download, upload};

/// Upper bound on a request body. Oversized uploads must still be received
/// far enough to produce the rate limiter's diagnostic instead of a bare
/// connection error, so this sits well above the per-request byte cap.
const MAX_UPLOAD_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: FileStore,
    pub limiter: RateLimiter,
    pub jad: JadMaker,
    /// Parent directory for per-request scratch directories.
    pub scratch_root: PathBuf,
    pub static_assets: Option<PathBuf>,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
}

impl AppState {
    pub(crate) fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn static_assets_root(&self) -> Option<PathBuf> {
        self.static_assets.clone()
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    live_files: usize,
    tracked_clients: usize,
    req_total: u64,
    version: &'static str,
}

/// Request-boundary error: a status plus a plain-text message. Bodies stay
/// plain text because the clients are constrained legacy devices.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub(crate) fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub(crate) fn dependency_unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let shared = Arc::new(state);
    let app = build_router(shared);
    let listener = bind_listener(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handle_health))
        .route("/fh", post(upload::handle_upload))
        .route("/:name", get(download::handle_download))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES));

    if let Some(static_root) = state.static_assets_root() {
        if Path::new(&static_root).exists() {
            info!("Serving static assets from {:?}", static_root);
            router = router.fallback(serve_static_assets);
        } else {
            warn!("static assets directory {:?} does not exist", static_root);
        }
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

pub(crate) async fn serve_static_assets(
    State(state): State<SharedState>,
    req: Request<Body>,
) -> Response {
    if let Some(static_root) = state.static_assets_root() {
        if Path::new(&static_root).exists() {
            let index_path = static_root.join("index.html");
            let service = ServeDir::new(static_root)
                .append_index_html_on_directories(true)
                .not_found_service(ServeFile::new(index_path));

            match service.oneshot(req).await {
                Ok(response) => response.into_response(),
                Err(err) => {
                    warn!("static asset error: {}", err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("failed to serve static asset: {err}"),
                    )
                        .into_response()
                }
            }
        } else {
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    } else {
        (StatusCode::NOT_FOUND, "Not Found").into_response()
    }
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_seconds(),
        live_files: state.store.live_count(),
        tracked_clients: state.limiter.tracked_clients(),
        req_total,
        version: env!("CARGO_PKG_VERSION"),
    })
}
