//! HTTP adapter: axum routes over a shared [`JobController`].
//!
//! | Route                    | Handler                        |
//! |--------------------------|--------------------------------|
//! | `POST /convert`          | [`handlers::convert`]          |
//! | `POST /convert/stream`   | [`handlers::convert_stream`]   |
//! | `GET  /jobs/{id}/events` | [`handlers::job_events`]       |
//! | `GET  /health`           | [`handlers::health`]           |
//!
//! The router is built by [`router`] so the binary and the integration
//! tests run exactly the same middleware stack.

pub mod error;
pub mod handlers;

use crate::controller::JobController;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

/// Response header carrying the job id.
pub const JOB_ID_HEADER: &str = "x-job-id";

/// On `/jobs/{id}/events`: `true` when the stream is a replay of a finished job.
pub const JOB_FINISHED_HEADER: &str = "x-job-finished";

/// Multipart framing allowance on top of the file itself.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Shared state available to all handlers via `State<AppState>`.
///
/// Cheap to clone; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub controller: JobController,
}

impl AppState {
    pub fn new(controller: JobController) -> Self {
        Self { controller }
    }
}

/// Build the full application [`Router`] with all middleware layers.
///
/// The middleware stack is applied bottom-up:
///
/// 1. Set request ID on incoming requests
/// 2. Structured request/response tracing
/// 3. Propagate request ID to response
/// 4. Panic recovery (catch panics, return 500)
///
/// The request body limit is set well above the upload limit, so an
/// oversized upload is measured and refused by the handler with a proper
/// JSON error instead of being cut off mid-stream.
pub fn router(state: AppState) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");
    let max_upload = usize::try_from(state.controller.config().max_upload_bytes).unwrap_or(usize::MAX);
    let body_limit = max_upload
        .saturating_mul(2)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/convert", post(handlers::convert))
        .route("/convert/stream", post(handlers::convert_stream))
        .route("/jobs/{id}/events", get(handlers::job_events))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        // -- Middleware stack (applied bottom-up) --
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
