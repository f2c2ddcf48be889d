//! HTTP surface of the dispatcher.
//!
//! `/internal` routes serve workers (job stream, acks, sessions), `/api`
//! routes serve operators and worker artifact uploads. Both sit behind the
//! API key gate when a key is configured; `/health` never does.

mod handlers;

pub mod error;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::error::Result;

pub use error::{ApiError, ApiResult};

/// Header carrying the shared API key.
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    api_key: Option<Arc<SecretString>>,
}

/// Build the router. With `api_key` set, every route except `/health`
/// requires it.
pub fn router(dispatcher: Arc<Dispatcher>, api_key: Option<SecretString>) -> Router {
    let state = AppState {
        dispatcher,
        api_key: api_key.map(Arc::new),
    };

    let protected = Router::new()
        .route("/internal/jobs", get(handlers::job_stream))
        .route("/internal/jobs/ack", post(handlers::ack))
        .route("/internal/workers", get(handlers::workers))
        .route("/api/jobs", post(handlers::push_job))
        .route("/api/jobs/{id}", get(handlers::get_job))
        .route("/api/cases/{cid}/evidences", post(handlers::register_evidence))
        .route(
            "/api/cases/{cid}/evidences/{eid}/modules",
            get(handlers::runnable_modules),
        )
        .route(
            "/api/cases/{cid}/evidences/{eid}/jobs",
            get(handlers::evidence_jobs),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    if let Some(expected) = &state.api_key {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.expose_secret()) {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "dispatcher listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("dispatcher stopped");
    Ok(())
}
