/*!
HTTP surface of the kernel.

- `GET /health`: liveness, always open
- `GET /system/health`: [`KernelHealth`], requires the `x-api-key` header to
  match `SENTINEL_API_KEY`

Business routes (machines, groups, jobs) are served by the outer API layer.
*/

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

use crate::health::KernelHealth;
use crate::state::Kernel;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

fn api_key_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) => !expected.is_empty() && expected == provided,
        _ => false,
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let expected = app.kernel.config.security.api_key.as_deref();
    if expected.is_none() {
        warn!("SENTINEL_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }
    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_matches(expected, provided) {
        warn!(path = %req.uri().path(), "rejected request with a bad api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.kernel.health.get_health(&app.kernel))
}
