pub mod data;
pub mod health;
pub mod settings;
pub mod ws;

use axum::body::Bytes;
use axum::middleware;
use axum::routing::MethodRouter;
use axum::Router;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{authenticate, permission_stage};
use crate::error::{AppError, AppResult, ErrorDetail};
use crate::services::response_cache::{cache_stage, CacheRule};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(ws::router())
        .merge(data::router(&state))
        .merge(settings::router(&state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs `authenticate` then the permission check in front of `route`.
pub(crate) fn guarded(
    state: &AppState,
    permission: &'static str,
    route: MethodRouter<AppState>,
) -> MethodRouter<AppState> {
    route
        .layer(middleware::from_fn_with_state(permission, permission_stage))
        .layer(middleware::from_fn_with_state(
            state.identity.clone(),
            authenticate,
        ))
}

/// Serves `route` through the response cache under `prefix`. Meant to be
/// wrapped by [`guarded`] so permission checks run before any cache hit.
pub(crate) fn cached(
    state: &AppState,
    prefix: &'static str,
    ttl: Duration,
    route: MethodRouter<AppState>,
) -> MethodRouter<AppState> {
    let rule = CacheRule {
        cache: state.response_cache.clone(),
        ttl,
        prefix,
    };
    route.layer(middleware::from_fn_with_state(rule, cache_stage))
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::bad_request("Request body is required"));
    }
    serde_json::from_slice(body).map_err(|err| {
        AppError::bad_request("Invalid request format").with(
            "errors",
            vec![ErrorDetail::new("body", err.to_string(), None)],
        )
    })
}

pub(crate) fn validation_failed(errors: Vec<ErrorDetail>) -> AppError {
    AppError::bad_request("Validation failed").with("errors", errors)
}
