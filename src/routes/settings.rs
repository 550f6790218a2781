use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use crate::auth::{self, Principal};
use crate::error::{internal_error, AppResult, ErrorDetail};
use crate::routes::{cached, guarded, parse_body, validation_failed};
use crate::state::AppState;

const CONFIG_TTL: Duration = Duration::from_secs(300);
const CONFIG_CACHE_PATTERN: &str = "cache:config:*";

#[derive(Debug, Deserialize)]
struct UpdateSettingRequest {
    #[serde(default)]
    setting_name: Option<String>,
    #[serde(default)]
    setting_value: Option<String>,
}

impl UpdateSettingRequest {
    fn validate(self) -> Result<(String, String), Vec<ErrorDetail>> {
        let mut errors = Vec::new();
        let name = self.setting_name.map(|n| n.trim().to_string());
        match name.as_deref() {
            None => errors.push(ErrorDetail::new("setting_name", "Field required", None)),
            Some(n) if n.is_empty() || n.chars().count() > 255 => errors.push(ErrorDetail::new(
                "setting_name",
                "must be between 1 and 255 characters",
                Some(n.to_string()),
            )),
            Some(_) => {}
        }
        match self.setting_value.as_deref() {
            None => errors.push(ErrorDetail::new("setting_value", "Field required", None)),
            Some("") => errors.push(ErrorDetail::new(
                "setting_value",
                "must not be empty",
                Some(String::new()),
            )),
            Some(_) => {}
        }
        match (name, self.setting_value) {
            (Some(name), Some(value)) if errors.is_empty() => Ok((name, value)),
            _ => Err(errors),
        }
    }
}

async fn get_config(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<JsonValue>> {
    let config = state.settings.all().await.map_err(internal_error)?;
    Ok(Json(json!({
        "status": "success",
        "config": config,
        "accessed_by": principal.subject,
    })))
}

async fn update_config(
    State(state): State<AppState>,
    principal: Principal,
    body: Bytes,
) -> AppResult<Json<JsonValue>> {
    let request: UpdateSettingRequest = parse_body(&body)?;
    let (name, value) = request.validate().map_err(validation_failed)?;

    let old_value = state
        .settings
        .set(&name, &value, &principal.subject)
        .await
        .map_err(internal_error)?;
    tracing::info!(
        setting = %name,
        subject = %principal.subject,
        previous = ?old_value,
        "configuration updated"
    );
    state.response_cache.invalidate(CONFIG_CACHE_PATTERN).await;

    Ok(Json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "updated_setting": {
            "name": name,
            "old_value": old_value,
            "new_value": value,
            "updated_by": principal.subject,
            "updated_at": Utc::now(),
        },
    })))
}

async fn reset_config(
    State(state): State<AppState>,
    principal: Principal,
) -> AppResult<Json<JsonValue>> {
    let config = state
        .settings
        .reset(&principal.subject)
        .await
        .map_err(internal_error)?;
    tracing::warn!(subject = %principal.subject, "configuration reset to defaults");
    state.response_cache.invalidate(CONFIG_CACHE_PATTERN).await;

    Ok(Json(json!({
        "status": "success",
        "message": "Configuration reset to defaults",
        "config": config,
    })))
}

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/config",
            guarded(
                state,
                auth::READ_CONFIG,
                cached(state, "config", CONFIG_TTL, get(get_config)),
            ),
        )
        .route(
            "/api/v1/config/update",
            guarded(state, auth::WRITE_CONFIG, post(update_config)),
        )
        .route(
            "/api/v1/config/reset",
            guarded(state, auth::WRITE_CONFIG, post(reset_config)),
        )
}
