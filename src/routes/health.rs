use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mqtt_state: &'static str,
    pub messages_ingested: u64,
    pub messages_dropped: u64,
    pub live_subscribers: usize,
}

pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mqtt_state: state.monitor.state().as_str(),
        messages_ingested: state.monitor.message_count(),
        messages_dropped: state.monitor.dropped_count(),
        live_subscribers: state.broadcaster.subscriber_count(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}

#[cfg(test)]
mod tests {
    use crate::routes::router;
    use crate::test_support::{call, test_app};
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let app = test_app();
        let (status, _, json) =
            call(&router(app.state), Method::GET, "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mqtt_state"], "disconnected");
        assert_eq!(json["messages_ingested"], 0);
    }
}
