use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/health", get(health))
}

/// GET /api/health - liveness plus the Kea servers in use
async fn health(State(state): State<ApiState>) -> Json<Value> {
    let servers: Vec<Value> = state
        .registry
        .kea()
        .servers()
        .iter()
        .map(|s| json!({ "name": s.name, "url": s.url, "priority": s.priority }))
        .collect();

    Json(json!({
        "success": true,
        "status": "ok",
        "kea_servers": servers
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn test_health_lists_servers() {
        let app = TestApp::start().await;
        let (status, body) = app.call(Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kea_servers"][0]["name"], "primary");
        assert_eq!(body["kea_servers"][0]["url"], app.kea.url.as_str());
    }
}
