use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use cin_registry::BviInterface;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath};
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list_switches).post(create_switch))
        .route("/{id}", get(get_switch).delete(delete_switch))
        .route("/{id}/bvi", get(list_bvis).post(create_bvi))
}

fn bvi_json(bvi: &BviInterface) -> Value {
    let mut value = json!(bvi);
    value["name"] = json!(bvi.display_name());
    value
}

/// GET /api/switches
async fn list_switches(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let switches = state.registry.store().list_switches()?;
    Ok(Json(json!({ "success": true, "data": switches })))
}

#[derive(Debug, Deserialize)]
struct SwitchForm {
    hostname: Option<String>,
}

/// POST /api/switches - body `{ "hostname": .. }`
async fn create_switch(
    State(state): State<ApiState>,
    ApiJson(form): ApiJson<SwitchForm>,
) -> ApiResult<Json<Value>> {
    let hostname = form.hostname.unwrap_or_default();
    let switch = state.registry.store().create_switch(&hostname)?;
    info!(switch_id = switch.id, hostname = %switch.hostname, "Switch created");
    Ok(Json(json!({ "success": true, "data": switch })))
}

/// GET /api/switches/{id}
async fn get_switch(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<Value>> {
    let store = state.registry.store();
    let switch = store
        .get_switch(id)?
        .ok_or_else(|| ApiError::not_found(format!("Switch not found: {id}")))?;
    let bvis: Vec<Value> = store.list_bvis(id)?.iter().map(bvi_json).collect();

    Ok(Json(json!({
        "success": true,
        "data": { "switch": switch, "bvi_interfaces": bvis }
    })))
}

/// DELETE /api/switches/{id} - refused while the switch still has subnets
async fn delete_switch(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<Value>> {
    state.registry.store().delete_switch(id)?;
    info!(switch_id = id, "Switch deleted");
    Ok(Json(json!({ "success": true, "message": format!("Switch {id} deleted") })))
}

/// GET /api/switches/{id}/bvi
async fn list_bvis(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<Value>> {
    let store = state.registry.store();
    if store.get_switch(id)?.is_none() {
        return Err(ApiError::not_found(format!("Switch not found: {id}")));
    }
    let bvis: Vec<Value> = store.list_bvis(id)?.iter().map(bvi_json).collect();
    Ok(Json(json!({ "success": true, "data": bvis })))
}

#[derive(Debug, Deserialize)]
struct BviForm {
    interface_number: Option<u32>,
    ipv6_address: Option<String>,
}

/// POST /api/switches/{id}/bvi - body `{ "interface_number": 0, "ipv6_address": .. }`
async fn create_bvi(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(form): ApiJson<BviForm>,
) -> ApiResult<Json<Value>> {
    let mut errors = Vec::new();
    if form.interface_number.is_none() {
        errors.push("Field 'interface_number' is required".to_string());
    }
    let address = match form.ipv6_address.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push("Field 'ipv6_address' is required".to_string());
            None
        }
        Some(raw) => match raw.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                errors.push("Invalid IPv6 address format for ipv6_address".to_string());
                None
            }
        },
    };
    let (Some(number), Some(address)) = (form.interface_number, address) else {
        return Err(ApiError::validation(errors));
    };

    let bvi = state.registry.store().create_bvi(id, number, address)?;
    info!(switch_id = id, bvi = %bvi.display_name(), "BVI interface created");
    Ok(Json(json!({ "success": true, "data": bvi_json(&bvi) })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support::TestApp;

    #[tokio::test]
    async fn test_switch_and_bvi_crud() {
        let app = TestApp::start().await;

        let (status, body) = app
            .call(Method::POST, "/api/switches", Some(json!({ "hostname": "cin-sw-02" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = app
            .call(Method::POST, "/api/switches", Some(json!({ "hostname": "cin-sw-02" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/api/switches/{id}/bvi");
        let (status, body) = app
            .call(
                Method::POST,
                &uri,
                Some(json!({ "interface_number": 3, "ipv6_address": "2001:db8:3::1" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "BVI103");

        let (status, body) = app.call(Method::POST, &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"].as_array().unwrap().len(), 2);

        let (_, body) = app.call(Method::GET, &format!("/api/switches/{id}"), None).await;
        assert_eq!(body["data"]["bvi_interfaces"][0]["ipv6_address"], "2001:db8:3::1");

        let (status, _) = app.call(Method::GET, "/api/switches/999/bvi", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_switch_with_subnet_cannot_be_deleted() {
        let app = TestApp::start().await;
        let bvi = app.seed_bvi();
        let (status, _) = app
            .call(
                Method::POST,
                "/api/dhcp",
                Some(json!({
                    "subnet": "2001:db8:1::/64",
                    "relay_address": "2001:db8:1::1",
                    "bvi_interface_id": bvi.id
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let uri = format!("/api/switches/{}", bvi.switch_id);
        let (status, _) = app.call(Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        app.call(Method::DELETE, "/api/dhcp/1", None).await;
        let (status, _) = app.call(Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.call(Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
