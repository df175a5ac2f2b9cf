use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use cin_registry::sync_vendor_option_defs;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::state::ApiState;
use crate::validation::{as_integer, SubnetForm};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list_subnets).post(create_subnet).put(update_subnet))
        .route("/next-id", get(next_id))
        .route("/orphans", get(orphans))
        .route("/sync-status", get(sync_status))
        .route("/config-backups", get(config_backups))
        .route("/link-orphaned", post(link_orphaned))
        .route("/option-defs/sync", post(sync_option_defs))
        .route("/orphaned/{id}", delete(delete_orphaned))
        .route("/{id}", get(get_subnet).delete(delete_subnet))
}

/// GET /api/dhcp - Kea subnets joined with their BVI mappings
async fn list_subnets(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let subnets = state.registry.enriched_subnets().await?;
    Ok(Json(json!({ "success": true, "data": subnets })))
}

/// POST /api/dhcp - create a subnet for a BVI interface
async fn create_subnet(
    State(state): State<ApiState>,
    ApiJson(form): ApiJson<SubnetForm>,
) -> ApiResult<Json<Value>> {
    let req = form.validate().map_err(ApiError::validation)?;
    let mapping = state.registry.create_subnet(&req).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Subnet {} created with ID {}", req.subnet, mapping.kea_subnet_id),
        "data": mapping
    })))
}

/// PUT /api/dhcp - update the subnet named by `subnet_id` in the body
async fn update_subnet(
    State(state): State<ApiState>,
    ApiJson(form): ApiJson<SubnetForm>,
) -> ApiResult<Json<Value>> {
    let mut errors = Vec::new();
    let subnet_id = form.subnet_id().map_err(|e| errors.push(e)).ok();
    let req = form.validate().map_err(|mut e| errors.append(&mut e)).ok();

    let (Some(subnet_id), Some(req)) = (subnet_id, req) else {
        return Err(ApiError::validation(errors));
    };

    let mapping = state.registry.update_subnet(subnet_id, &req).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Subnet {subnet_id} updated"),
        "data": mapping
    })))
}

/// GET /api/dhcp/{id}
async fn get_subnet(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<u32>,
) -> ApiResult<Json<Value>> {
    let subnet = state.registry.get_subnet(id).await?;
    Ok(Json(json!({ "success": true, "data": subnet })))
}

/// DELETE /api/dhcp/{id} - idempotent; a subnet already gone from Kea is not an error
async fn delete_subnet(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<u32>,
) -> ApiResult<Json<Value>> {
    let outcome = state.registry.delete_subnet(id).await?;
    let message = if outcome.removed_from_kea {
        format!("Subnet {id} deleted")
    } else {
        format!("Subnet {id} was not present in Kea")
    };
    Ok(Json(json!({ "success": true, "message": message, "data": outcome })))
}

/// GET /api/dhcp/next-id
async fn next_id(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let id = state.registry.next_available_subnet_id().await?;
    Ok(Json(json!({ "success": true, "data": { "next_id": id } })))
}

// ── Reconciliation ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LinkForm {
    #[serde(alias = "subnet_id")]
    kea_subnet_id: Option<Value>,
    bvi_interface_id: Option<Value>,
}

/// POST /api/dhcp/link-orphaned - attach an unmapped Kea subnet to a BVI interface
async fn link_orphaned(
    State(state): State<ApiState>,
    ApiJson(form): ApiJson<LinkForm>,
) -> ApiResult<Json<Value>> {
    let subnet_id = form
        .kea_subnet_id
        .as_ref()
        .and_then(as_integer)
        .and_then(|id| u32::try_from(id).ok());
    let bvi_id = form.bvi_interface_id.as_ref().and_then(as_integer);

    let (Some(subnet_id), Some(bvi_id)) = (subnet_id, bvi_id) else {
        return Err(ApiError::bad_request(
            "Missing required fields: kea_subnet_id and bvi_interface_id",
        ));
    };

    let mapping = state.registry.link_orphaned(subnet_id, bvi_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Subnet {subnet_id} linked to BVI interface {bvi_id}"),
        "data": mapping
    })))
}

/// GET /api/dhcp/orphans - Kea subnets without mappings and stale mappings
async fn orphans(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let report = state.registry.find_orphans().await?;
    Ok(Json(json!({ "success": true, "data": report })))
}

/// DELETE /api/dhcp/orphaned/{id} - remove an unmapped subnet from Kea
async fn delete_orphaned(
    State(state): State<ApiState>,
    ApiPath(id): ApiPath<u32>,
) -> ApiResult<Json<Value>> {
    state.registry.delete_orphaned_from_kea(id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Orphaned subnet {id} deleted from Kea")
    })))
}

/// GET /api/dhcp/sync-status - compare subnet config across Kea servers
async fn sync_status(State(state): State<ApiState>) -> Json<Value> {
    let status = state.registry.config_sync_status().await;
    Json(json!({ "success": true, "data": status }))
}

#[derive(Debug, Deserialize)]
struct BackupQuery {
    server: Option<String>,
}

/// GET /api/dhcp/config-backups?server= - config snapshots taken before subnet changes
async fn config_backups(
    State(state): State<ApiState>,
    ApiQuery(query): ApiQuery<BackupQuery>,
) -> ApiResult<Json<Value>> {
    let backups = state
        .registry
        .store()
        .list_config_backups(query.server.as_deref())?;
    Ok(Json(json!({ "success": true, "data": backups })))
}

/// POST /api/dhcp/option-defs/sync - push vendor-4491 option definitions
async fn sync_option_defs(State(state): State<ApiState>) -> Json<Value> {
    let report = sync_vendor_option_defs(state.registry.kea()).await;
    info!(
        succeeded = report.succeeded,
        failed = report.failures.len(),
        "Option definition sync requested"
    );
    Json(json!({ "success": report.is_complete(), "data": report }))
}
