use std::net::Ipv6Addr;

use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use cin_leases::{Reservation, ReservationKey};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/leases", delete(delete_lease))
        .route("/leases/{subnet_id}", get(list_leases))
        .route(
            "/reservations",
            post(add_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .route("/reservations/{subnet_id}", get(list_reservations))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    from: Option<String>,
    limit: Option<u32>,
}

fn parse_address(field: &str, value: &str) -> ApiResult<Ipv6Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid IPv6 address format for {field}")))
}

/// GET /api/leases/{subnet_id}?from=&limit= - one cursor page of leases
async fn list_leases(
    State(state): State<ApiState>,
    ApiPath(subnet_id): ApiPath<u32>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> ApiResult<Json<Value>> {
    let from = match query.from.as_deref().map(str::trim) {
        None | Some("") | Some("start") => None,
        Some(ip) => Some(parse_address("from", ip)?),
    };

    let page = state.leases.leases_page(subnet_id, from, query.limit).await?;
    Ok(Json(json!({ "success": true, "data": page })))
}

#[derive(Debug, Deserialize)]
struct LeaseTarget {
    ip_address: Option<String>,
}

/// DELETE /api/leases - body `{ "ip_address": .. }`
async fn delete_lease(
    State(state): State<ApiState>,
    ApiJson(target): ApiJson<LeaseTarget>,
) -> ApiResult<Json<Value>> {
    let Some(ip) = target.ip_address.as_deref() else {
        return Err(ApiError::bad_request("Field 'ip_address' is required"));
    };
    let ip = parse_address("ip_address", ip)?;

    if state.leases.delete_lease(ip).await? {
        Ok(Json(json!({ "success": true, "message": format!("Lease {ip} deleted") })))
    } else {
        Err(ApiError::not_found(format!("Lease {ip} not found")))
    }
}

/// GET /api/reservations/{subnet_id}
async fn list_reservations(
    State(state): State<ApiState>,
    ApiPath(subnet_id): ApiPath<u32>,
) -> ApiResult<Json<Value>> {
    let hosts = state.leases.reservations(subnet_id).await?;
    Ok(Json(json!({ "success": true, "data": hosts })))
}

/// POST /api/reservations - body is a Kea host reservation
async fn add_reservation(
    State(state): State<ApiState>,
    ApiJson(host): ApiJson<Reservation>,
) -> ApiResult<Json<Value>> {
    state.leases.add_reservation(&host).await?;
    Ok(Json(json!({ "success": true, "message": "Reservation added" })))
}

/// PUT /api/reservations
async fn update_reservation(
    State(state): State<ApiState>,
    ApiJson(host): ApiJson<Reservation>,
) -> ApiResult<Json<Value>> {
    state.leases.update_reservation(&host).await?;
    Ok(Json(json!({ "success": true, "message": "Reservation updated" })))
}

#[derive(Debug, Deserialize)]
struct ReservationTarget {
    subnet_id: Option<u32>,
    ip_address: Option<String>,
    identifier_type: Option<String>,
    identifier: Option<String>,
}

/// DELETE /api/reservations - by `ip_address` or by `identifier_type` + `identifier`
async fn delete_reservation(
    State(state): State<ApiState>,
    ApiJson(target): ApiJson<ReservationTarget>,
) -> ApiResult<Json<Value>> {
    let Some(subnet_id) = target.subnet_id else {
        return Err(ApiError::bad_request("Field 'subnet_id' is required"));
    };

    let key = match (target.ip_address, target.identifier_type, target.identifier) {
        (Some(ip), _, _) => ReservationKey::Address(parse_address("ip_address", &ip)?),
        (None, Some(kind), Some(value)) => ReservationKey::Identifier { kind, value },
        _ => {
            return Err(ApiError::bad_request(
                "Either 'ip_address' or 'identifier_type' and 'identifier' are required",
            ));
        }
    };

    if state.leases.delete_reservation(subnet_id, &key).await? {
        Ok(Json(json!({ "success": true, "message": "Reservation deleted" })))
    } else {
        Err(ApiError::not_found("Reservation not found"))
    }
}
