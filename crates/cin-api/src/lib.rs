pub mod error;
pub mod extract;
pub mod routes;
pub mod state;
pub mod validation;

use axum::Router;
use state::ApiState;
use tower_http::trace::TraceLayer;

/// JSON API on `/api/*`.
pub fn build_router(state: ApiState) -> Router {
    let api: Router = api_routes().with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<ApiState> {
    Router::new()
        .nest("/dhcp", routes::dhcp::router())
        .nest("/switches", routes::switches::router())
        .merge(routes::leases::router())
        .merge(routes::health::router())
}
