use std::sync::Arc;

use cin_leases::LeaseService;
use cin_registry::SubnetRegistry;

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SubnetRegistry>,
    pub leases: Arc<LeaseService>,
}
