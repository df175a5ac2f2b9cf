//! Lease and host-reservation pass-through to Kea, with a short-lived read
//! cache for paged lease listings.

pub mod cache;
pub mod error;
pub mod service;
pub mod types;

pub use cache::TtlCache;
pub use error::LeaseError;
pub use service::LeaseService;
pub use types::{Lease6, LeasePage, Reservation, ReservationKey};
