//! Client for the Kea Control Agent JSON command API.
//!
//! Requests are `{"command", "service", "arguments"}` envelopes POSTed to the
//! agent; answers are decoded once into [`KeaResponse`] so callers never look
//! at raw result codes.

pub mod client;
pub mod error;
pub mod protocol;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{KeaClient, ServerOutcome};
pub use error::KeaError;
pub use protocol::{commands, KeaResponse};
