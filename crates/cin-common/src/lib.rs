pub mod config;

pub use config::{KeaConfig, KeaServerConfig, LeaseConfig, LogFormat, ManagerConfig};
