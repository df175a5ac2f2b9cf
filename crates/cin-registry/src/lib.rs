//! Subnet registry: keeps Kea's subnet6 config and the local BVI mapping
//! table in step.
//!
//! Kea is authoritative. The mapping table is a secondary index that is only
//! written after Kea accepted a change, so the two can drift apart; drift is
//! found with [`SubnetRegistry::find_orphans`] and repaired with
//! [`SubnetRegistry::link_orphaned`].

pub mod error;
pub mod option_defs;
pub mod store;
pub mod subnets;
pub mod types;

pub use error::RegistryError;
pub use option_defs::{sync_vendor_option_defs, OptionDefSyncReport, VENDOR_SPACE};
pub use store::MappingStore;
pub use subnets::{next_free_id, SubnetRegistry};
pub use types::*;
