use cin_ipv6::PoolError;
use cin_kea::KeaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidInput(#[from] PoolError),

    #[error("{0}")]
    Validation(String),

    #[error("Subnet {subnet} overlaps with existing subnet {existing} (ID: {existing_id})")]
    Overlap {
        subnet: String,
        existing: String,
        existing_id: u32,
    },

    #[error(
        "Vendor option definitions (vendor-4491) are not configured in Kea; sync them before assigning CCAP cores"
    )]
    VendorOptionsMissing,

    #[error("BVI interface {bvi} is already assigned to subnet {subnet_id}")]
    BviInUse { bvi: String, subnet_id: u32 },

    #[error("Switch not found: {0}")]
    SwitchNotFound(i64),

    #[error("BVI interface not found: {0}")]
    BviNotFound(i64),

    #[error("Subnet not found in Kea: {0}")]
    SubnetNotFound(u32),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("Switch {switch_id} still has {count} DHCP subnet(s); delete them first")]
    SwitchHasSubnets { switch_id: i64, count: i64 },

    #[error("Subnet ID {0} is already in use in Kea")]
    SubnetIdConflict(u32),

    #[error("Failed to write subnet {subnet_id} to Kea: {text}")]
    KeaSubnetWriteFailed { subnet_id: u32, text: String },

    #[error(transparent)]
    Kea(#[from] KeaError),

    #[error("Unexpected Kea data: {0}")]
    UnexpectedKeaData(String),

    #[error("Local database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Local database I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Map a SQLite UNIQUE / foreign-key violation to `Duplicate(what)`.
    pub(crate) fn from_sql(err: rusqlite::Error, what: impl FnOnce() -> String) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Duplicate(what())
            }
            _ => Self::Persistence(err),
        }
    }
}
