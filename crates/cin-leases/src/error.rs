use cin_kea::KeaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Kea(#[from] KeaError),

    #[error("Unexpected Kea data: {0}")]
    UnexpectedKeaData(String),
}
