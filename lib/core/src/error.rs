use crate::item::ItemId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Duplicate item: {0}")]
    DuplicateItem(ItemId),

    #[error("Unknown embedding space: {0}")]
    UnknownSpace(String),

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid vector for item {0}: non-finite component")]
    InvalidVector(ItemId),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Index build cancelled")]
    BuildCancelled,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// The caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::BuildCancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ItemNotFound(_))
    }
}
