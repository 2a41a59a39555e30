//! Storage errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem access for the database file or firmware binaries.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("record encoding: {0}")]
    Serialization(String),

    /// The database rejected an operation.
    #[error("database: {0}")]
    Storage(String),

    #[error("consumer group not found: {0}")]
    GroupNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Every redb failure surfaces as [`Error::Storage`], tagged with the stage
/// that failed.
macro_rules! redb_error {
    ($($ty:ty => $stage:literal),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Storage(format!("{}: {}", $stage, e))
                }
            }
        )*
    };
}

redb_error! {
    redb::DatabaseError => "open",
    redb::TransactionError => "begin transaction",
    redb::TableError => "open table",
    redb::StorageError => "read/write",
    redb::CommitError => "commit",
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Storage(format!("blocking task failed: {}", e))
    }
}
