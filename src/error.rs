use thiserror::Error;

/// Failure talking to the persisted index store.
///
/// Only `Transient` failures are retried; every operation keyed by `filename`
/// is safe to repeat.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                let busy = db
                    .code()
                    .and_then(|c| c.parse::<i64>().ok())
                    .map(|c| matches!(c & 0xff, 5 | 6))
                    .unwrap_or(false);
                if busy || db.message().contains("database is locked") {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Permanent(err.to_string())
                }
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

/// Run-level failures of the reconciliation engine.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The same filename arrived twice in one run pointing at different blobs.
    #[error(
        "corpus inconsistency: '{filename}' listed with locator '{first}' and '{second}'"
    )]
    CorpusInconsistency {
        filename: String,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("image listing failed: {0}")]
    Listing(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
