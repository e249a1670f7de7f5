use thiserror::Error;

/// Errors surfaced by [`crate::DbEngine`].
///
/// Mirrors the shape of `mesio_engine::error::DownloadError` and
/// `rust_srec::database::db::DbError`: one flat enum, `#[from]` at the
/// edge, a classification method callers can switch on.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("operation aborted")]
    OperationAborted,

    #[error("store `{0}` is not present in the schema")]
    UnknownStore(String),

    #[error("store name `{0}` is not a valid identifier")]
    InvalidStoreName(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Whether this error is the result of a transaction being aborted
    /// (e.g. by [`crate::DbEngine::destroy`]), matching spec's
    /// `OPERATION_ABORTED` / STORAGE / CRITICAL classification.
    pub fn is_aborted(&self) -> bool {
        matches!(self, DbError::OperationAborted)
    }
}
