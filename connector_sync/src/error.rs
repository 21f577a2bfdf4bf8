use std::error::Error as StdError;

/// Common error type for `connector_sync`.
///
/// Operational connector failures are never surfaced through this type; they are
/// recorded in the ledger. Only store-level problems (connectivity, decoding,
/// constraint conflicts) and unusable input propagate to callers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "connector_sync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Map a sqlx error, turning unique-constraint violations into `Conflict`.
    pub fn from_write(context: &str, source: sqlx::Error) -> Self {
        if is_unique_violation(&source) {
            return Self::Conflict(format!("{context}: unique constraint violated"));
        }
        Self::backend(context, source)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.is_unique_violation();
    }
    false
}

pub type Result<T> = std::result::Result<T, Error>;
