use crate::gate::QuotaExceeded;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    /// Transient transport failure talking to the entitlement backend.
    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    AuthorizationDenied(QuotaExceeded),

    /// A profile upsert kept failing after a local mutation was computed.
    #[error("profile could not be persisted: {0}")]
    PersistenceConflict(String),

    #[error("no entitlement profile for user '{0}'")]
    ProfileNotFound(String),

    #[error("quantity must be greater than zero")]
    InvalidQuantity,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl AppError {
    /// Failures worth retrying the same request for.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::PersistenceConflict(_) => true,
            AppError::Http(e) => e.is_timeout() || e.is_connect(),
            AppError::Sql(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
