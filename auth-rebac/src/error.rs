use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Schema version mismatch: expected '{expected}', store has '{found}'")]
    SchemaVersionMismatch { expected: String, found: String },

    #[error("Unknown permission '{name}' for object type '{object_type}'")]
    UnknownPermission { object_type: String, name: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl RebacError {
    /// True for failures that mean "could not determine authorization".
    /// Callers must fail closed on these rather than treat them as a deny.
    pub fn is_transient(&self) -> bool {
        matches!(self, RebacError::StoreUnavailable(_))
    }
}

impl From<config::ConfigError> for RebacError {
    fn from(err: config::ConfigError) -> Self {
        RebacError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
