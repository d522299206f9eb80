use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("object not found")]
    NotFound,

    #[error("principal not found: {0}")]
    PrincipalNotFound(String),

    #[error("operation forbidden")]
    Forbidden,

    #[error("storage quota exceeded: requested {requested} bytes, {remaining} remaining")]
    QuotaExceeded { requested: i64, remaining: i64 },

    #[error("rate limit exceeded, retry in {retry_after:.2}s")]
    RateLimited { retry_after: f64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Stable response code for callers mapping errors onto a wire or
    /// exit surface.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::NotFound | VaultError::PrincipalNotFound(_) => "NotFound",
            VaultError::Forbidden => "Forbidden",
            VaultError::QuotaExceeded { .. } => "QuotaExceeded",
            VaultError::RateLimited { .. } => "RateLimited",
            VaultError::InvalidRequest(_) => "InvalidRequest",
            VaultError::Io(_) | VaultError::FingerprintMismatch { .. } => "IOError",
            VaultError::Config(_) => "Config",
            VaultError::Database(_) | VaultError::Internal(_) => "Internal",
        }
    }
}
