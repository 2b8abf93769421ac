use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid data: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupted data: {0}")]
    Corruption(String),
    #[error("not found: {id}")]
    NotFound { id: String },
    #[error("{message}")]
    Remote { status: Option<u16>, message: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Remote { status, message: message.into() }
    }

    /// True for failures a fallback backend may be able to absorb.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Corruption(_) | Error::Serialization(_)
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::remote(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
