use cryptoki_sys::CK_RV;
use thiserror::Error;

pub type SignerResult<T> = Result<T, SignerError>;

/// Classification of every error that can cross a provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad key label, PIN, key material or request data. Reported, never fatal.
    Configuration,
    /// Library resolution or native call failure. The provider stays re-loadable.
    Provider,
    /// Programmer or deployment error (sign before startup, double startup).
    Usage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Provider => "provider",
            ErrorKind::Usage => "usage",
        }
    }

    /// Usage errors must not be handled at the request level.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Usage)
    }
}

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("configuration error: certificate for {0} not found")]
    CertificateNotFound(String),
    #[error("configuration error: invalid PIN")]
    InvalidPin,
    #[error("configuration error: private key {0} not found")]
    KeyNotFound(String),
    #[error("configuration error: invalid hash: {0}")]
    InvalidHash(String),
    #[error("unable to load shared library '{path}': {reason}")]
    Library { path: String, reason: String },
    #[error("an error occurred while calling '{operation}' function: 0x{rv:08x}")]
    Native { operation: &'static str, rv: CK_RV },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("usage error: {0}")]
    Usage(String),
}

impl SignerError {
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }

    pub fn provider<E: std::fmt::Display>(err: E) -> Self {
        Self::Provider(err.to_string())
    }

    pub fn usage<E: std::fmt::Display>(err: E) -> Self {
        Self::Usage(err.to_string())
    }

    pub fn native(operation: &'static str, rv: CK_RV) -> Self {
        Self::Native { operation, rv }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SignerError::Config(_)
            | SignerError::CertificateNotFound(_)
            | SignerError::InvalidPin
            | SignerError::KeyNotFound(_)
            | SignerError::InvalidHash(_) => ErrorKind::Configuration,
            SignerError::Library { .. } | SignerError::Native { .. } | SignerError::Provider(_) => {
                ErrorKind::Provider
            }
            SignerError::Usage(_) => ErrorKind::Usage,
        }
    }

    /// Native return code carried by the error, if any.
    pub fn native_code(&self) -> Option<CK_RV> {
        match self {
            SignerError::Native { rv, .. } => Some(*rv),
            _ => None,
        }
    }
}
