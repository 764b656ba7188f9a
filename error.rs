use thiserror::Error;

/// Error taxonomy shared by every ETDK component.
#[derive(Debug, Error)]
pub enum EtdkError {
    /// Random source exhaustion, cipher init/update/finalize failures
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Open, read, write, seek, flush, rename or remove failures
    #[error("I/O error: {0}")]
    Io(String),

    /// Size query, device classification, memory lock/unlock failures
    #[error("Platform error: {0}")]
    Platform(String),

    /// Empty target path, target that is neither a file nor a device, misuse of a one-shot API
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl EtdkError {
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error belongs to the `Io` class.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for EtdkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EtdkError>;
