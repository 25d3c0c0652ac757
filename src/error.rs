use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgrivaniError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Speech error: {0}")]
    Speech(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgrivaniError {
    /// Whether a gateway attempt that failed this way is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgrivaniError::NetworkFailure(_))
    }
}
