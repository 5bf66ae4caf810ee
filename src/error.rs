/// Error taxonomy shared by the interpreter, the request builder and the
/// extraction engine.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReciteError {
    #[error("Invalid method '{0}'")]
    UnknownMethod(String),

    #[error("Required parameter '{param}' missing for method '{method}'")]
    MissingRequiredParameter { method: String, param: String },

    #[error("Malformed condition '{0}', expected Name=Value or Name!=Value")]
    MalformedCondition(String),

    #[error("File '{file}' does not exist for param '{param}'")]
    FileReference { file: String, param: String },

    #[error("Address resolution failed for method '{method}': {reason}")]
    AddressResolution { method: String, reason: String },

    #[error("Unable to unset required variable {0}")]
    ProtectedVariable(String),

    #[error("Unable to set read-only internal variable {0}")]
    ReadOnly(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Until: timed out after {0}s")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("{message}\n  usage: {usage}")]
    Parse { message: String, usage: &'static str },

    #[error("Error evaluating expression '{expr}': {reason}")]
    Expression { expr: String, reason: String },

    #[error("{0}")]
    Script(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReciteError {
    pub fn parse(message: impl Into<String>, usage: &'static str) -> Self {
        ReciteError::Parse {
            message: message.into(),
            usage,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReciteError>;
