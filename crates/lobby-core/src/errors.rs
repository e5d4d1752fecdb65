/// Failure raised by an API or sync handler.
///
/// The message is sent back to the caller verbatim, so keep it user-facing.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store error: {0}")]
    Store(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::InvalidInput(_) => "invalid_input",
            Self::Store(_) => "store",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_displays_message_verbatim() {
        assert_eq!(HandlerError::failed("board is full").to_string(), "board is full");
    }

    #[test]
    fn json_errors_are_invalid_input() {
        let err: HandlerError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert_eq!(err.error_kind(), "invalid_input");
    }
}
