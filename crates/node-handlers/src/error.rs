use thiserror::Error;

/// Failures raised by the dispatch layer and the handlers it drives. The
/// engine turns any of these into the node's failed terminal state.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for node type '{0}'")]
    UnknownNodeType(String),

    #[error("invalid {handler} config: {detail}")]
    InvalidConfig { handler: &'static str, detail: String },

    #[error("{handler} execution failed: {detail}")]
    Execution { handler: &'static str, detail: String },
}

impl HandlerError {
    pub fn invalid_config(handler: &'static str, detail: impl Into<String>) -> Self {
        HandlerError::InvalidConfig {
            handler,
            detail: detail.into(),
        }
    }

    pub fn execution(handler: &'static str, detail: impl ToString) -> Self {
        HandlerError::Execution {
            handler,
            detail: detail.to_string(),
        }
    }

    /// True when the failure is a config problem the caller can fix, as
    /// opposed to a runtime fault.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HandlerError::UnknownNodeType(_) | HandlerError::InvalidConfig { .. }
        )
    }
}
