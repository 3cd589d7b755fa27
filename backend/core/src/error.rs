use thiserror::Error;

/// Stage names used in [`RagError::StageFailure`].
pub mod stage {
    pub const RETRIEVE: &str = "retrieve";
    pub const CALL_MODEL: &str = "call_model";
    pub const LOCAL_MODEL: &str = "local_model";
}

/// Every failure the pipeline can report to a caller.
///
/// Failures travel through task handles as a single terminal outcome; they are
/// never raised across an async boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RagError {
    /// Empty key, query or batch. Rejected before any work is scheduled.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The managed resource is held by another exclusive operation.
    #[error("resource is currently in use, please retry")]
    ResourceBusy,

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource initialization failed: {0}")]
    ResourceInitFailure(String),

    #[error("operation stopped by user")]
    StoppedByUser,

    /// A collaborator (retriever, model caller) reported an error.
    #[error("{stage} failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// The manager was shut down and no longer accepts work.
    #[error("manager has been shut down")]
    ShutDown,
}

impl RagError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        RagError::InvalidInput(message.into())
    }

    pub fn stage(stage: &str, message: impl Into<String>) -> Self {
        RagError::StageFailure {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Converts a caught panic payload into an [`RagError::Unexpected`].
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        RagError::Unexpected(message)
    }
}

impl From<anyhow::Error> for RagError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors that were wrapped on their way up.
        match err.downcast::<RagError>() {
            Ok(rag) => rag,
            Err(other) => RagError::Unexpected(format!("{:#}", other)),
        }
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        RagError::Unexpected(err.to_string())
    }
}
