use thiserror::Error;

/// Error taxonomy shared across the orchestration layer.
///
/// `ToolUnknown` is deliberately absent: an unrecognised tool name is not a
/// caller-visible error, it becomes an `is_error` tool result so the model
/// can adapt (see `agent::run`).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("inference subprocess unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned status {code}: {body}")]
    UpstreamStatus { code: u16, body: String },

    #[error("tool infrastructure failure: {0}")]
    ToolInfrastructure(#[source] anyhow::Error),

    #[error("agent loop stuck: repeated identical failing tool call")]
    AgentStuck,

    #[error("agent loop reached maximum iterations ({0})")]
    MaxIterations(usize),

    #[error("cancelled")]
    Cancelled,
}
