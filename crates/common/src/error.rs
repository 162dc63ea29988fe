use thiserror::Error;
use uuid::Uuid;

/// Structural verdicts from graph validation. None of these write any state;
/// they are surfaced to the caller before a run record exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphValidationError {
    #[error("workflow graph contains a cycle")]
    Cycle,

    #[error("workflow graph has no source node")]
    NoSource,

    /// The graph is disconnected: the listed nodes are unreachable from
    /// every source.
    #[error("nodes unreachable from any source: {0:?}")]
    Unreachable(Vec<Uuid>),
}

/// Failures the execution engine reports to its caller.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Covers both missing workflows and ownership mismatches so callers
    /// cannot enumerate other users' workflow ids.
    #[error("workflow not found")]
    WorkflowNotFound,

    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] GraphValidationError),

    #[error("no handler registered for node type '{0}'")]
    UnknownNodeType(String),

    #[error("invalid configuration for node '{node}': {detail}")]
    ConfigInvalid { node: String, detail: String },

    #[error("node '{node}' failed: {detail}")]
    NodeFailed { node: String, detail: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("repository error: {0}")]
    Repository(String),
}

impl ExecutionError {
    /// True for failures caused by the caller's request rather than the
    /// runtime: the host maps these to a client-error response class.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ExecutionError::WorkflowNotFound
                | ExecutionError::EmptyWorkflow
                | ExecutionError::InvalidWorkflow(_)
                | ExecutionError::UnknownNodeType(_)
                | ExecutionError::ConfigInvalid { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_errors_convert_into_invalid_workflow() {
        let err: ExecutionError = GraphValidationError::Cycle.into();
        assert!(matches!(
            err,
            ExecutionError::InvalidWorkflow(GraphValidationError::Cycle)
        ));
        assert!(err.is_client_error());
    }

    #[test]
    fn node_failures_are_server_class() {
        let err = ExecutionError::NodeFailed {
            node: "fetch".into(),
            detail: "connection refused".into(),
        };
        assert!(!err.is_client_error());
        assert!(err.to_string().contains("fetch"));
    }
}
