use async_trait::async_trait;
use uuid::Uuid;

use common::error::ExecutionError;
use common::types::{Document, Edge, Node, NodeExecution, RunStatus, Workflow, WorkflowRun};

/// Read side of the workflow editor's storage, narrowed to what execution
/// needs.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Load a workflow with its nodes and edges, checking ownership. A
    /// missing workflow and a foreign workflow are the same error.
    async fn load_for_execution(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Workflow, Vec<Node>, Vec<Edge>), ExecutionError>;
}

/// Persistence of runs and per-node executions. Both record kinds are
/// created `running` and finalized exactly once; a second terminal write is
/// an error.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        input: &Document,
    ) -> Result<Uuid, ExecutionError>;

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<(), ExecutionError>;

    async fn create_node_execution(
        &self,
        run_id: Uuid,
        node_id: Uuid,
        execution_order: i32,
    ) -> Result<Uuid, ExecutionError>;

    async fn finalize_node_execution(
        &self,
        node_execution_id: Uuid,
        status: RunStatus,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<(), ExecutionError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, ExecutionError>;

    /// Node executions of one run, ordered by `execution_order`.
    async fn list_node_executions(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<NodeExecution>, ExecutionError>;
}
