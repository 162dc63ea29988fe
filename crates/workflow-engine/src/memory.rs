//! In-memory repositories backing tests and embedded use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use common::error::ExecutionError;
use common::types::{Document, Edge, Node, NodeExecution, RunStatus, Workflow, WorkflowRun};

use crate::repository::{RunRepository, WorkflowRepository};

/// Fixed workflow definitions keyed by id.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: Mutex<HashMap<Uuid, (Workflow, Vec<Node>, Vec<Edge>)>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workflow: Workflow, nodes: Vec<Node>, edges: Vec<Edge>) {
        let mut workflows = self.workflows.lock().await;
        workflows.insert(workflow.id, (workflow, nodes, edges));
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn load_for_execution(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Workflow, Vec<Node>, Vec<Edge>), ExecutionError> {
        let workflows = self.workflows.lock().await;
        match workflows.get(&workflow_id) {
            Some((workflow, _, _)) if workflow.user_id != user_id => {
                Err(ExecutionError::WorkflowNotFound)
            }
            Some(entry) => Ok(entry.clone()),
            None => Err(ExecutionError::WorkflowNotFound),
        }
    }
}

#[derive(Default)]
struct RunState {
    runs: HashMap<Uuid, WorkflowRun>,
    node_executions: Vec<NodeExecution>,
}

/// Run and node-execution records in a mutex-guarded table.
#[derive(Default)]
pub struct InMemoryRunRepository {
    state: Mutex<RunState>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }

    /// Id of some stored run; handy in tests with exactly one run.
    pub async fn any_run_id(&self) -> Option<Uuid> {
        self.state.lock().await.runs.keys().next().copied()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        input: &Document,
    ) -> Result<Uuid, ExecutionError> {
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            workflow_id,
            user_id,
            status: RunStatus::Running,
            input_data: input.clone(),
            output_data: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        let run_id = run.id;
        let mut state = self.state.lock().await;
        state.runs.insert(run_id, run);
        Ok(run_id)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| ExecutionError::Repository(format!("no run {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(ExecutionError::Repository(format!(
                "run {} already finalized as {}",
                run_id, run.status
            )));
        }
        run.status = status;
        run.output_data = output.cloned();
        run.error_message = error.map(str::to_string);
        run.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn create_node_execution(
        &self,
        run_id: Uuid,
        node_id: Uuid,
        execution_order: i32,
    ) -> Result<Uuid, ExecutionError> {
        let record = NodeExecution {
            id: Uuid::new_v4(),
            run_id,
            node_id,
            status: RunStatus::Running,
            execution_order,
            output_data: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        let id = record.id;
        let mut state = self.state.lock().await;
        state.node_executions.push(record);
        Ok(id)
    }

    async fn finalize_node_execution(
        &self,
        node_execution_id: Uuid,
        status: RunStatus,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<(), ExecutionError> {
        let mut state = self.state.lock().await;
        let record = state
            .node_executions
            .iter_mut()
            .find(|ne| ne.id == node_execution_id)
            .ok_or_else(|| {
                ExecutionError::Repository(format!("no node execution {}", node_execution_id))
            })?;
        if record.status.is_terminal() {
            return Err(ExecutionError::Repository(format!(
                "node execution {} already finalized",
                node_execution_id
            )));
        }
        record.status = status;
        record.output_data = output.cloned();
        record.error_message = error.map(str::to_string);
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, ExecutionError> {
        let state = self.state.lock().await;
        Ok(state.runs.get(&run_id).cloned())
    }

    async fn list_node_executions(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<NodeExecution>, ExecutionError> {
        let state = self.state.lock().await;
        let mut executions: Vec<NodeExecution> = state
            .node_executions
            .iter()
            .filter(|ne| ne.run_id == run_id)
            .cloned()
            .collect();
        executions.sort_by_key(|ne| ne.execution_order);
        Ok(executions)
    }
}
