//! sqlx-backed repositories over `workflows`/`workflow_nodes`/
//! `workflow_edges` (read side) and `workflow_runs`/`node_executions`
//! (write side).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use common::error::ExecutionError;
use common::types::{
    Document, Edge, Node, NodeExecution, NodeType, Position, RunStatus, Workflow, WorkflowRun,
};

use crate::repository::{RunRepository, WorkflowRepository};

fn repo_err(e: sqlx::Error) -> ExecutionError {
    ExecutionError::Repository(e.to_string())
}

pub struct PostgresWorkflowRepository {
    pool: PgPool,
}

impl PostgresWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn load_for_execution(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
    ) -> Result<(Workflow, Vec<Node>, Vec<Edge>), ExecutionError> {
        // Ownership is part of the lookup key, so a foreign workflow reads
        // exactly like a missing one.
        let workflow = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, user_id, name, description, created_at, updated_at
            FROM workflows
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(repo_err)?
        .ok_or(ExecutionError::WorkflowNotFound)?;

        let nodes = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT id, workflow_id, name, node_type, config, position_x, position_y
            FROM workflow_nodes
            WHERE workflow_id = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(repo_err)?;

        let edges = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT id, workflow_id, source_node_id, target_node_id
            FROM workflow_edges
            WHERE workflow_id = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(repo_err)?;

        let nodes = nodes
            .into_iter()
            .map(Node::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((
            workflow.into(),
            nodes,
            edges.into_iter().map(Edge::from).collect(),
        ))
    }
}

pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn create_run(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        input: &Document,
    ) -> Result<Uuid, ExecutionError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, user_id, status, input_data, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(user_id)
        .bind(RunStatus::Running.as_str())
        .bind(input)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;
        Ok(id)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<(), ExecutionError> {
        // The status guard makes the terminal write first-wins.
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, output_data = $3, error_message = $4, completed_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        if result.rows_affected() == 0 {
            return Err(ExecutionError::Repository(format!(
                "run {} is not running; terminal state already written",
                run_id
            )));
        }
        Ok(())
    }

    async fn create_node_execution(
        &self,
        run_id: Uuid,
        node_id: Uuid,
        execution_order: i32,
    ) -> Result<Uuid, ExecutionError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO node_executions (id, run_id, node_id, status, execution_order, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(run_id)
        .bind(node_id)
        .bind(RunStatus::Running.as_str())
        .bind(execution_order)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;
        Ok(id)
    }

    async fn finalize_node_execution(
        &self,
        node_execution_id: Uuid,
        status: RunStatus,
        output: Option<&Document>,
        error: Option<&str>,
    ) -> Result<(), ExecutionError> {
        let result = sqlx::query(
            r#"
            UPDATE node_executions
            SET status = $2, output_data = $3, error_message = $4, completed_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(node_execution_id)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;

        if result.rows_affected() == 0 {
            return Err(ExecutionError::Repository(format!(
                "node execution {} is not running; terminal state already written",
                node_execution_id
            )));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, ExecutionError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, workflow_id, user_id, status, input_data, output_data,
                   error_message, started_at, completed_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(repo_err)?;
        row.map(WorkflowRun::try_from).transpose()
    }

    async fn list_node_executions(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<NodeExecution>, ExecutionError> {
        let rows = sqlx::query_as::<_, NodeExecutionRow>(
            r#"
            SELECT id, run_id, node_id, status, execution_order, output_data,
                   error_message, started_at, completed_at
            FROM node_executions
            WHERE run_id = $1
            ORDER BY execution_order
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(repo_err)?;
        rows.into_iter().map(NodeExecution::try_from).collect()
    }
}

// Row types; status and node_type columns are text and parsed on the way out.

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        Workflow {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    workflow_id: Uuid,
    name: String,
    node_type: String,
    config: Document,
    position_x: f64,
    position_y: f64,
}

impl TryFrom<NodeRow> for Node {
    type Error = ExecutionError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let node_type: NodeType = row
            .node_type
            .parse()
            .map_err(ExecutionError::Repository)?;
        Ok(Node {
            id: row.id,
            workflow_id: row.workflow_id,
            name: row.name,
            node_type,
            config: row.config,
            position: Position {
                x: row.position_x,
                y: row.position_y,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    id: Uuid,
    workflow_id: Uuid,
    source_node_id: Uuid,
    target_node_id: Uuid,
}

impl From<EdgeRow> for Edge {
    fn from(row: EdgeRow) -> Self {
        Edge {
            id: row.id,
            workflow_id: row.workflow_id,
            source_node_id: row.source_node_id,
            target_node_id: row.target_node_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workflow_id: Uuid,
    user_id: Uuid,
    status: String,
    input_data: Document,
    output_data: Option<Document>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = ExecutionError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(WorkflowRun {
            id: row.id,
            workflow_id: row.workflow_id,
            user_id: row.user_id,
            status: row.status.parse().map_err(ExecutionError::Repository)?,
            input_data: row.input_data,
            output_data: row.output_data,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NodeExecutionRow {
    id: Uuid,
    run_id: Uuid,
    node_id: Uuid,
    status: String,
    execution_order: i32,
    output_data: Option<Document>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<NodeExecutionRow> for NodeExecution {
    type Error = ExecutionError;

    fn try_from(row: NodeExecutionRow) -> Result<Self, Self::Error> {
        Ok(NodeExecution {
            id: row.id,
            run_id: row.run_id,
            node_id: row.node_id,
            status: row.status.parse().map_err(ExecutionError::Repository)?,
            execution_order: row.execution_order,
            output_data: row.output_data,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
