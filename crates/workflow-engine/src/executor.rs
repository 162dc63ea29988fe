use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use common::config::EngineConfig;
use common::error::ExecutionError;
use common::types::{Document, Node, RunStatus};
use node_handlers::{HandlerContext, HandlerError, HandlerRegistry};

use crate::graph;
use crate::repository::{RunRepository, WorkflowRepository};

/// What the caller gets back from a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// The last completed node's output.
    pub output: Option<Document>,
    /// Every node's output in execution order, keyed by node name.
    pub node_outputs: Vec<(String, Document)>,
}

/// Drives one workflow run: validate, create the run record, execute nodes
/// in topological order, persist per-node state, finalize. Holds no
/// per-run state itself, so separate runs may be driven concurrently.
pub struct WorkflowExecutor {
    workflows: Arc<dyn WorkflowRepository>,
    runs: Arc<dyn RunRepository>,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
}

impl WorkflowExecutor {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        runs: Arc<dyn RunRepository>,
        registry: Arc<HandlerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows,
            runs,
            registry,
            config,
        }
    }

    pub async fn execute(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        input: Document,
    ) -> Result<RunOutcome, ExecutionError> {
        self.execute_cancellable(workflow_id, user_id, input, CancellationToken::new())
            .await
    }

    #[instrument(skip(self, input, cancel), fields(workflow_id = %workflow_id, user_id = %user_id))]
    pub async fn execute_cancellable(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        input: Document,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutionError> {
        let (workflow, nodes, edges) = self
            .workflows
            .load_for_execution(workflow_id, user_id)
            .await?;

        if nodes.is_empty() {
            return Err(ExecutionError::EmptyWorkflow);
        }

        // Validation failures surface before any run record exists.
        let report = graph::validate(&nodes, &edges, self.config.allow_disconnected_graphs)?;
        if !report.unreachable.is_empty() {
            tracing::warn!(
                workflow_id = %workflow_id,
                unreachable = report.unreachable.len(),
                "executing disconnected workflow; unreached nodes still run"
            );
        }

        let run_id = self.runs.create_run(workflow_id, user_id, &input).await?;
        info!(run_id = %run_id, workflow = %workflow.name, nodes = nodes.len(), "run started");

        let node_map: HashMap<Uuid, &Node> = nodes.iter().map(|n| (n.id, n)).collect();
        let ctx = HandlerContext {
            run_id,
            workflow_id,
            user_id,
        };

        let mut outputs: HashMap<String, Document> = HashMap::new();
        let mut node_outputs: Vec<(String, Document)> = Vec::with_capacity(report.order.len());
        let mut last_output: Option<Document> = None;

        for (order, node_id) in report.order.iter().enumerate() {
            let node = node_map.get(node_id).ok_or_else(|| {
                ExecutionError::Repository(format!("ordered node {} missing from load", node_id))
            })?;

            let node_execution_id = self
                .runs
                .create_node_execution(run_id, node.id, order as i32)
                .await?;

            if cancel.is_cancelled() {
                let detail = ExecutionError::Cancelled.to_string();
                self.runs
                    .finalize_node_execution(node_execution_id, RunStatus::Failed, None, Some(&detail))
                    .await?;
                self.runs
                    .finalize_run(run_id, RunStatus::Failed, None, Some(&detail))
                    .await?;
                info!(run_id = %run_id, node = %node.name, "run cancelled");
                return Err(ExecutionError::Cancelled);
            }

            let handler_input = build_handler_input(&input, &outputs);
            match self
                .registry
                .dispatch(&ctx, node, &input, &outputs, &handler_input)
                .await
            {
                Ok(output) => {
                    self.runs
                        .finalize_node_execution(
                            node_execution_id,
                            RunStatus::Completed,
                            Some(&output),
                            None,
                        )
                        .await?;
                    outputs.insert(node.name.clone(), output.clone());
                    node_outputs.push((node.name.clone(), output.clone()));
                    last_output = Some(output);
                }
                Err(handler_err) => {
                    let detail = handler_err.to_string();
                    self.runs
                        .finalize_node_execution(
                            node_execution_id,
                            RunStatus::Failed,
                            None,
                            Some(&detail),
                        )
                        .await?;
                    self.runs
                        .finalize_run(run_id, RunStatus::Failed, None, Some(&detail))
                        .await?;
                    error!(run_id = %run_id, node = %node.name, error = %detail, "node failed; run aborted");

                    return Err(match handler_err {
                        HandlerError::UnknownNodeType(tag) => ExecutionError::UnknownNodeType(tag),
                        HandlerError::InvalidConfig { .. } => ExecutionError::ConfigInvalid {
                            node: node.name.clone(),
                            detail,
                        },
                        HandlerError::Execution { .. } => ExecutionError::NodeFailed {
                            node: node.name.clone(),
                            detail,
                        },
                    });
                }
            }
        }

        self.runs
            .finalize_run(run_id, RunStatus::Completed, last_output.as_ref(), None)
            .await?;
        info!(run_id = %run_id, nodes = node_outputs.len(), "run completed");

        Ok(RunOutcome {
            run_id,
            status: RunStatus::Completed,
            output: last_output,
            node_outputs,
        })
    }
}

/// Workflow input merged with prior outputs keyed by node name. A
/// non-object input nests under `"input"` so the merge stays an object.
fn build_handler_input(input: &Document, outputs: &HashMap<String, Document>) -> Document {
    let mut merged = match input {
        Document::Object(map) => map.clone(),
        Document::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    for (name, output) in outputs {
        merged.insert(name.clone(), output.clone());
    }
    Document::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::types::{Edge, NodeType, Position, VectorDocument, Workflow};
    use node_handlers::vector::FaissSearchHandler;
    use node_handlers::NodeHandler;
    use serde_json::json;
    use vector_service::{
        CollectionService, DiskVectorStore, HashingEmbedder, InMemoryCollectionRepository,
    };

    use crate::memory::{InMemoryRunRepository, InMemoryWorkflowRepository};

    /// Returns its rendered config, tagged with the handler type.
    struct EchoHandler(NodeType);

    #[async_trait]
    impl NodeHandler for EchoHandler {
        fn type_tag(&self) -> NodeType {
            self.0
        }

        fn validate_config(&self, _config: &Document) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn execute(
            &self,
            _ctx: &HandlerContext,
            config: &Document,
            input: &Document,
        ) -> Result<Document, HandlerError> {
            let mut output = config.clone();
            if let Document::Object(map) = &mut output {
                map.insert("response".to_string(), json!("generated text"));
                map.insert("seen_input".to_string(), input.clone());
            }
            Ok(output)
        }
    }

    struct FailingHandler(NodeType);

    #[async_trait]
    impl NodeHandler for FailingHandler {
        fn type_tag(&self) -> NodeType {
            self.0
        }

        fn validate_config(&self, _config: &Document) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn execute(
            &self,
            _ctx: &HandlerContext,
            _config: &Document,
            _input: &Document,
        ) -> Result<Document, HandlerError> {
            Err(HandlerError::execution("http_request", "upstream returned 503"))
        }
    }

    struct Fixture {
        workflows: Arc<InMemoryWorkflowRepository>,
        runs: Arc<InMemoryRunRepository>,
        registry: HandlerRegistry,
        workflow_id: Uuid,
        user_id: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = HandlerRegistry::new();
            registry.register(Arc::new(EchoHandler(NodeType::LlmCall)));
            registry.register(Arc::new(EchoHandler(NodeType::HttpRequest)));
            Self {
                workflows: Arc::new(InMemoryWorkflowRepository::new()),
                runs: Arc::new(InMemoryRunRepository::new()),
                registry,
                workflow_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            }
        }

        fn node(&self, name: &str, node_type: NodeType, config: Document) -> Node {
            Node {
                id: Uuid::new_v4(),
                workflow_id: self.workflow_id,
                name: name.to_string(),
                node_type,
                config,
                position: Position::default(),
            }
        }

        fn edge(&self, source: &Node, target: &Node) -> Edge {
            Edge {
                id: Uuid::new_v4(),
                workflow_id: self.workflow_id,
                source_node_id: source.id,
                target_node_id: target.id,
            }
        }

        async fn seed(&self, nodes: Vec<Node>, edges: Vec<Edge>) {
            let workflow = Workflow {
                id: self.workflow_id,
                user_id: self.user_id,
                name: "test workflow".into(),
                description: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.workflows.insert(workflow, nodes, edges).await;
        }

        fn executor(self) -> (WorkflowExecutor, Arc<InMemoryRunRepository>, Uuid, Uuid) {
            let runs = self.runs.clone();
            let executor = WorkflowExecutor::new(
                self.workflows,
                runs.clone(),
                Arc::new(self.registry),
                EngineConfig::default(),
            );
            (executor, runs, self.workflow_id, self.user_id)
        }
    }

    #[tokio::test]
    async fn linear_chain_completes_with_dense_orders() {
        let fixture = Fixture::new();
        let a = fixture.node(
            "A",
            NodeType::LlmCall,
            json!({"prompt_template": "{topic}"}),
        );
        let b = fixture.node(
            "B",
            NodeType::HttpRequest,
            json!({"url": "https://api.example.com/{A.response}"}),
        );
        let edges = vec![fixture.edge(&a, &b)];
        fixture.seed(vec![a, b], edges).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let outcome = executor
            .execute(workflow_id, user_id, json!({"topic": "cats"}))
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.node_outputs.len(), 2);
        assert_eq!(outcome.node_outputs[0].0, "A");
        // A's template resolved from the workflow input.
        assert_eq!(outcome.node_outputs[0].1["prompt_template"], "cats");
        assert!(!outcome.node_outputs[0].1["response"]
            .as_str()
            .unwrap()
            .is_empty());
        // B's url rendered from A's output with nothing left over.
        let url = outcome.node_outputs[1].1["url"].as_str().unwrap();
        assert!(!url.contains('{'), "unrendered url: {}", url);

        let executions = runs.list_node_executions(outcome.run_id).await.unwrap();
        assert_eq!(executions.len(), 2);
        assert_eq!(
            executions.iter().map(|e| e.execution_order).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(executions.iter().all(|e| e.status == RunStatus::Completed));

        let run = runs.get_run(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.output_data, outcome.output);
    }

    #[tokio::test]
    async fn diamond_executes_all_four_nodes_deterministically() {
        let fixture = Fixture::new();
        let a = fixture.node("A", NodeType::LlmCall, json!({"tag": "a"}));
        let b = fixture.node("B", NodeType::LlmCall, json!({"tag": "b"}));
        let c = fixture.node("C", NodeType::LlmCall, json!({"tag": "c"}));
        let d = fixture.node("D", NodeType::LlmCall, json!({"tag": "d"}));
        let edges = vec![
            fixture.edge(&a, &b),
            fixture.edge(&a, &c),
            fixture.edge(&b, &d),
            fixture.edge(&c, &d),
        ];
        fixture.seed(vec![a, b, c, d], edges).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let first = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap();
        let second = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap();

        let names = |outcome: &RunOutcome| -> Vec<String> {
            outcome.node_outputs.iter().map(|(n, _)| n.clone()).collect()
        };
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first).first().map(String::as_str), Some("A"));
        assert_eq!(names(&first).last().map(String::as_str), Some("D"));

        let executions = runs.list_node_executions(first.run_id).await.unwrap();
        assert_eq!(executions.len(), 4);
        assert!(executions.iter().all(|e| e.status == RunStatus::Completed));
    }

    #[tokio::test]
    async fn failing_middle_node_stops_the_run() {
        let mut fixture = Fixture::new();
        fixture
            .registry
            .register(Arc::new(FailingHandler(NodeType::HttpRequest)));
        let a = fixture.node("A", NodeType::LlmCall, json!({}));
        let b = fixture.node("B", NodeType::HttpRequest, json!({}));
        let c = fixture.node("C", NodeType::LlmCall, json!({}));
        let edges = vec![fixture.edge(&a, &b), fixture.edge(&b, &c)];
        fixture.seed(vec![a, b, c], edges).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let err = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NodeFailed { .. }));
        assert!(err.to_string().contains("upstream returned 503"));

        assert_eq!(runs.run_count().await, 1);
        let run_id = runs.any_run_id().await.unwrap();
        let run = runs.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.as_deref().unwrap().contains("503"));

        let executions = runs.list_node_executions(run_id).await.unwrap();
        // C never started: A completed, B failed, nothing else.
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].status, RunStatus::Completed);
        assert_eq!(executions[1].status, RunStatus::Failed);
        assert!(executions[1]
            .error_message
            .as_deref()
            .unwrap()
            .contains("503"));
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_any_run_record() {
        let fixture = Fixture::new();
        let a = fixture.node("A", NodeType::LlmCall, json!({}));
        let b = fixture.node("B", NodeType::LlmCall, json!({}));
        let c = fixture.node("C", NodeType::LlmCall, json!({}));
        let edges = vec![
            fixture.edge(&a, &b),
            fixture.edge(&b, &c),
            fixture.edge(&c, &a),
        ];
        fixture.seed(vec![a, b, c], edges).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let err = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidWorkflow(_)));
        assert_eq!(runs.run_count().await, 0);
    }

    #[tokio::test]
    async fn empty_workflow_is_rejected_without_a_run() {
        let fixture = Fixture::new();
        fixture.seed(vec![], vec![]).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let err = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::EmptyWorkflow));
        assert_eq!(runs.run_count().await, 0);
    }

    #[tokio::test]
    async fn foreign_user_reads_as_not_found() {
        let fixture = Fixture::new();
        let a = fixture.node("A", NodeType::LlmCall, json!({}));
        fixture.seed(vec![a], vec![]).await;
        let (executor, _runs, workflow_id, _user_id) = fixture.executor();

        let err = executor
            .execute(workflow_id, Uuid::new_v4(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::WorkflowNotFound));
    }

    #[tokio::test]
    async fn unknown_node_type_records_failed_states() {
        let fixture = Fixture::new();
        // Only LlmCall and HttpRequest echo handlers are registered.
        let a = fixture.node("A", NodeType::DbWrite, json!({}));
        fixture.seed(vec![a], vec![]).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let err = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownNodeType(_)));

        let run_id = runs.any_run_id().await.unwrap();
        let run = runs.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let executions = runs.list_node_executions(run_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn unresolved_placeholder_passes_through_literally() {
        let fixture = Fixture::new();
        let a = fixture.node(
            "A",
            NodeType::LlmCall,
            json!({"prompt_template": "use {nonexistent.output}"}),
        );
        fixture.seed(vec![a], vec![]).await;
        let (executor, _runs, workflow_id, user_id) = fixture.executor();

        let outcome = executor
            .execute(workflow_id, user_id, json!({}))
            .await
            .unwrap();
        assert_eq!(
            outcome.node_outputs[0].1["prompt_template"],
            "use {nonexistent.output}"
        );
    }

    #[tokio::test]
    async fn pre_cancelled_run_fails_its_first_node() {
        let fixture = Fixture::new();
        let a = fixture.node("A", NodeType::LlmCall, json!({}));
        fixture.seed(vec![a], vec![]).await;
        let (executor, runs, workflow_id, user_id) = fixture.executor();

        let token = CancellationToken::new();
        token.cancel();
        let err = executor
            .execute_cancellable(workflow_id, user_id, json!({}), token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));

        let run_id = runs.any_run_id().await.unwrap();
        let run = runs.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let executions = runs.list_node_executions(run_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, RunStatus::Failed);
        assert!(executions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("cancelled"));
    }

    #[tokio::test]
    async fn vector_search_feeds_the_next_prompt() {
        let mut fixture = Fixture::new();
        let user_id = fixture.user_id;

        // Real collection service seeded with three python docs.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskVectorStore::new(
            dir.path(),
            Arc::new(HashingEmbedder::new(64)),
        ));
        let collections = Arc::new(CollectionService::new(
            Arc::new(InMemoryCollectionRepository::new()),
            store,
            64,
        ));
        collections
            .create_collection(
                user_id,
                "kb",
                &[
                    VectorDocument::new("python supports list comprehensions"),
                    VectorDocument::new("python uses significant whitespace"),
                    VectorDocument::new("python has a large standard library"),
                ],
            )
            .await
            .unwrap();
        fixture
            .registry
            .register(Arc::new(FaissSearchHandler::new(collections)));

        let s = fixture.node(
            "S",
            NodeType::FaissSearch,
            json!({"collection_name": "kb", "query": "{q}", "top_k": 2}),
        );
        let l = fixture.node(
            "L",
            NodeType::LlmCall,
            json!({"prompt_template": "answer using {S.results}"}),
        );
        let edges = vec![fixture.edge(&s, &l)];
        fixture.seed(vec![s, l], edges).await;
        let (executor, _runs, workflow_id, user_id) = fixture.executor();

        let outcome = executor
            .execute(workflow_id, user_id, json!({"q": "python"}))
            .await
            .unwrap();

        let (s_name, s_output) = &outcome.node_outputs[0];
        assert_eq!(s_name, "S");
        assert!(s_output["total_results"].as_u64().unwrap() <= 2);
        assert_eq!(s_output["query"], "python");

        let (_, l_output) = &outcome.node_outputs[1];
        let prompt = l_output["prompt_template"].as_str().unwrap();
        assert!(!prompt.contains("{S.results}"), "unrendered prompt: {}", prompt);
        assert!(prompt.contains("python"));
    }
}
