use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use common::types::{Document, Node, NodeType};

use crate::error::HandlerError;
use crate::template::{render_document, RenderScope};

/// Identity of the run driving a handler invocation. Handlers must not hold
/// on to it past `execute`.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
}

/// One executable node behavior. Implementations are stateless apart from
/// their injected client and safe to share across runs.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn type_tag(&self) -> NodeType;

    /// Cheap structural checks over the rendered config.
    fn validate_config(&self, config: &Document) -> Result<(), HandlerError>;

    async fn execute(
        &self,
        ctx: &HandlerContext,
        config: &Document,
        input: &Document,
    ) -> Result<Document, HandlerError>;
}

/// Process-wide `NodeType -> handler` table, seeded at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.type_tag(), handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    /// Run one node: look up its handler, render the config against the
    /// workflow input and prior outputs, validate, execute.
    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        node: &Node,
        workflow_input: &Document,
        prior_outputs: &HashMap<String, Document>,
        handler_input: &Document,
    ) -> Result<Document, HandlerError> {
        let handler = self
            .get(node.node_type)
            .ok_or_else(|| HandlerError::UnknownNodeType(node.node_type.as_str().to_string()))?;

        let locals = node.config.get("variables").and_then(|v| v.as_object());
        let scope = RenderScope::new(workflow_input, prior_outputs).with_locals(locals);
        let rendered = render_document(&node.config, &scope);

        handler.validate_config(&rendered)?;

        tracing::debug!(
            node = %node.name,
            node_type = %node.node_type,
            run_id = %ctx.run_id,
            "dispatching node"
        );
        handler.execute(ctx, &rendered, handler_input).await
    }
}

/// Registry seeded with the four built-in handlers, wired to the injected
/// clients and the deployment defaults.
pub fn builtin_registry(
    generator: Arc<dyn ai_service::TextGenerator>,
    http_client: Arc<dyn crate::http::HttpClient>,
    collections: Arc<vector_service::CollectionService>,
    sql_executor: Arc<dyn crate::sql::SqlExecutor>,
    config: &common::config::EngineConfig,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(crate::llm::LlmCallHandler::new(generator, config)));
    registry.register(Arc::new(crate::http::HttpRequestHandler::new(
        http_client,
        config,
    )));
    registry.register(Arc::new(crate::vector::FaissSearchHandler::new(collections)));
    registry.register(Arc::new(crate::sql::DbWriteHandler::new(sql_executor)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Position;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl NodeHandler for EchoHandler {
        fn type_tag(&self) -> NodeType {
            NodeType::LlmCall
        }

        fn validate_config(&self, config: &Document) -> Result<(), HandlerError> {
            if config.get("fail_validation").is_some() {
                return Err(HandlerError::invalid_config("echo", "told to fail"));
            }
            Ok(())
        }

        async fn execute(
            &self,
            _ctx: &HandlerContext,
            config: &Document,
            _input: &Document,
        ) -> Result<Document, HandlerError> {
            Ok(json!({"echo": config.get("msg").cloned().unwrap_or(Document::Null)}))
        }
    }

    fn node(config: Document) -> Node {
        Node {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            name: "echo".to_string(),
            node_type: NodeType::LlmCall,
            config,
            position: Position::default(),
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            run_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn builtin_registry_covers_every_node_type() {
        struct NullGenerator;

        #[async_trait]
        impl ai_service::TextGenerator for NullGenerator {
            async fn generate(
                &self,
                _request: ai_service::GenerationRequest,
            ) -> Result<ai_service::GenerationOutput, ai_service::LlmError> {
                Ok(ai_service::GenerationOutput {
                    text: String::new(),
                    model: "null".into(),
                    input_tokens: 0,
                    output_tokens: 0,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(vector_service::DiskVectorStore::new(
            dir.path(),
            Arc::new(vector_service::HashingEmbedder::new(8)),
        ));
        let collections = Arc::new(vector_service::CollectionService::new(
            Arc::new(vector_service::InMemoryCollectionRepository::new()),
            store,
            8,
        ));
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/workflows").unwrap();

        let registry = builtin_registry(
            Arc::new(NullGenerator),
            Arc::new(crate::http::ReqwestHttpClient::new()),
            collections,
            Arc::new(crate::sql::PostgresSqlExecutor::new(pool)),
            &common::config::EngineConfig::default(),
        );

        for node_type in [
            NodeType::LlmCall,
            NodeType::HttpRequest,
            NodeType::FaissSearch,
            NodeType::DbWrite,
        ] {
            assert!(registry.get(node_type).is_some(), "missing {}", node_type);
        }
    }

    #[tokio::test]
    async fn dispatch_renders_config_before_execute() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));

        let input = json!({"topic": "cats"});
        let outputs = HashMap::new();
        let output = registry
            .dispatch(&ctx(), &node(json!({"msg": "about {topic}"})), &input, &outputs, &input)
            .await
            .unwrap();
        assert_eq!(output["echo"], "about cats");
    }

    #[tokio::test]
    async fn dispatch_rejects_unregistered_type() {
        let registry = HandlerRegistry::new();
        let input = json!({});
        let outputs = HashMap::new();
        let err = registry
            .dispatch(&ctx(), &node(json!({})), &input, &outputs, &input)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnknownNodeType(_)));
    }

    #[tokio::test]
    async fn dispatch_surfaces_validation_failures() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));

        let input = json!({});
        let outputs = HashMap::new();
        let err = registry
            .dispatch(
                &ctx(),
                &node(json!({"fail_validation": true})),
                &input,
                &outputs,
                &input,
            )
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
