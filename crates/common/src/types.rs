use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque nested key/value document: null, bool, number, string, array, map.
/// Node configs, workflow inputs, and node outputs are all documents.
pub type Document = serde_json::Value;

// Workflow definition types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Unique within the workflow; the key other nodes use in templates.
    pub name: String,
    pub node_type: NodeType,
    pub config: Document,
    pub position: Position,
}

/// Canvas coordinates kept for the editor; the engine ignores them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
}

/// Closed set of executable node kinds; each maps to one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    LlmCall,
    HttpRequest,
    FaissSearch,
    DbWrite,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::LlmCall => "llm_call",
            NodeType::HttpRequest => "http_request",
            NodeType::FaissSearch => "faiss_search",
            NodeType::DbWrite => "db_write",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_call" => Ok(NodeType::LlmCall),
            "http_request" => Ok(NodeType::HttpRequest),
            "faiss_search" => Ok(NodeType::FaissSearch),
            "db_write" => Ok(NodeType::DbWrite),
            other => Err(format!("unknown node type: {}", other)),
        }
    }
}

// Execution record types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One execution of a workflow. Created `running`, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub status: RunStatus,
    pub input_data: Document,
    pub output_data: Option<Document>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One node's execution within a run. `execution_order` is dense 0..N-1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: Uuid,
    pub status: RunStatus,
    pub execution_order: i32,
    pub output_data: Option<Document>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// Vector collection types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorCollection {
    pub id: Uuid,
    pub user_id: Uuid,
    /// User-unique logical name; the physical index key is `{user_id}_{name}`.
    pub name: String,
    pub dimension: usize,
    pub index_path: String,
    pub document_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A text payload plus metadata destined for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Document>,
}

impl VectorDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(
        mut self,
        metadata: impl IntoIterator<Item = (impl Into<String>, Document)>,
    ) -> Self {
        self.metadata = metadata.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }
}

/// One similarity-search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Document>,
}
