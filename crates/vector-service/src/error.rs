use thiserror::Error;

/// Failures at the index/store layer.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index build failed: {0}")]
    IndexBuild(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("index I/O failed: {0}")]
    Io(String),

    #[error("index serialization failed: {0}")]
    Serialization(String),
}

/// Failures at the user-facing collection service layer.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("collection already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid documents: {0}")]
    InvalidDocuments(String),

    #[error("invalid collection name '{0}': only letters, digits, '_' and '-' are allowed")]
    InvalidName(String),

    #[error("index build failed: {0}")]
    IndexBuildFailed(String),

    #[error("search failed: {0}")]
    SearchFailed(String),

    /// One of the two delete targets (metadata row, index files) was removed
    /// and the other was not; the log carries what remains.
    #[error("collection delete partially failed: {0}")]
    DeletePartial(String),

    #[error(transparent)]
    Store(#[from] VectorStoreError),

    #[error("repository error: {0}")]
    Repository(String),
}
