pub mod collections;
pub mod embedder;
pub mod error;
pub mod repository;
pub mod store;

pub use collections::CollectionService;
pub use embedder::{Embedder, HashingEmbedder};
pub use error::{CollectionError, VectorStoreError};
pub use repository::{CollectionRepository, InMemoryCollectionRepository, PostgresCollectionRepository};
pub use store::{DiskVectorStore, SearchParams, VectorStore};
