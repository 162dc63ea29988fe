use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use common::types::{Document, SearchHit, VectorDocument};

use crate::embedder::Embedder;
use crate::error::VectorStoreError;

/// Search tuning passed through from the faiss_search handler.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub top_k: usize,
    pub score_threshold: Option<f32>,
    pub metadata_filter: Option<HashMap<String, Document>>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: None,
            metadata_filter: None,
        }
    }
}

/// Store boundary consumed by the collection service. Keys are physical
/// index names; user scoping happens a layer above.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(
        &self,
        name: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorStoreError>;

    async fn add_documents(
        &self,
        name: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorStoreError>;

    async fn search(
        &self,
        name: &str,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, VectorStoreError>;

    async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError>;

    async fn collection_exists(&self, name: &str) -> Result<bool, VectorStoreError>;

    /// Where the index for `name` lives on disk.
    fn index_path(&self, name: &str) -> PathBuf;
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    text: String,
    vector: Vec<f32>,
    #[serde(default)]
    metadata: HashMap<String, Document>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorIndex {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

/// Flat on-disk similarity index: one JSON file per collection under the
/// configured base path, cosine similarity over embedder output. Open
/// indices are cached per physical key; deletes invalidate the entry.
pub struct DiskVectorStore {
    base_path: PathBuf,
    dimension: usize,
    embedder: Arc<dyn Embedder>,
    cache: Cache<String, Arc<RwLock<VectorIndex>>>,
}

impl DiskVectorStore {
    pub fn new(base_path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        let dimension = embedder.dimension();
        Self {
            base_path: base_path.into(),
            dimension,
            embedder,
            cache: Cache::new(256),
        }
    }

    async fn embed_docs(&self, docs: &[VectorDocument]) -> Result<Vec<IndexEntry>, VectorStoreError> {
        let texts: Vec<String> = docs.iter().map(|d| d.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }
        Ok(docs
            .iter()
            .zip(vectors)
            .map(|(doc, vector)| IndexEntry {
                text: doc.text.clone(),
                vector,
                metadata: doc.metadata.clone(),
            })
            .collect())
    }

    async fn load_index(&self, name: &str) -> Result<Arc<RwLock<VectorIndex>>, VectorStoreError> {
        let path = self.index_path(name);
        self.cache
            .try_get_with(name.to_string(), async move {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        VectorStoreError::CollectionNotFound(path.display().to_string())
                    } else {
                        VectorStoreError::Io(e.to_string())
                    }
                })?;
                let index: VectorIndex = serde_json::from_slice(&bytes)
                    .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;
                Ok::<_, VectorStoreError>(Arc::new(RwLock::new(index)))
            })
            .await
            .map_err(|e: Arc<VectorStoreError>| match e.as_ref() {
                VectorStoreError::CollectionNotFound(n) => {
                    VectorStoreError::CollectionNotFound(n.clone())
                }
                other => VectorStoreError::Io(other.to_string()),
            })
    }

    async fn persist(&self, path: &Path, index: &VectorIndex) -> Result<(), VectorStoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VectorStoreError::Io(e.to_string()))?;
        }
        let bytes = serde_json::to_vec(index)
            .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| VectorStoreError::Io(e.to_string()))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn matches_filter(metadata: &HashMap<String, Document>, filter: &HashMap<String, Document>) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

#[async_trait]
impl VectorStore for DiskVectorStore {
    async fn create_collection(
        &self,
        name: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorStoreError> {
        let path = self.index_path(name);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| VectorStoreError::Io(e.to_string()))?
        {
            return Err(VectorStoreError::CollectionExists(name.to_string()));
        }

        let entries = self.embed_docs(docs).await?;
        let index = VectorIndex {
            dimension: self.dimension,
            entries,
        };
        self.persist(&path, &index).await?;
        self.cache
            .insert(name.to_string(), Arc::new(RwLock::new(index)))
            .await;

        tracing::info!(key = name, docs = docs.len(), "vector index created");
        Ok(())
    }

    async fn add_documents(
        &self,
        name: &str,
        docs: &[VectorDocument],
    ) -> Result<(), VectorStoreError> {
        let entries = self.embed_docs(docs).await?;
        let index = self.load_index(name).await?;
        let mut guard = index.write().await;
        guard.entries.extend(entries);
        self.persist(&self.index_path(name), &*guard).await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        let query_vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = query_vectors
            .first()
            .ok_or_else(|| VectorStoreError::Embedding("embedder returned no vector".into()))?;

        let index = self.load_index(name).await?;
        let guard = index.read().await;

        let mut hits: Vec<SearchHit> = guard
            .entries
            .iter()
            .filter(|entry| match &params.metadata_filter {
                Some(filter) => matches_filter(&entry.metadata, filter),
                None => true,
            })
            .map(|entry| SearchHit {
                text: entry.text.clone(),
                score: cosine(query_vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .filter(|hit| match params.score_threshold {
                Some(threshold) => hit.score >= threshold,
                None => true,
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(params.top_k);
        Ok(hits)
    }

    async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        self.cache.invalidate(name).await;
        let path = self.index_path(name);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VectorStoreError::CollectionNotFound(name.to_string())
            } else {
                VectorStoreError::Io(e.to_string())
            }
        })?;
        tracing::info!(key = name, "vector index deleted");
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, VectorStoreError> {
        tokio::fs::try_exists(self.index_path(name))
            .await
            .map_err(|e| VectorStoreError::Io(e.to_string()))
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;

    fn store(dir: &tempfile::TempDir) -> DiskVectorStore {
        DiskVectorStore::new(dir.path(), Arc::new(HashingEmbedder::new(64)))
    }

    fn docs(texts: &[&str]) -> Vec<VectorDocument> {
        texts.iter().map(|t| VectorDocument::new(*t)).collect()
    }

    #[tokio::test]
    async fn create_search_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        store
            .create_collection("u1_kb", &docs(&["python basics", "rust ownership", "cooking pasta"]))
            .await
            .unwrap();
        assert!(store.collection_exists("u1_kb").await.unwrap());

        let hits = store
            .search("u1_kb", "python", &SearchParams::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].text, "python basics");

        store.delete_collection("u1_kb").await.unwrap();
        assert!(!store.collection_exists("u1_kb").await.unwrap());
        assert!(!store.index_path("u1_kb").exists());
    }

    #[tokio::test]
    async fn create_twice_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create_collection("u1_kb", &docs(&["a"])).await.unwrap();
        let err = store.create_collection("u1_kb", &docs(&["b"])).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::CollectionExists(_)));
    }

    #[tokio::test]
    async fn add_documents_grows_the_index_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create_collection("u1_kb", &docs(&["alpha"])).await.unwrap();
        store.add_documents("u1_kb", &docs(&["beta", "gamma"])).await.unwrap();

        // Re-open bypassing the cache by reading the file directly.
        let bytes = std::fs::read(store.index_path("u1_kb")).unwrap();
        let index: VectorIndex = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(index.entries.len(), 3);
    }

    #[tokio::test]
    async fn search_honors_top_k_threshold_and_metadata_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let seeded = vec![
            VectorDocument::new("python tutorial")
                .with_metadata([("lang", Document::from("en"))]),
            VectorDocument::new("python reference")
                .with_metadata([("lang", Document::from("de"))]),
            VectorDocument::new("python intro")
                .with_metadata([("lang", Document::from("en"))]),
        ];
        store.create_collection("u1_kb", &seeded).await.unwrap();

        let params = SearchParams {
            top_k: 2,
            score_threshold: Some(0.1),
            metadata_filter: Some(
                [("lang".to_string(), Document::from("en"))].into_iter().collect(),
            ),
        };
        let hits = store.search("u1_kb", "python", &params).await.unwrap();
        assert!(hits.len() <= 2);
        assert!(hits.iter().all(|h| h.metadata["lang"] == Document::from("en")));
        assert!(hits.iter().all(|h| h.score >= 0.1));
    }

    #[tokio::test]
    async fn searching_missing_collection_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store
            .search("u1_absent", "q", &SearchParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::CollectionNotFound(_)));
    }

    #[tokio::test]
    async fn delete_then_create_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create_collection("u1_kb", &docs(&["one", "two"])).await.unwrap();
        store.delete_collection("u1_kb").await.unwrap();
        store.create_collection("u1_kb", &docs(&["fresh"])).await.unwrap();

        let hits = store
            .search("u1_kb", "one", &SearchParams { top_k: 10, ..Default::default() })
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.text != "one"));
    }
}
