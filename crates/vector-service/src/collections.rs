use std::sync::Arc;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use common::types::{SearchHit, VectorCollection, VectorDocument};

use crate::error::CollectionError;
use crate::repository::CollectionRepository;
use crate::store::{SearchParams, VectorStore};

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern"))
}

/// User-scoped collections layered over the vector store. Every operation
/// takes `(user_id, logical_name)`; the store only ever sees the physical
/// key `{user_id}_{logical_name}`, which is what isolates users sharing a
/// store instance.
pub struct CollectionService {
    repo: Arc<dyn CollectionRepository>,
    store: Arc<dyn VectorStore>,
    dimension: usize,
}

impl CollectionService {
    pub fn new(
        repo: Arc<dyn CollectionRepository>,
        store: Arc<dyn VectorStore>,
        dimension: usize,
    ) -> Self {
        Self { repo, store, dimension }
    }

    fn physical_key(user_id: Uuid, name: &str) -> String {
        format!("{}_{}", user_id, name)
    }

    fn check_name(name: &str) -> Result<(), CollectionError> {
        if name_pattern().is_match(name) {
            Ok(())
        } else {
            Err(CollectionError::InvalidName(name.to_string()))
        }
    }

    fn check_documents(docs: &[VectorDocument]) -> Result<(), CollectionError> {
        if docs.is_empty() {
            return Err(CollectionError::InvalidDocuments(
                "at least one document is required".into(),
            ));
        }
        if docs.iter().any(|d| d.text.trim().is_empty()) {
            return Err(CollectionError::InvalidDocuments(
                "document text must be non-empty".into(),
            ));
        }
        Ok(())
    }

    pub async fn create_collection(
        &self,
        user_id: Uuid,
        name: &str,
        docs: &[VectorDocument],
    ) -> Result<VectorCollection, CollectionError> {
        Self::check_name(name)?;
        Self::check_documents(docs)?;

        if self.repo.get(user_id, name).await?.is_some() {
            return Err(CollectionError::AlreadyExists(name.to_string()));
        }

        let key = Self::physical_key(user_id, name);
        self.store
            .create_collection(&key, docs)
            .await
            .map_err(|e| CollectionError::IndexBuildFailed(e.to_string()))?;

        let collection = VectorCollection {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            dimension: self.dimension,
            index_path: self.store.index_path(&key).display().to_string(),
            document_count: docs.len() as i64,
            created_at: Utc::now(),
        };

        if let Err(e) = self.repo.insert(&collection).await {
            // Metadata insert lost a race or failed outright; drop the index
            // we just built so no orphan file remains.
            if let Err(cleanup) = self.store.delete_collection(&key).await {
                tracing::error!(key = %key, error = %cleanup, "orphan index left behind after failed create");
            }
            return Err(e);
        }

        tracing::info!(user_id = %user_id, name, docs = docs.len(), "collection created");
        Ok(collection)
    }

    pub async fn add_documents(
        &self,
        user_id: Uuid,
        name: &str,
        docs: &[VectorDocument],
    ) -> Result<i64, CollectionError> {
        Self::check_documents(docs)?;
        let collection = self
            .repo
            .get(user_id, name)
            .await?
            .ok_or_else(|| CollectionError::NotFound(name.to_string()))?;

        let key = Self::physical_key(user_id, name);
        self.store.add_documents(&key, docs).await?;
        self.repo
            .update_document_count(collection.id, docs.len() as i64)
            .await?;

        Ok(collection.document_count + docs.len() as i64)
    }

    pub async fn search(
        &self,
        user_id: Uuid,
        name: &str,
        query: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, CollectionError> {
        self.repo
            .get(user_id, name)
            .await?
            .ok_or_else(|| CollectionError::NotFound(name.to_string()))?;

        let key = Self::physical_key(user_id, name);
        self.store
            .search(&key, query, params)
            .await
            .map_err(|e| CollectionError::SearchFailed(e.to_string()))
    }

    /// Removes the metadata row and the physical index. If exactly one of
    /// the two removals fails the other has already happened, so the error
    /// names what survives and where.
    pub async fn delete_collection(&self, user_id: Uuid, name: &str) -> Result<(), CollectionError> {
        let collection = self
            .repo
            .get(user_id, name)
            .await?
            .ok_or_else(|| CollectionError::NotFound(name.to_string()))?;

        let key = Self::physical_key(user_id, name);
        let store_result = self.store.delete_collection(&key).await;
        let repo_result = self.repo.delete(collection.id).await;

        match (store_result, repo_result) {
            (Ok(()), Ok(())) => {
                tracing::info!(user_id = %user_id, name, "collection deleted");
                Ok(())
            }
            (Err(store_err), Ok(())) => {
                tracing::error!(
                    user_id = %user_id,
                    name,
                    index_path = %collection.index_path,
                    error = %store_err,
                    "metadata removed but index file remains"
                );
                Err(CollectionError::DeletePartial(format!(
                    "index file '{}' not removed: {}",
                    collection.index_path, store_err
                )))
            }
            (Ok(()), Err(repo_err)) => {
                tracing::error!(
                    user_id = %user_id,
                    name,
                    collection_id = %collection.id,
                    error = %repo_err,
                    "index removed but metadata row remains"
                );
                Err(CollectionError::DeletePartial(format!(
                    "metadata row {} not removed: {}",
                    collection.id, repo_err
                )))
            }
            (Err(store_err), Err(_)) => Err(CollectionError::Store(store_err)),
        }
    }

    pub async fn get_collection(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<VectorCollection, CollectionError> {
        self.repo
            .get(user_id, name)
            .await?
            .ok_or_else(|| CollectionError::NotFound(name.to_string()))
    }

    pub async fn list_collections(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<VectorCollection>, CollectionError> {
        self.repo.list(user_id).await
    }
}
