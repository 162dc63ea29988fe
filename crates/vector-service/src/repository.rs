use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use common::types::VectorCollection;

use crate::error::CollectionError;

/// Persistence boundary for collection metadata. Uniqueness of
/// `(user_id, name)` is enforced here.
#[async_trait]
pub trait CollectionRepository: Send + Sync {
    async fn insert(&self, collection: &VectorCollection) -> Result<(), CollectionError>;

    async fn get(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<VectorCollection>, CollectionError>;

    async fn list(&self, user_id: Uuid) -> Result<Vec<VectorCollection>, CollectionError>;

    /// Adjust the stored document count by `delta`.
    async fn update_document_count(&self, id: Uuid, delta: i64) -> Result<(), CollectionError>;

    async fn delete(&self, id: Uuid) -> Result<(), CollectionError>;
}

/// Mutex-guarded row vector; backs tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryCollectionRepository {
    rows: Mutex<Vec<VectorCollection>>,
}

impl InMemoryCollectionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollectionRepository for InMemoryCollectionRepository {
    async fn insert(&self, collection: &VectorCollection) -> Result<(), CollectionError> {
        let mut rows = self.rows.lock().await;
        if rows
            .iter()
            .any(|r| r.user_id == collection.user_id && r.name == collection.name)
        {
            return Err(CollectionError::AlreadyExists(collection.name.clone()));
        }
        rows.push(collection.clone());
        Ok(())
    }

    async fn get(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<VectorCollection>, CollectionError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|r| r.user_id == user_id && r.name == name)
            .cloned())
    }

    async fn list(&self, user_id: Uuid) -> Result<Vec<VectorCollection>, CollectionError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|r| r.user_id == user_id).cloned().collect())
    }

    async fn update_document_count(&self, id: Uuid, delta: i64) -> Result<(), CollectionError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CollectionError::Repository(format!("no collection row {}", id)))?;
        row.document_count += delta;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), CollectionError> {
        let mut rows = self.rows.lock().await;
        rows.retain(|r| r.id != id);
        Ok(())
    }
}

/// sqlx-backed metadata rows in `vector_collections`; the unique
/// `(user_id, name)` constraint maps violation to `AlreadyExists`.
pub struct PostgresCollectionRepository {
    pool: PgPool,
}

impl PostgresCollectionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CollectionRepository for PostgresCollectionRepository {
    async fn insert(&self, collection: &VectorCollection) -> Result<(), CollectionError> {
        sqlx::query(
            r#"
            INSERT INTO vector_collections (
                id, user_id, name, dimension, index_path, document_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(collection.id)
        .bind(collection.user_id)
        .bind(&collection.name)
        .bind(collection.dimension as i32)
        .bind(&collection.index_path)
        .bind(collection.document_count)
        .bind(collection.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                CollectionError::AlreadyExists(collection.name.clone())
            } else {
                CollectionError::Repository(e.to_string())
            }
        })?;
        Ok(())
    }

    async fn get(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> Result<Option<VectorCollection>, CollectionError> {
        let row = sqlx::query_as::<_, CollectionRow>(
            r#"
            SELECT id, user_id, name, dimension, index_path, document_count, created_at
            FROM vector_collections
            WHERE user_id = $1 AND name = $2
            "#,
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CollectionError::Repository(e.to_string()))?;
        Ok(row.map(VectorCollection::from))
    }

    async fn list(&self, user_id: Uuid) -> Result<Vec<VectorCollection>, CollectionError> {
        let rows = sqlx::query_as::<_, CollectionRow>(
            r#"
            SELECT id, user_id, name, dimension, index_path, document_count, created_at
            FROM vector_collections
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CollectionError::Repository(e.to_string()))?;
        Ok(rows.into_iter().map(VectorCollection::from).collect())
    }

    async fn update_document_count(&self, id: Uuid, delta: i64) -> Result<(), CollectionError> {
        let result = sqlx::query(
            "UPDATE vector_collections SET document_count = document_count + $2 WHERE id = $1",
        )
        .bind(id)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(|e| CollectionError::Repository(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(CollectionError::Repository(format!("no collection row {}", id)));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), CollectionError> {
        sqlx::query("DELETE FROM vector_collections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CollectionError::Repository(e.to_string()))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CollectionRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    dimension: i32,
    index_path: String,
    document_count: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<CollectionRow> for VectorCollection {
    fn from(row: CollectionRow) -> Self {
        VectorCollection {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            dimension: row.dimension as usize,
            index_path: row.index_path,
            document_count: row.document_count,
            created_at: row.created_at,
        }
    }
}
