use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::hash::record_id,
};

/// Fixed metadata carried by every vector, plus caller-supplied scalars.
///
/// `tenant_id` is always present; queries always filter on it in addition to
/// the namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VectorMetadata {
    pub tenant_id: String,
    pub doc_id: String,
    pub chunk_idx: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content_preview: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub vector_id: String,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorMatch {
    pub vector_id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Default, Clone)]
pub struct IndexStats {
    pub total_vectors: u64,
    pub namespaces: HashMap<String, u64>,
}

/// Namespaced vector index capability.
///
/// Matches what hosted vector databases expose: deterministic-id upsert,
/// filtered KNN query, id/namespace deletion, and per-namespace counts.
/// Metadata values must be scalars under 500 chars; the service layer
/// enforces that before records get here.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<(), AppError>;

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<VectorMatch>, AppError>;

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), AppError>;

    async fn delete_namespace(&self, namespace: &str) -> Result<(), AppError>;

    async fn describe_stats(&self) -> Result<IndexStats, AppError>;
}

/// SurrealDB-backed implementation.
///
/// One row per vector in `embedding_chunk`; the namespace lives on the row
/// and the record id is derived from `(namespace, vector_id)` so the same
/// logical document in two tenants never collides.
pub struct SurrealVectorIndex {
    db: std::sync::Arc<SurrealDbClient>,
    dimensions: usize,
}

const TABLE: &str = "embedding_chunk";

#[derive(Serialize)]
struct StoredVector {
    namespace: String,
    vector_id: String,
    embedding: Vec<f32>,
    metadata: VectorMetadata,
}

impl SurrealVectorIndex {
    pub fn new(db: std::sync::Arc<SurrealDbClient>, dimensions: usize) -> Self {
        Self { db, dimensions }
    }

    /// Define the HNSW index for the configured dimension. Idempotent;
    /// overwrites when the dimension changes.
    pub async fn ensure_index(&self) -> Result<(), AppError> {
        self.db
            .client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_namespace ON TABLE {TABLE} FIELDS namespace;"
            ))
            .await?
            .check()?;
        self.db
            .client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_embedding_chunk ON TABLE {TABLE} \
                 FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;",
                dimension = self.dimensions
            ))
            .await?
            .check()?;

        Ok(())
    }

    fn record_key(namespace: &str, vector_id: &str) -> String {
        record_id(&[namespace, vector_id])
    }

    /// Filter keys are interpolated into the query; restrict them to plain
    /// identifiers.
    fn validate_filter_key(key: &str) -> Result<(), AppError> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AppError::Validation(format!(
                "invalid metadata filter key: {key:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SurrealVectorIndex {
    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>) -> Result<(), AppError> {
        for record in records {
            if record.embedding.len() != self.dimensions {
                return Err(AppError::Validation(format!(
                    "embedding for {} has dimension {}, index expects {}",
                    record.vector_id,
                    record.embedding.len(),
                    self.dimensions
                )));
            }

            let key = Self::record_key(namespace, &record.vector_id);
            let stored = StoredVector {
                namespace: namespace.to_string(),
                vector_id: record.vector_id,
                embedding: record.embedding,
                metadata: record.metadata,
            };

            self.db
                .client
                .query(format!(
                    "UPSERT type::thing('{TABLE}', $key) CONTENT $record;"
                ))
                .bind(("key", key))
                .bind(("record", stored))
                .await?
                .check()?;
        }

        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: &HashMap<String, serde_json::Value>,
    ) -> Result<Vec<VectorMatch>, AppError> {
        let mut conditions = String::new();
        for (i, key) in filter.keys().enumerate() {
            Self::validate_filter_key(key)?;
            conditions.push_str(&format!(" AND metadata.{key} = $filter_{i}"));
        }

        let sql = format!(
            "SELECT vector_id, metadata, \
             vector::similarity::cosine(embedding, $embedding) AS score \
             FROM {TABLE} \
             WHERE namespace = $namespace{conditions} \
               AND embedding <|{top_k},100|> $embedding \
             ORDER BY score DESC \
             LIMIT {top_k};"
        );

        let mut query = self
            .db
            .client
            .query(sql)
            .bind(("namespace", namespace.to_string()))
            .bind(("embedding", vector.to_vec()));
        for (i, value) in filter.values().enumerate() {
            query = query.bind((format!("filter_{i}"), value.clone()));
        }

        let mut response = query.await?;
        let matches: Vec<VectorMatch> = response.take(0)?;

        Ok(matches)
    }

    async fn delete_ids(&self, namespace: &str, ids: &[String]) -> Result<(), AppError> {
        for batch in ids.chunks(1000) {
            self.db
                .client
                .query(format!(
                    "DELETE FROM {TABLE} WHERE namespace = $namespace AND vector_id INSIDE $ids;"
                ))
                .bind(("namespace", namespace.to_string()))
                .bind(("ids", batch.to_vec()))
                .await?
                .check()?;
        }

        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), AppError> {
        self.db
            .client
            .query(format!("DELETE FROM {TABLE} WHERE namespace = $namespace;"))
            .bind(("namespace", namespace.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    async fn describe_stats(&self) -> Result<IndexStats, AppError> {
        #[derive(Deserialize)]
        struct Row {
            namespace: String,
            count: u64,
        }

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT namespace, count() AS count FROM {TABLE} GROUP BY namespace;"
            ))
            .await?;
        let rows: Vec<Row> = response.take(0)?;

        let mut stats = IndexStats::default();
        for row in rows {
            stats.total_vectors = stats.total_vectors.saturating_add(row.count);
            stats.namespaces.insert(row.namespace, row.count);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn test_index(dimensions: usize) -> SurrealVectorIndex {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("vector_ns", &database)
            .await
            .expect("in-memory surrealdb");
        let index = SurrealVectorIndex::new(Arc::new(db), dimensions);
        index.ensure_index().await.expect("hnsw index");
        index
    }

    fn record(vector_id: &str, tenant: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            vector_id: vector_id.to_string(),
            embedding,
            metadata: VectorMetadata {
                tenant_id: tenant.to_string(),
                doc_id: format!("doc-{vector_id}"),
                chunk_idx: 0,
                title: "title".to_string(),
                content_preview: "preview".to_string(),
                extra: HashMap::new(),
            },
        }
    }

    fn tenant_filter(tenant: &str) -> HashMap<String, serde_json::Value> {
        HashMap::from([(
            "tenant_id".to_string(),
            serde_json::Value::String(tenant.to_string()),
        )])
    }

    #[tokio::test]
    async fn upsert_is_deduplicating_by_vector_id() {
        let index = test_index(3).await;

        index
            .upsert("t1", vec![record("v1", "t1", vec![1.0, 0.0, 0.0])])
            .await
            .expect("first upsert");
        index
            .upsert("t1", vec![record("v1", "t1", vec![0.0, 1.0, 0.0])])
            .await
            .expect("second upsert");

        let stats = index.describe_stats().await.expect("stats");
        assert_eq!(stats.total_vectors, 1);
        assert_eq!(stats.namespaces.get("t1"), Some(&1));
    }

    #[tokio::test]
    async fn query_is_scoped_to_namespace_and_filter() {
        let index = test_index(3).await;

        index
            .upsert("t1", vec![record("v1", "t1", vec![1.0, 0.0, 0.0])])
            .await
            .expect("t1 upsert");
        index
            .upsert("t2", vec![record("v2", "t2", vec![1.0, 0.0, 0.0])])
            .await
            .expect("t2 upsert");

        let hits = index
            .query("t1", &[1.0, 0.0, 0.0], 10, &tenant_filter("t1"))
            .await
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vector_id, "v1");
        assert_eq!(hits[0].metadata.tenant_id, "t1");

        // Namespace and metadata disagreeing returns nothing.
        let cross = index
            .query("t1", &[1.0, 0.0, 0.0], 10, &tenant_filter("t2"))
            .await
            .expect("query");
        assert!(cross.is_empty());
    }

    #[tokio::test]
    async fn query_orders_by_similarity() {
        let index = test_index(3).await;

        index
            .upsert(
                "t1",
                vec![
                    record("close", "t1", vec![0.9, 0.1, 0.0]),
                    record("far", "t1", vec![0.0, 0.0, 1.0]),
                ],
            )
            .await
            .expect("upsert");

        let hits = index
            .query("t1", &[1.0, 0.0, 0.0], 2, &tenant_filter("t1"))
            .await
            .expect("query");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].vector_id, "close");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn delete_ids_and_namespace() {
        let index = test_index(3).await;

        index
            .upsert(
                "t1",
                vec![
                    record("a", "t1", vec![1.0, 0.0, 0.0]),
                    record("b", "t1", vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .expect("upsert");
        index
            .upsert("t2", vec![record("c", "t2", vec![1.0, 0.0, 0.0])])
            .await
            .expect("upsert t2");

        index
            .delete_ids("t1", &["a".to_string()])
            .await
            .expect("delete id");
        let stats = index.describe_stats().await.expect("stats");
        assert_eq!(stats.namespaces.get("t1"), Some(&1));

        index.delete_namespace("t1").await.expect("delete namespace");
        let stats = index.describe_stats().await.expect("stats");
        assert!(!stats.namespaces.contains_key("t1"));
        assert_eq!(stats.namespaces.get("t2"), Some(&1));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let index = test_index(3).await;
        let result = index
            .upsert("t1", vec![record("bad", "t1", vec![1.0, 0.0])])
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn hostile_filter_keys_are_rejected() {
        let index = test_index(3).await;
        let filter = HashMap::from([(
            "tenant_id = 'x' OR 1=1".to_string(),
            serde_json::Value::String("t1".to_string()),
        )]);
        let result = index.query("t1", &[1.0, 0.0, 0.0], 5, &filter).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
