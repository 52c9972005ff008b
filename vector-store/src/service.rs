use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, warn};

use common::{error::AppError, utils::embedding::Embedder, utils::hash::sha256_hex};

use crate::chunker::{chunk_document, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::index::{VectorIndex, VectorMetadata, VectorRecord};

/// Texts per embedding call.
const EMBED_BATCH_SIZE: usize = 50;
/// Vectors per upsert call.
const UPSERT_BATCH_SIZE: usize = 500;
/// In-flight upsert batches.
const MAX_PARALLEL_UPSERTS: usize = 3;
/// Single-input cap for the embedding provider (~8K tokens).
const MAX_EMBEDDING_CHARS: usize = 30_000;
/// Caps applied to vector metadata fields.
const MAX_TITLE_CHARS: usize = 200;
const MAX_PREVIEW_CHARS: usize = 500;
const MAX_SCALAR_CHARS: usize = 500;
/// Deletion always covers at least this many chunk slots per document.
const DELETE_CHUNK_FLOOR: u32 = 100;

/// Document handed to `embed_and_upsert`.
#[derive(Debug, Clone)]
pub struct DocumentToEmbed {
    pub doc_id: String,
    pub title: String,
    pub content: String,
    pub sender: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct UpsertStats {
    pub docs_embedded: usize,
    pub chunks_created: usize,
    pub chunks_upserted: usize,
    pub elapsed: Duration,
    pub chunks_per_sec: f64,
    /// Chunk count per doc_id, recorded on the document row so deletion can
    /// derive the exact vector-id range later.
    pub doc_chunk_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub vector_id: String,
    pub score: f32,
    pub doc_id: String,
    pub chunk_idx: u32,
    pub title: String,
    pub content_preview: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Tenant-isolated embed/search facade over the vector index.
///
/// Isolation is enforced three times on every call: the namespace equals the
/// tenant id, the metadata filter repeats the tenant id, and the application
/// gate rejects empty tenants before any network traffic.
pub struct VectorService {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl VectorService {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index,
            embedder,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Deterministic vector id: a pure function of `(doc_id, chunk_idx)`, so
    /// reruns upsert in place instead of duplicating.
    pub fn vector_id(doc_id: &str, chunk_idx: u32) -> String {
        sha256_hex(format!("{doc_id}_{chunk_idx}").as_bytes())
    }

    /// The application gate: refuse before any I/O happens.
    fn gate(tenant_id: &str) -> Result<(), AppError> {
        if tenant_id.trim().is_empty() {
            return Err(AppError::TenantIsolation(
                "tenant_id is required for vector operations".into(),
            ));
        }
        Ok(())
    }

    fn tenant_filter(
        tenant_id: &str,
        extra: Option<&HashMap<String, serde_json::Value>>,
    ) -> HashMap<String, serde_json::Value> {
        let mut filter = HashMap::new();
        filter.insert(
            "tenant_id".to_string(),
            serde_json::Value::String(tenant_id.to_string()),
        );
        if let Some(extra) = extra {
            for (key, value) in extra {
                filter.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        filter
    }

    /// Chunk, embed, and upsert documents into the tenant's namespace.
    pub async fn embed_and_upsert(
        &self,
        documents: &[DocumentToEmbed],
        tenant_id: &str,
    ) -> Result<UpsertStats, AppError> {
        Self::gate(tenant_id)?;
        let started = Instant::now();

        // Chunk everything up front.
        struct PendingChunk {
            doc_id: String,
            chunk_idx: u32,
            text: String,
            title: String,
            metadata: HashMap<String, serde_json::Value>,
        }

        let mut pending: Vec<PendingChunk> = Vec::new();
        let mut doc_chunk_counts: HashMap<String, u32> = HashMap::new();
        for doc in documents {
            if doc.content.trim().is_empty() {
                continue;
            }
            let chunks = chunk_document(
                &doc.title,
                doc.sender.as_deref(),
                &doc.content,
                self.chunk_size,
                self.chunk_overlap,
            );
            let count = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
            if count > 0 {
                doc_chunk_counts.insert(doc.doc_id.clone(), count);
            }
            for (text, chunk_idx) in chunks {
                pending.push(PendingChunk {
                    doc_id: doc.doc_id.clone(),
                    chunk_idx,
                    text,
                    title: doc.title.clone(),
                    metadata: doc.metadata.clone(),
                });
            }
        }

        let chunks_created = pending.len();
        info!(
            tenant_id,
            documents = documents.len(),
            chunks = chunks_created,
            "embedding chunks for upsert"
        );

        // Embed sequentially in provider-sized batches.
        let mut records: Vec<VectorRecord> = Vec::with_capacity(chunks_created);
        for batch in pending.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch
                .iter()
                .map(|c| truncate_for_embedding(&c.text))
                .collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;

            for (chunk, embedding) in batch.iter().zip(embeddings) {
                let mut extra = HashMap::new();
                for (key, value) in &chunk.metadata {
                    if is_small_scalar(value) {
                        extra.insert(key.clone(), value.clone());
                    }
                }

                records.push(VectorRecord {
                    vector_id: Self::vector_id(&chunk.doc_id, chunk.chunk_idx),
                    embedding,
                    metadata: VectorMetadata {
                        tenant_id: tenant_id.to_string(),
                        doc_id: chunk.doc_id.clone(),
                        chunk_idx: chunk.chunk_idx,
                        title: truncate_chars(&chunk.title, MAX_TITLE_CHARS),
                        content_preview: truncate_chars(&chunk.text, MAX_PREVIEW_CHARS),
                        extra,
                    },
                });
            }
        }

        // Upsert with bounded parallelism and per-batch backoff.
        let batches: Vec<Vec<VectorRecord>> = records
            .chunks(UPSERT_BATCH_SIZE)
            .map(<[VectorRecord]>::to_vec)
            .collect();

        let upserted_counts: Vec<Result<usize, AppError>> = stream::iter(batches)
            .map(|batch| {
                let index = Arc::clone(&self.index);
                let namespace = tenant_id.to_string();
                async move {
                    let size = batch.len();
                    let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
                    Retry::spawn(strategy, || {
                        let index = Arc::clone(&index);
                        let namespace = namespace.clone();
                        let batch = batch.clone();
                        async move { index.upsert(&namespace, batch).await }
                    })
                    .await?;
                    Ok(size)
                }
            })
            .buffer_unordered(MAX_PARALLEL_UPSERTS)
            .collect()
            .await;

        let mut chunks_upserted = 0_usize;
        for result in upserted_counts {
            chunks_upserted = chunks_upserted.saturating_add(result?);
        }

        let elapsed = started.elapsed();
        let chunks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            chunks_upserted as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let stats = UpsertStats {
            docs_embedded: doc_chunk_counts.len(),
            chunks_created,
            chunks_upserted,
            elapsed,
            chunks_per_sec,
            doc_chunk_counts,
        };
        info!(
            tenant_id,
            docs = stats.docs_embedded,
            chunks = stats.chunks_upserted,
            elapsed_ms = elapsed.as_millis() as u64,
            "vector upsert complete"
        );

        Ok(stats)
    }

    /// Dense search within the tenant's namespace.
    pub async fn search(
        &self,
        query: &str,
        tenant_id: &str,
        top_k: usize,
        filter: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<Vec<SearchResult>, AppError> {
        Self::gate(tenant_id)?;

        let query_text = truncate_for_embedding(query);
        let embedding = self.embedder.embed(&query_text).await?;
        let combined_filter = Self::tenant_filter(tenant_id, filter);

        let matches = self
            .index
            .query(tenant_id, &embedding, top_k, &combined_filter)
            .await?;

        Ok(matches
            .into_iter()
            .map(|m| SearchResult {
                vector_id: m.vector_id,
                score: m.score,
                doc_id: m.metadata.doc_id,
                chunk_idx: m.metadata.chunk_idx,
                title: m.metadata.title,
                content_preview: m.metadata.content_preview,
                metadata: m.metadata.extra,
            })
            .collect())
    }

    /// Dense retrieval with keyword-overlap boosting.
    ///
    /// Fetches twice the requested depth, boosts matches whose title or
    /// preview contain query terms (title matches weigh more), then re-sorts
    /// on the blended score.
    pub async fn hybrid_search(
        &self,
        query: &str,
        tenant_id: &str,
        top_k: usize,
        dense_weight: f32,
        sparse_weight: f32,
    ) -> Result<Vec<SearchResult>, AppError> {
        let mut results = self
            .search(query, tenant_id, top_k.saturating_mul(2), None)
            .await?;

        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        for result in &mut results {
            let content = result.content_preview.to_lowercase();
            let title = result.title.to_lowercase();

            let content_matches = terms.iter().filter(|t| content.contains(t.as_str())).count();
            let title_matches = terms.iter().filter(|t| title.contains(t.as_str())).count();

            let boost =
                (content_matches as f32 * 0.05 + title_matches as f32 * 0.15).min(0.3);
            result.score = dense_weight * result.score + sparse_weight * boost;
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);

        Ok(results)
    }

    /// Remove every chunk vector belonging to the given documents.
    ///
    /// The id range is derived from the recorded chunk count, floored at the
    /// historical policy bound so older rows without a count still clean up.
    pub async fn delete_documents(
        &self,
        docs: &[(String, u32)],
        tenant_id: &str,
    ) -> Result<(), AppError> {
        Self::gate(tenant_id)?;

        let mut vector_ids = Vec::new();
        for (doc_id, chunk_count) in docs {
            let bound = (*chunk_count).max(DELETE_CHUNK_FLOOR);
            for chunk_idx in 0..bound {
                vector_ids.push(Self::vector_id(doc_id, chunk_idx));
            }
        }

        debug!(
            tenant_id,
            documents = docs.len(),
            vector_ids = vector_ids.len(),
            "deleting document vectors"
        );
        self.index.delete_ids(tenant_id, &vector_ids).await
    }

    /// Namespace-level purge; used by destructive tenant removal only.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<(), AppError> {
        Self::gate(tenant_id)?;
        self.index.delete_namespace(tenant_id).await
    }
}

/// Safety cap for a single embedding input; logs when it fires.
fn truncate_for_embedding(text: &str) -> String {
    if text.chars().count() <= MAX_EMBEDDING_CHARS {
        return text.to_string();
    }
    warn!(
        original_chars = text.chars().count(),
        cap = MAX_EMBEDDING_CHARS,
        "text truncated for embedding"
    );
    text.chars().take(MAX_EMBEDDING_CHARS).collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Only scalar metadata under the size cap is forwarded to the index.
fn is_small_scalar(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => s.chars().count() < MAX_SCALAR_CHARS,
        serde_json::Value::Number(_) | serde_json::Value::Bool(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SurrealVectorIndex;
    use async_trait::async_trait;
    use common::storage::db::SurrealDbClient;
    use serde_json::json;
    use uuid::Uuid;

    /// Embedder that maps every text to the same unit vector, so dense scores
    /// tie and keyword boosting decides the order.
    struct FlatEmbedder;

    #[async_trait]
    impl Embedder for FlatEmbedder {
        async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(inputs.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }

        fn dimensions(&self) -> u32 {
            3
        }
    }

    async fn test_service() -> VectorService {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("service_ns", &database)
            .await
            .expect("in-memory surrealdb");
        let index = SurrealVectorIndex::new(Arc::new(db), 3);
        index.ensure_index().await.expect("hnsw index");
        VectorService::new(Arc::new(index), Arc::new(FlatEmbedder))
    }

    fn doc(doc_id: &str, title: &str, content: &str) -> DocumentToEmbed {
        DocumentToEmbed {
            doc_id: doc_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            sender: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn vector_id_is_a_pure_function_of_doc_and_chunk() {
        let a = VectorService::vector_id("cloud-files_f1", 0);
        let b = VectorService::vector_id("cloud-files_f1", 0);
        let c = VectorService::vector_id("cloud-files_f1", 1);
        let d = VectorService::vector_id("cloud-files_f2", 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn embedding_truncation_caps_long_text() {
        let long = "y".repeat(MAX_EMBEDDING_CHARS + 5);
        let truncated = truncate_for_embedding(&long);
        assert_eq!(truncated.chars().count(), MAX_EMBEDDING_CHARS);

        let short = "fine as is";
        assert_eq!(truncate_for_embedding(short), short);
    }

    #[test]
    fn metadata_scalars_are_filtered_by_shape_and_size() {
        assert!(is_small_scalar(&json!("ok")));
        assert!(is_small_scalar(&json!(42)));
        assert!(is_small_scalar(&json!(true)));
        assert!(!is_small_scalar(&json!({"nested": 1})));
        assert!(!is_small_scalar(&json!(["list"])));
        assert!(!is_small_scalar(&json!("g".repeat(600))));
    }

    #[tokio::test]
    async fn empty_tenant_is_refused_before_any_io() {
        let service = test_service().await;
        let result = service.embed_and_upsert(&[doc("d", "t", "content")], "").await;
        assert!(matches!(result, Err(AppError::TenantIsolation(_))));

        let result = service.search("query", "  ", 5, None).await;
        assert!(matches!(result, Err(AppError::TenantIsolation(_))));
    }

    #[tokio::test]
    async fn rerun_upserts_in_place_without_duplicates() {
        let service = test_service().await;
        let docs = vec![doc("doc-1", "Notes", "Some meeting notes worth indexing.")];

        let first = service.embed_and_upsert(&docs, "t1").await.expect("first run");
        assert_eq!(first.docs_embedded, 1);
        assert_eq!(first.chunks_created, 1);
        assert_eq!(first.chunks_upserted, 1);
        assert_eq!(first.doc_chunk_counts.get("doc-1"), Some(&1));

        let second = service.embed_and_upsert(&docs, "t1").await.expect("second run");
        assert_eq!(second.chunks_upserted, 1);

        let stats = service.index.describe_stats().await.expect("stats");
        assert_eq!(stats.namespaces.get("t1"), Some(&1), "no duplicates after rerun");
    }

    #[tokio::test]
    async fn empty_content_produces_no_vectors() {
        let service = test_service().await;
        let stats = service
            .embed_and_upsert(&[doc("empty", "Empty", "   ")], "t1")
            .await
            .expect("upsert");
        assert_eq!(stats.docs_embedded, 0);
        assert_eq!(stats.chunks_created, 0);

        let index_stats = service.index.describe_stats().await.expect("stats");
        assert!(index_stats.namespaces.get("t1").is_none());
    }

    #[tokio::test]
    async fn search_returns_only_own_tenant_vectors() {
        let service = test_service().await;

        service
            .embed_and_upsert(&[doc("doc-a", "Alpha", "tenant one content")], "t1")
            .await
            .expect("t1 upsert");
        service
            .embed_and_upsert(&[doc("doc-b", "Beta", "tenant two content")], "t2")
            .await
            .expect("t2 upsert");

        let hits = service.search("content", "t1", 10, None).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "doc-a");
        assert!(hits[0].score > 0.0);

        let hits = service.search("content", "t2", 10, None).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "doc-b");
    }

    #[tokio::test]
    async fn hybrid_ranks_title_match_above_body_match_on_equal_dense_scores() {
        let service = test_service().await;

        // Doc X carries the term in the title only, Doc Y in the body only.
        service
            .embed_and_upsert(
                &[
                    doc("doc-x", "Kubernetes runbook", "cluster operations guide"),
                    doc("doc-y", "Operations guide", "kubernetes deployment steps"),
                ],
                "t1",
            )
            .await
            .expect("upsert");

        let hits = service
            .hybrid_search("kubernetes", "t1", 2, 0.7, 0.3)
            .await
            .expect("hybrid search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "doc-x", "title boost outweighs body boost");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn deleted_documents_never_come_back_in_search() {
        let service = test_service().await;

        service
            .embed_and_upsert(
                &[
                    doc("keep", "Keep", "this stays in the index"),
                    doc("drop", "Drop", "this gets removed"),
                ],
                "t1",
            )
            .await
            .expect("upsert");

        service
            .delete_documents(&[("drop".to_string(), 1)], "t1")
            .await
            .expect("delete");

        let hits = service.search("index", "t1", 10, None).await.expect("search");
        assert!(hits.iter().all(|h| h.doc_id != "drop"));
        assert!(hits.iter().any(|h| h.doc_id == "keep"));
    }

    #[tokio::test]
    async fn delete_tenant_purges_the_namespace() {
        let service = test_service().await;

        service
            .embed_and_upsert(&[doc("doc", "Doc", "content to purge")], "t1")
            .await
            .expect("upsert");
        service.delete_tenant("t1").await.expect("purge");

        let stats = service.index.describe_stats().await.expect("stats");
        assert!(!stats.namespaces.contains_key("t1"));
    }
}
