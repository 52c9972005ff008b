use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            deleted_document::DeletedDocument,
            document::{Document, DocumentStatus, StructuredSummary},
            source_connector::SourceType,
        },
    },
};
use connectors::SourceDocument;
use vector_store::UpsertStats;

use super::{DocOutcome, DocumentPipeline, PipelineServices};

#[derive(Default)]
struct MockServices {
    calls: Mutex<Vec<String>>,
    fail_summarize: bool,
    fail_embed: bool,
}

impl MockServices {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.to_string());
        }
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    async fn parse_bytes(&self, bytes: &Bytes, filename: &str) -> Result<String, AppError> {
        self.record(&format!("parse:{filename}"));
        Ok(format!("parsed text from {} bytes", bytes.len()))
    }

    async fn summarize(
        &self,
        document: &Document,
    ) -> Result<Option<StructuredSummary>, AppError> {
        self.record(&format!("summarize:{}", document.external_id));
        if self.fail_summarize {
            return Err(AppError::Transient("llm unavailable".into()));
        }
        Ok(Some(StructuredSummary {
            summary: format!("summary of {}", document.title),
            word_count: 42,
            ..Default::default()
        }))
    }

    async fn embed_document(
        &self,
        _tenant_id: &str,
        document: &Document,
    ) -> Result<UpsertStats, AppError> {
        self.record(&format!("embed:{}", document.external_id));
        if self.fail_embed {
            return Err(AppError::Transient("vector index unavailable".into()));
        }
        let mut doc_chunk_counts = HashMap::new();
        doc_chunk_counts.insert(document.doc_id(), 2_u32);
        Ok(UpsertStats {
            docs_embedded: 1,
            chunks_created: 2,
            chunks_upserted: 2,
            doc_chunk_counts,
            ..Default::default()
        })
    }

    async fn retain_file(
        &self,
        _tenant_id: &str,
        source_document: &SourceDocument,
    ) -> Result<(), AppError> {
        self.record(&format!(
            "retain:{}",
            source_document.filename.as_deref().unwrap_or("?")
        ));
        Ok(())
    }
}

async fn test_db() -> SurrealDbClient {
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory("pipeline_ns", &database)
        .await
        .expect("in-memory surrealdb");
    db.ensure_initialized().await.expect("schema");
    db
}

fn text_item(external_id: &str, content: &str) -> SourceDocument {
    SourceDocument {
        external_id: external_id.to_string(),
        source: SourceType::EmailSource,
        title: format!("Message {external_id}"),
        content: content.to_string(),
        bytes: None,
        filename: None,
        doc_type: "email".to_string(),
        author: Some("Rosa".to_string()),
        timestamp: Some(Utc::now()),
        metadata: json!({}),
    }
}

#[tokio::test]
async fn new_document_runs_store_summarize_index_in_order() {
    let db = test_db().await;
    let services = MockServices::default();
    let pipeline = DocumentPipeline::new(&db, &services);

    let outcome = pipeline
        .process("t1", text_item("m1", "We decided to adopt trunk-based development."))
        .await
        .expect("process");
    assert_eq!(outcome, DocOutcome::Succeeded);
    assert_eq!(services.calls(), vec!["summarize:m1", "embed:m1"]);

    let stored = Document::find_by_external_id(&db, "t1", SourceType::EmailSource, "m1")
        .await
        .expect("find")
        .expect("document");
    assert!(stored.structured_summary.is_some());
    assert!(stored.embedding_generated);
    assert_eq!(stored.embedded_chunk_count, 2);
    assert_eq!(stored.status, DocumentStatus::Pending);
}

#[tokio::test]
async fn unchanged_resync_invokes_neither_extractor_nor_embedder() {
    let db = test_db().await;
    let services = MockServices::default();
    let pipeline = DocumentPipeline::new(&db, &services);

    let item = text_item("m2", "Stable content that does not change.");
    pipeline.process("t1", item.clone()).await.expect("first run");
    let calls_after_first = services.calls().len();

    let outcome = pipeline.process("t1", item).await.expect("second run");
    assert_eq!(outcome, DocOutcome::Skipped);
    assert_eq!(
        services.calls().len(),
        calls_after_first,
        "no extraction or embedding on an unchanged item"
    );

    let all: Vec<Document> = db.get_all_stored_items().await.expect("all");
    assert_eq!(all.len(), 1, "no duplicate rows");
}

#[tokio::test]
async fn changed_content_reprocesses_the_document() {
    let db = test_db().await;
    let services = MockServices::default();
    let pipeline = DocumentPipeline::new(&db, &services);

    pipeline
        .process("t1", text_item("m3", "version one"))
        .await
        .expect("first run");
    let outcome = pipeline
        .process("t1", text_item("m3", "version two, edited upstream"))
        .await
        .expect("second run");

    assert_eq!(outcome, DocOutcome::Succeeded);
    let embeds = services
        .calls()
        .iter()
        .filter(|c| c.starts_with("embed:"))
        .count();
    assert_eq!(embeds, 2, "changed hash re-embeds");
}

#[tokio::test]
async fn tombstoned_items_are_ignored_before_any_work() {
    let db = test_db().await;
    DeletedDocument::record(&db, "t1", SourceType::EmailSource, "gone")
        .await
        .expect("tombstone");

    let services = MockServices::default();
    let pipeline = DocumentPipeline::new(&db, &services);

    let outcome = pipeline
        .process("t1", text_item("gone", "resynced content"))
        .await
        .expect("process");
    assert_eq!(outcome, DocOutcome::Skipped);
    assert!(services.calls().is_empty());

    let stored = Document::find_by_external_id(&db, "t1", SourceType::EmailSource, "gone")
        .await
        .expect("find");
    assert!(stored.is_none(), "tombstoned item never becomes a row");
}

#[tokio::test]
async fn byte_payloads_are_retained_and_parsed_before_storage() {
    let db = test_db().await;
    let services = MockServices::default();
    let pipeline = DocumentPipeline::new(&db, &services);

    let item = SourceDocument {
        external_id: "f1".to_string(),
        source: SourceType::CloudFiles,
        title: "spec.pdf".to_string(),
        content: String::new(),
        bytes: Some(Bytes::from_static(b"%PDF fake bytes")),
        filename: Some("spec.pdf".to_string()),
        doc_type: "file".to_string(),
        author: None,
        timestamp: Some(Utc::now()),
        metadata: json!({"sha1": "abc"}),
    };

    let outcome = pipeline.process("t1", item).await.expect("process");
    assert_eq!(outcome, DocOutcome::Succeeded);
    assert_eq!(
        services.calls(),
        vec!["retain:spec.pdf", "parse:spec.pdf", "summarize:f1", "embed:f1"]
    );

    let stored = Document::find_by_external_id(&db, "t1", SourceType::CloudFiles, "f1")
        .await
        .expect("find")
        .expect("document");
    assert!(stored.content.starts_with("parsed text from"));
}

#[tokio::test]
async fn summarize_failure_marks_the_item_errored_and_retryable() {
    let db = test_db().await;
    let services = MockServices {
        fail_summarize: true,
        ..Default::default()
    };
    let pipeline = DocumentPipeline::new(&db, &services);

    let outcome = pipeline
        .process("t1", text_item("m4", "content the llm never saw"))
        .await
        .expect("per-item failure is not a job failure");
    assert_eq!(outcome, DocOutcome::Errored);

    let stored = Document::find_by_external_id(&db, "t1", SourceType::EmailSource, "m4")
        .await
        .expect("find")
        .expect("document");
    assert_eq!(stored.status, DocumentStatus::Pending);
    assert!(!stored.embedding_generated);

    // Retry path: same content, but not yet embedded, so the pipeline runs
    // again instead of skipping.
    let retry_services = MockServices::default();
    let retry = DocumentPipeline::new(&db, &retry_services);
    let outcome = retry
        .process("t1", text_item("m4", "content the llm never saw"))
        .await
        .expect("retry");
    assert_eq!(outcome, DocOutcome::Succeeded);
}

#[tokio::test]
async fn empty_content_stores_the_row_but_skips_summary_and_vectors() {
    let db = test_db().await;
    let services = MockServices::default();
    let pipeline = DocumentPipeline::new(&db, &services);

    let outcome = pipeline
        .process("t1", text_item("empty", "   "))
        .await
        .expect("process");
    assert_eq!(outcome, DocOutcome::Succeeded);
    assert!(services.calls().is_empty(), "no summarize, no embed");

    let stored = Document::find_by_external_id(&db, "t1", SourceType::EmailSource, "empty")
        .await
        .expect("find")
        .expect("document");
    assert!(!stored.embedding_generated);
    assert!(stored.structured_summary.is_none());
}

#[tokio::test]
async fn embed_failure_is_an_item_error_not_a_job_abort() {
    let db = test_db().await;
    let services = MockServices {
        fail_embed: true,
        ..Default::default()
    };
    let pipeline = DocumentPipeline::new(&db, &services);

    let outcome = pipeline
        .process("t1", text_item("m5", "content that fails to embed"))
        .await
        .expect("process");
    assert_eq!(outcome, DocOutcome::Errored);

    let stored = Document::find_by_external_id(&db, "t1", SourceType::EmailSource, "m5")
        .await
        .expect("find")
        .expect("document");
    // The summary survived; only the embedded flag is withheld.
    assert!(stored.structured_summary.is_some());
    assert!(!stored.embedding_generated);
}
