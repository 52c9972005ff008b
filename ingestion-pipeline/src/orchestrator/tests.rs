use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            deleted_document::DeletedDocument,
            document::{Document, DocumentClassification, DocumentStatus, StructuredSummary},
            gap_answer::GapAnswer,
            knowledge_gap::{AnswerPayload, GapCategory, GapQuestion, GapStatus, KnowledgeGap},
            source_connector::{ConnectorStatus, SourceConnector, SourceType},
            tenant::{Tenant, TenantPlan},
        },
    },
    utils::{embedding::Embedder, llm::LlmClient},
};
use connectors::{Connector, DocumentStream, SourceDocument};
use gap_analysis::Strategy;
use vector_store::{SurrealVectorIndex, UpsertStats, VectorService};

use crate::pipeline::PipelineServices;

use super::{Orchestrator, StoreLedger};

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

struct SilentLlm;

#[async_trait]
impl LlmClient for SilentLlm {
    async fn chat_json(
        &self,
        _system: &str,
        _user: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, AppError> {
        Err(AppError::Transient("no llm in this test".into()))
    }
}

/// Services that stub parsing/summaries but embed through the real vector
/// service, so search-side assertions exercise real isolation.
struct TestServices {
    vector: Arc<VectorService>,
}

#[async_trait]
impl PipelineServices for TestServices {
    async fn parse_bytes(&self, _bytes: &Bytes, filename: &str) -> Result<String, AppError> {
        Ok(format!("parsed {filename}"))
    }

    async fn summarize(
        &self,
        document: &Document,
    ) -> Result<Option<StructuredSummary>, AppError> {
        Ok(Some(StructuredSummary {
            summary: format!("summary of {}", document.title),
            ..Default::default()
        }))
    }

    async fn embed_document(
        &self,
        tenant_id: &str,
        document: &Document,
    ) -> Result<UpsertStats, AppError> {
        self.vector
            .embed_and_upsert(
                &[vector_store::DocumentToEmbed {
                    doc_id: document.doc_id(),
                    title: document.title.clone(),
                    content: document.content.clone(),
                    sender: document.sender.clone(),
                    metadata: HashMap::new(),
                }],
                tenant_id,
            )
            .await
    }

    async fn retain_file(
        &self,
        _tenant_id: &str,
        _source_document: &SourceDocument,
    ) -> Result<(), AppError> {
        Ok(())
    }
}

/// Connector yielding a fixed set of documents.
struct FixedConnector {
    items: Vec<SourceDocument>,
}

#[async_trait]
impl Connector for FixedConnector {
    fn source(&self) -> SourceType {
        SourceType::EmailSource
    }

    async fn connect(&mut self) -> Result<(), AppError> {
        Ok(())
    }

    async fn test(&self) -> bool {
        true
    }

    fn sync(&self, _since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
        Box::pin(try_stream! {
            for item in self.items.clone() {
                yield item;
            }
        })
    }

    async fn fetch(&self, _external_id: &str) -> Result<Option<SourceDocument>, AppError> {
        Ok(None)
    }

    async fn disconnect(&mut self) -> Result<(), AppError> {
        Ok(())
    }
}

fn item(external_id: &str, content: &str) -> SourceDocument {
    SourceDocument {
        external_id: external_id.to_string(),
        source: SourceType::EmailSource,
        title: format!("Mail {external_id}"),
        content: content.to_string(),
        bytes: None,
        filename: None,
        doc_type: "email".to_string(),
        author: Some("Rosa".to_string()),
        timestamp: Some(Utc::now()),
        metadata: json!({}),
    }
}

struct Harness {
    db: Arc<SurrealDbClient>,
    orchestrator: Orchestrator,
    vector: Arc<VectorService>,
}

async fn harness() -> Harness {
    let database = Uuid::new_v4().to_string();
    let db = Arc::new(
        SurrealDbClient::memory("orchestrator_ns", &database)
            .await
            .expect("in-memory surrealdb"),
    );
    db.ensure_initialized().await.expect("schema");

    let index = SurrealVectorIndex::new(Arc::clone(&db), 3);
    index.ensure_index().await.expect("hnsw index");
    let vector = Arc::new(VectorService::new(Arc::new(index), Arc::new(FlatEmbedder)));

    let services = Arc::new(TestServices {
        vector: Arc::clone(&vector),
    });
    let orchestrator = Orchestrator::new(
        Arc::clone(&db),
        services,
        Arc::clone(&vector),
        Arc::new(SilentLlm),
    );

    Harness {
        db,
        orchestrator,
        vector,
    }
}

async fn seeded_tenant(db: &SurrealDbClient, slug: &str, plan: TenantPlan) -> Tenant {
    let tenant = Tenant::new(slug.to_string(), plan, format!("./data/{slug}"));
    db.store_item(tenant.clone()).await.expect("store tenant");
    let connector = SourceConnector::new(
        tenant.id.clone(),
        SourceType::EmailSource,
        json!({}),
        json!({}),
    );
    db.store_item(connector).await.expect("store connector");
    tenant
}

#[tokio::test]
async fn sync_processes_documents_and_updates_the_connector_row() {
    let h = harness().await;
    let tenant = seeded_tenant(&h.db, "acme", TenantPlan::Professional).await;

    // One of the three items was deleted by the user earlier.
    DeletedDocument::record(&h.db, &tenant.id, SourceType::EmailSource, "m2")
        .await
        .expect("tombstone");

    let connector = FixedConnector {
        items: vec![
            item("m1", "We decided to freeze deploys on Fridays."),
            item("m2", "resynced deleted item"),
            item("m3", "The runbook for failover lives with Rosa."),
        ],
    };

    let summary = h.orchestrator.sync(&tenant, &connector).await.expect("sync");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errored, 0);

    let row = SourceConnector::get(&h.db, &tenant.id, SourceType::EmailSource)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.status, ConnectorStatus::Connected);
    assert!(row.last_sync.is_some());
    assert_eq!(row.last_summary, Some(summary));

    // Documents are persisted with summaries and embeddings.
    let stored = Document::find_by_external_id(&h.db, &tenant.id, SourceType::EmailSource, "m1")
        .await
        .expect("find")
        .expect("document");
    assert!(stored.structured_summary.is_some());
    assert!(stored.embedding_generated);

    // Resync with no changes: everything skips.
    let connector = FixedConnector {
        items: vec![
            item("m1", "We decided to freeze deploys on Fridays."),
            item("m3", "The runbook for failover lives with Rosa."),
        ],
    };
    let summary = h.orchestrator.sync(&tenant, &connector).await.expect("resync");
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.succeeded, 0);
}

#[tokio::test]
async fn submitted_answers_become_searchable_within_their_tenant_only() {
    let h = harness().await;
    let tenant = seeded_tenant(&h.db, "blue", TenantPlan::Professional).await;
    let other = seeded_tenant(&h.db, "green", TenantPlan::Professional).await;

    let gap = KnowledgeGap::new(
        tenant.id.clone(),
        None,
        "Failover procedure".to_string(),
        String::new(),
        GapCategory::Process,
        4,
        vec![GapQuestion::new("How does failover work?")],
        json!({}),
    );
    gap.record(&h.db).await.expect("record gap");

    let answer = h
        .orchestrator
        .submit_answer(
            &tenant.id,
            &gap.id,
            0,
            AnswerPayload {
                user_id: "u1".to_string(),
                answer_text: "Flip the metallurgy switch, then drain the east pool.".to_string(),
                is_voice: false,
                transcription_confidence: None,
            },
        )
        .await
        .expect("submit answer");
    assert_eq!(answer.question_index, 0);

    // Gap flipped to ANSWERED (single question).
    let stored: KnowledgeGap = h.db.get_item(&gap.id).await.expect("get").expect("gap");
    assert_eq!(stored.status, GapStatus::Answered);

    // The answer text is searchable inside the tenant...
    let hits = h
        .vector
        .search("metallurgy switch", &tenant.id, 5, None)
        .await
        .expect("search");
    assert!(!hits.is_empty());
    assert_eq!(hits[0].doc_id, format!("gap:{}", gap.id));
    assert!(hits[0].score > 0.0);

    // ...and invisible from any other tenant.
    let foreign = h
        .vector
        .search("metallurgy switch", &other.id, 5, None)
        .await
        .expect("search other tenant");
    assert!(foreign.is_empty());
}

#[tokio::test]
async fn complete_process_reembeds_and_verifies() {
    let h = harness().await;
    let tenant = seeded_tenant(&h.db, "done", TenantPlan::Enterprise).await;

    // One confirmed work document.
    let connector = FixedConnector {
        items: vec![item("m1", "Quarterly close checklist and owners.")],
    };
    h.orchestrator.sync(&tenant, &connector).await.expect("sync");
    let doc = Document::find_by_external_id(&h.db, &tenant.id, SourceType::EmailSource, "m1")
        .await
        .expect("find")
        .expect("doc");
    Document::set_status(&h.db, &doc.id, DocumentStatus::Confirmed)
        .await
        .expect("confirm");
    h.db.client
        .query("UPDATE type::thing('document', $id) SET classification = $work")
        .bind(("id", doc.id.clone()))
        .bind(("work", DocumentClassification::Work))
        .await
        .expect("classify")
        .check()
        .expect("classify check");

    // One answered gap.
    let gap = KnowledgeGap::new(
        tenant.id.clone(),
        None,
        "Close ownership".to_string(),
        String::new(),
        GapCategory::Process,
        3,
        vec![GapQuestion::new("Who owns the close?")],
        json!({}),
    );
    gap.record(&h.db).await.expect("record");
    h.orchestrator
        .submit_answer(
            &tenant.id,
            &gap.id,
            0,
            AnswerPayload {
                user_id: "u1".to_string(),
                answer_text: "Finance engineering owns it end to end.".to_string(),
                is_voice: true,
                transcription_confidence: Some(0.88),
            },
        )
        .await
        .expect("answer");

    let summary = h
        .orchestrator
        .complete_process(&tenant)
        .await
        .expect("complete");
    assert_eq!(summary.documents_reembedded, 1);
    assert_eq!(summary.answers_integrated, 1);
    assert_eq!(summary.gaps_verified, 1);

    let stored: KnowledgeGap = h.db.get_item(&gap.id).await.expect("get").expect("gap");
    assert_eq!(stored.status, GapStatus::Verified);
}

#[tokio::test]
async fn plan_rate_limit_rejects_after_the_window_fills() {
    let h = harness().await;
    let tenant = seeded_tenant(&h.db, "throttled", TenantPlan::Free).await;

    // FREE allows 30 admissions per window; empty-corpus analyses are cheap.
    for _ in 0..30 {
        h.orchestrator
            .analyze(&tenant, Strategy::Simple, None, true, 10)
            .await
            .expect("admitted analysis");
    }

    let rejected = h
        .orchestrator
        .analyze(&tenant, Strategy::Simple, None, true, 10)
        .await;
    match rejected {
        Err(AppError::Transient(message)) => assert!(message.contains("rate limited")),
        other => panic!("expected rate-limit rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_tenant_stops_before_processing_items() {
    let h = harness().await;
    let tenant = seeded_tenant(&h.db, "cancelled", TenantPlan::Professional).await;

    // Pre-cancel, then sync: the loop observes the token before any item.
    let token = h.orchestrator.cancellation(&tenant.id);
    token.cancel();

    let connector = FixedConnector {
        items: vec![item("m1", "never processed content")],
    };
    let summary = h.orchestrator.sync(&tenant, &connector).await.expect("sync");
    assert_eq!(summary.total, 0);

    let stored = Document::find_by_external_id(&h.db, &tenant.id, SourceType::EmailSource, "m1")
        .await
        .expect("find");
    assert!(stored.is_none());
}

#[tokio::test]
async fn store_ledger_prefers_provider_hash() {
    let h = harness().await;
    let tenant = seeded_tenant(&h.db, "hashes", TenantPlan::Professional).await;

    let mut with_provider_hash = item("f1", "cloud file body");
    with_provider_hash.source = SourceType::CloudFiles;
    with_provider_hash.metadata = json!({"sha1": "provider-sha"});

    let connector = FixedConnector {
        items: vec![with_provider_hash],
    };
    // CloudFiles connector row for this source.
    let row = SourceConnector::new(tenant.id.clone(), SourceType::CloudFiles, json!({}), json!({}));
    h.db.store_item(row).await.expect("store row");

    // Process through the pipeline so the document lands with its metadata.
    let pipeline_summary = {
        struct CloudConnector(FixedConnector);
        #[async_trait]
        impl Connector for CloudConnector {
            fn source(&self) -> SourceType {
                SourceType::CloudFiles
            }
            async fn connect(&mut self) -> Result<(), AppError> {
                Ok(())
            }
            async fn test(&self) -> bool {
                true
            }
            fn sync(&self, since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
                self.0.sync(since)
            }
            async fn fetch(&self, id: &str) -> Result<Option<SourceDocument>, AppError> {
                self.0.fetch(id).await
            }
            async fn disconnect(&mut self) -> Result<(), AppError> {
                Ok(())
            }
        }
        h.orchestrator
            .sync(&tenant, &CloudConnector(connector))
            .await
            .expect("sync")
    };
    assert_eq!(pipeline_summary.succeeded, 1);

    let ledger = StoreLedger::new(
        Arc::clone(&h.db),
        tenant.id.clone(),
        SourceType::CloudFiles,
    );
    use connectors::SyncLedger;
    assert_eq!(ledger.known_hash("f1").await.as_deref(), Some("provider-sha"));
    assert!(ledger.known_hash("missing").await.is_none());
}
