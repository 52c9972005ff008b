use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            document::Document,
            gap_answer::GapAnswer,
            knowledge_gap::{AnswerPayload, KnowledgeGap},
            source_connector::{ConnectorStatus, SourceConnector, SourceType, SyncSummary},
            sync_job::SyncJob,
            tenant::Tenant,
        },
    },
    utils::{
        llm::LlmClient,
        rate_limit::{plan_limits, Admission, RateLimiter},
    },
};
use connectors::{Connector, SyncLedger};
use gap_analysis::{AnalysisContext, AnalysisResult, Strategy};
use vector_store::{DocumentToEmbed, VectorService};

use crate::pipeline::{DocOutcome, DocumentPipeline, PipelineServices};

/// Event-driven coordinator: one instance per process, per-tenant FIFO via
/// the job queue, tenants in parallel, cancellation observed between
/// documents.
pub struct Orchestrator {
    db: Arc<SurrealDbClient>,
    services: Arc<dyn PipelineServices>,
    vector: Arc<VectorService>,
    llm: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Debug, Default, Serialize)]
pub struct CompletionSummary {
    pub documents_reembedded: usize,
    pub answers_integrated: usize,
    pub gaps_verified: usize,
}

impl Orchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        services: Arc<dyn PipelineServices>,
        vector: Arc<VectorService>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            db,
            services,
            vector,
            llm,
            limiter: Arc::new(RateLimiter::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    fn cancellation(&self, tenant_id: &str) -> CancellationToken {
        let mut tokens = match self.cancellations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens
            .entry(tenant_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Abort the tenant's in-flight work at its next suspension point and
    /// drop anything still queued for it.
    pub async fn cancel_tenant(&self, tenant_id: &str) -> Result<(), AppError> {
        {
            let mut tokens = match self.cancellations.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(token) = tokens.remove(tenant_id) {
                token.cancel();
            }
        }
        SyncJob::cancel_for_tenant(&self.db, tenant_id).await
    }

    fn admit(&self, tenant: &Tenant) -> Result<(), AppError> {
        let (limit, window) = plan_limits(&tenant.plan);
        match self.limiter.admit(&tenant.id, limit, window) {
            Admission::Granted => Ok(()),
            Admission::Rejected { retry_after_secs } => Err(AppError::Transient(format!(
                "tenant {} rate limited; retry in {retry_after_secs}s",
                tenant.slug
            ))),
        }
    }

    /// Periodic limiter hygiene; the worker loop calls this between claims.
    pub fn sweep_rate_limiter(&self) {
        self.limiter.sweep(3_600);
    }

    /// Pull everything new from one connector and run each document through
    /// the pipeline. Per-item failures become counters, not job failures.
    pub async fn sync(
        &self,
        tenant: &Tenant,
        connector: &dyn Connector,
    ) -> Result<SyncSummary, AppError> {
        self.admit(tenant)?;

        let source = connector.source();
        let connector_row_id = SourceConnector::record_key(&tenant.id, source);
        let row = SourceConnector::get(&self.db, &tenant.id, source).await?;
        let since = row.as_ref().and_then(|r| r.last_sync);

        SourceConnector::set_status(&self.db, &connector_row_id, ConnectorStatus::Syncing)
            .await
            .ok();

        let cancellation = self.cancellation(&tenant.id);
        let pipeline = DocumentPipeline::new(&self.db, self.services.as_ref());
        let mut summary = SyncSummary::default();
        let started = Utc::now();

        let mut stream = connector.sync(since);
        let result: Result<(), AppError> = loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    warn!(tenant_id = %tenant.id, "sync cancelled; partial progress is durable");
                    break Ok(());
                }
                item = stream.next() => {
                    let Some(item) = item else { break Ok(()) };
                    match item {
                        Ok(document) => {
                            summary.total = summary.total.saturating_add(1);
                            match pipeline.process(&tenant.id, document).await {
                                Ok(DocOutcome::Succeeded) => {
                                    summary.succeeded = summary.succeeded.saturating_add(1);
                                }
                                Ok(DocOutcome::Skipped) => {
                                    summary.skipped = summary.skipped.saturating_add(1);
                                }
                                Ok(DocOutcome::Errored) => {
                                    summary.errored = summary.errored.saturating_add(1);
                                }
                                Err(err) => break Err(err),
                            }
                        }
                        // A failing stream aborts the job; the cursor is not
                        // advanced, so the next run resumes from the same spot.
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                SourceConnector::mark_synced(&self.db, &connector_row_id, started, summary)
                    .await
                    .ok();
                info!(
                    tenant_id = %tenant.id,
                    source = %source,
                    total = summary.total,
                    succeeded = summary.succeeded,
                    skipped = summary.skipped,
                    errored = summary.errored,
                    "sync finished"
                );
                Ok(summary)
            }
            Err(err) => {
                SourceConnector::mark_error(&self.db, &connector_row_id, &err.to_string())
                    .await
                    .ok();
                Err(err)
            }
        }
    }

    /// Run a gap-analysis strategy over the tenant's read snapshot.
    pub async fn analyze(
        &self,
        tenant: &Tenant,
        strategy: Strategy,
        project_id: Option<String>,
        include_pending: bool,
        max_documents: usize,
    ) -> Result<AnalysisResult, AppError> {
        self.admit(tenant)?;

        let ctx = AnalysisContext {
            tenant_id: tenant.id.clone(),
            project_id,
            include_pending,
            max_documents,
        };
        gap_analysis::analyze(&self.db, Arc::clone(&self.llm), strategy, &ctx).await
    }

    /// Persist an answer, then fold it into the index as a synthetic document
    /// keyed `gap:<gap_id>` so it is immediately searchable.
    pub async fn submit_answer(
        &self,
        tenant_id: &str,
        gap_id: &str,
        question_index: usize,
        payload: AnswerPayload,
    ) -> Result<GapAnswer, AppError> {
        let answer =
            KnowledgeGap::record_answer(&self.db, gap_id, tenant_id, question_index, payload)
                .await?;

        self.embed_gap_answers(tenant_id, gap_id).await?;
        Ok(answer)
    }

    /// (Re)build the synthetic answer document for one gap. Deterministic
    /// vector ids make this an in-place upsert as answers accumulate.
    async fn embed_gap_answers(&self, tenant_id: &str, gap_id: &str) -> Result<(), AppError> {
        let answers = GapAnswer::list_for_gap(&self.db, gap_id, tenant_id).await?;
        if answers.is_empty() {
            return Ok(());
        }

        let gap: Option<KnowledgeGap> = self.db.get_item(gap_id).await?;
        let title = gap
            .map(|g| format!("Answers: {}", g.title))
            .unwrap_or_else(|| "Knowledge gap answers".to_string());

        let content = answers
            .iter()
            .map(GapAnswer::as_search_text)
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut metadata = HashMap::new();
        metadata.insert(
            "source_type".to_string(),
            serde_json::Value::String("gap_answer".to_string()),
        );
        metadata.insert(
            "gap_id".to_string(),
            serde_json::Value::String(gap_id.to_string()),
        );

        self.vector
            .embed_and_upsert(
                &[DocumentToEmbed {
                    doc_id: format!("gap:{gap_id}"),
                    title,
                    content,
                    sender: None,
                    metadata,
                }],
                tenant_id,
            )
            .await?;

        Ok(())
    }

    /// Finish the knowledge-transfer process: re-embed every confirmed work
    /// document and every answer, then mark answered gaps VERIFIED.
    pub async fn complete_process(&self, tenant: &Tenant) -> Result<CompletionSummary, AppError> {
        self.admit(tenant)?;
        info!(tenant_id = %tenant.id, "completing knowledge-transfer process");

        let mut summary = CompletionSummary::default();

        let documents = Document::confirmed_work(&self.db, &tenant.id).await?;
        for document in &documents {
            let stats = self.services.embed_document(&tenant.id, document).await?;
            if let Some(chunks) = stats.doc_chunk_counts.get(&document.doc_id()) {
                Document::mark_embedded(&self.db, &document.id, *chunks).await?;
            }
            summary.documents_reembedded = summary.documents_reembedded.saturating_add(1);
        }

        let answers = GapAnswer::list_for_tenant(&self.db, &tenant.id).await?;
        let mut answered_gaps: Vec<String> = answers.iter().map(|a| a.gap_id.clone()).collect();
        answered_gaps.sort_unstable();
        answered_gaps.dedup();
        for gap_id in &answered_gaps {
            self.embed_gap_answers(&tenant.id, gap_id).await?;
        }
        summary.answers_integrated = answers.len();

        summary.gaps_verified = KnowledgeGap::verify_answered(&self.db, &tenant.id).await?;

        info!(
            tenant_id = %tenant.id,
            documents = summary.documents_reembedded,
            answers = summary.answers_integrated,
            verified = summary.gaps_verified,
            "knowledge-transfer process complete"
        );
        Ok(summary)
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }
}

/// Store-backed hash ledger handed to connectors for incremental skips.
pub struct StoreLedger {
    db: Arc<SurrealDbClient>,
    tenant_id: String,
    source: SourceType,
}

impl StoreLedger {
    pub fn new(db: Arc<SurrealDbClient>, tenant_id: String, source: SourceType) -> Self {
        Self {
            db,
            tenant_id,
            source,
        }
    }
}

#[async_trait]
impl SyncLedger for StoreLedger {
    async fn known_hash(&self, external_id: &str) -> Option<String> {
        let document =
            Document::find_by_external_id(&self.db, &self.tenant_id, self.source, external_id)
                .await
                .ok()??;

        // Provider-native hash wins when the document carried one; our own
        // content hash otherwise.
        document
            .metadata
            .get("sha1")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or(Some(document.content_hash))
    }
}

#[cfg(test)]
mod tests;
