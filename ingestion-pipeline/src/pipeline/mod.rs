mod services;
mod state;

#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use state_machines::core::GuardError;
use tracing::{debug, info, instrument, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            deleted_document::DeletedDocument,
            document::{Document, DocumentDraft, DocumentStatus},
        },
    },
};
use connectors::SourceDocument;

use self::state::{ready, DocumentMachine, Indexed, Ready, Stored, Summarized};

/// Per-item result feeding the job summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOutcome {
    Succeeded,
    Skipped,
    Errored,
}

/// Drives one source item through store → summarize → index.
///
/// Stages are sequential within a document; the orchestrator owns fan-out
/// across documents and tenants.
pub struct DocumentPipeline<'a> {
    db: &'a SurrealDbClient,
    services: &'a dyn PipelineServices,
}

impl<'a> DocumentPipeline<'a> {
    pub fn new(db: &'a SurrealDbClient, services: &'a dyn PipelineServices) -> Self {
        Self { db, services }
    }

    #[instrument(skip_all, fields(tenant_id, doc_id = %item.doc_id()))]
    pub async fn process(
        &self,
        tenant_id: &str,
        item: SourceDocument,
    ) -> Result<DocOutcome, AppError> {
        // Tombstoned ids are ignored before any work happens.
        if DeletedDocument::exists(self.db, tenant_id, item.source, &item.external_id).await? {
            debug!("item is tombstoned; ignoring");
            return Ok(DocOutcome::Skipped);
        }

        let machine = ready();

        let (machine, document, created) = match self.store(machine, tenant_id, &item).await {
            Ok(stored) => stored,
            Err(err) => return self.fail(None, err).await,
        };

        // Unchanged content that is already indexed: nothing downstream runs.
        if !created && document.embedding_generated {
            debug!("content hash unchanged and already indexed; skipping");
            return Ok(DocOutcome::Skipped);
        }

        Document::set_status(self.db, &document.id, DocumentStatus::Processing).await?;

        let (machine, document) = match self.summarize(machine, &document).await {
            Ok(done) => done,
            Err(err) => return self.fail(Some(&document), err).await,
        };

        match self.index(machine, tenant_id, &document).await {
            Ok(_machine) => {
                Document::set_status(self.db, &document.id, DocumentStatus::Pending).await?;
                info!(doc_id = %document.id, "document processed");
                Ok(DocOutcome::Succeeded)
            }
            Err(err) => self.fail(Some(&document), err).await,
        }
    }

    /// Store stage: parse raw bytes when present, then upsert by external id.
    async fn store(
        &self,
        machine: DocumentMachine<(), Ready>,
        tenant_id: &str,
        item: &SourceDocument,
    ) -> Result<(DocumentMachine<(), Stored>, Document, bool), AppError> {
        let content = if let (Some(bytes), Some(filename)) = (&item.bytes, &item.filename) {
            self.services.retain_file(tenant_id, item).await?;
            match self.services.parse_bytes(bytes, filename).await {
                Ok(content) => content,
                Err(AppError::Permanent(message)) | Err(AppError::Parse(message)) => {
                    warn!(%message, "parser could not produce text; storing without content");
                    String::new()
                }
                Err(err) => return Err(err),
            }
        } else {
            item.content.clone()
        };

        let draft = DocumentDraft {
            tenant_id: tenant_id.to_string(),
            project_id: None,
            source_type: item.source,
            external_id: item.external_id.clone(),
            title: item.title.clone(),
            content,
            doc_type: item.doc_type.clone(),
            sender: item.author.clone(),
            source_created_at: item.timestamp,
            source_updated_at: None,
            metadata: item.metadata.clone(),
        };
        let (document, created) = Document::upsert(self.db, draft).await?;

        let machine = machine
            .store()
            .map_err(|(_, guard)| map_guard_error("store", &guard))?;
        Ok((machine, document, created))
    }

    /// Summarize stage: one extraction per `(document, content_hash)`. A
    /// document that cannot be summarized continues to indexing; the analyzer
    /// falls back to its raw text later.
    async fn summarize(
        &self,
        machine: DocumentMachine<(), Stored>,
        document: &Document,
    ) -> Result<(DocumentMachine<(), Summarized>, Document), AppError> {
        let mut updated = document.clone();

        if document.structured_summary.is_none() && !document.content.trim().is_empty() {
            if let Some(summary) = self.services.summarize(document).await? {
                Document::set_structured_summary(self.db, &document.id, summary.clone()).await?;
                updated.structured_summary = Some(summary);
            }
        }

        let machine = machine
            .summarize()
            .map_err(|(_, guard)| map_guard_error("summarize", &guard))?;
        Ok((machine, updated))
    }

    /// Index stage: chunk, embed, upsert; the embedded flag flips only after
    /// the index holds at least the first chunk.
    async fn index(
        &self,
        machine: DocumentMachine<(), Summarized>,
        tenant_id: &str,
        document: &Document,
    ) -> Result<DocumentMachine<(), Indexed>, AppError> {
        if document.content.trim().is_empty() {
            debug!(doc_id = %document.id, "no content to index");
            return machine
                .index()
                .map_err(|(_, guard)| map_guard_error("index", &guard));
        }

        let stats = self.services.embed_document(tenant_id, document).await?;
        if let Some(chunks) = stats.doc_chunk_counts.get(&document.doc_id()) {
            Document::mark_embedded(self.db, &document.id, *chunks).await?;
        }

        machine
            .index()
            .map_err(|(_, guard)| map_guard_error("index", &guard))
    }

    /// Per-item failure: record status so the next sync retries, keep the job
    /// alive. Only fatal errors propagate.
    async fn fail(
        &self,
        document: Option<&Document>,
        err: AppError,
    ) -> Result<DocOutcome, AppError> {
        if err.is_fatal() {
            return Err(err);
        }
        if let Some(document) = document {
            warn!(doc_id = %document.id, error = %err, "document processing failed");
            Document::set_status(self.db, &document.id, DocumentStatus::Pending).await?;
        } else {
            warn!(error = %err, "document processing failed before storage");
        }
        Ok(DocOutcome::Errored)
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid document pipeline transition during {event}: {guard:?}"
    ))
}

#[cfg(test)]
mod tests;
