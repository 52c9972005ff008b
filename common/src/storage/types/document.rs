use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::hash::{content_hash, record_id},
};

use super::deleted_document::DeletedDocument;
use super::source_connector::SourceType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Classified,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentClassification {
    Work,
    Personal,
    Spam,
    Unknown,
}

/// Fixed-shape structured summary extracted once per `(document, content_hash)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StructuredSummary {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub entities: SummaryEntities,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub processes: Vec<String>,
    #[serde(default)]
    pub dates: Vec<SummaryDate>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub technical_details: Vec<String>,
    #[serde(default)]
    pub word_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryEntities {
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub systems: Vec<String>,
    #[serde(default)]
    pub organizations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryDate {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub event: String,
}

/// Connector-facing input for `Document::upsert`.
#[derive(Debug, Clone)]
pub struct DocumentDraft {
    pub tenant_id: String,
    pub project_id: Option<String>,
    pub source_type: SourceType,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub doc_type: String,
    pub sender: Option<String>,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Filter for `list_for_analysis`; mirrors what the gap analyzers accept.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFilter {
    pub project_id: Option<String>,
    pub include_pending: bool,
    pub max_documents: usize,
}

stored_object!(Document, "document", {
    tenant_id: String,
    project_id: Option<String>,
    source_type: SourceType,
    external_id: String,
    title: String,
    content: String,
    content_hash: String,
    doc_type: String,
    sender: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    source_created_at: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    source_updated_at: Option<DateTime<Utc>>,
    classification: DocumentClassification,
    classification_confidence: f32,
    classification_borderline: bool,
    status: DocumentStatus,
    user_confirmed: bool,
    structured_summary: Option<StructuredSummary>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    structured_summary_at: Option<DateTime<Utc>>,
    embedding_generated: bool,
    embedded_chunk_count: u32,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    embedded_at: Option<DateTime<Utc>>,
    is_deleted: bool,
    metadata: serde_json::Value
});

impl Document {
    /// Record id derived from the `(tenant, source, external_id)` key, which
    /// is what makes re-sync an upsert.
    pub fn record_key(tenant_id: &str, source_type: SourceType, external_id: &str) -> String {
        record_id(&[tenant_id, source_type.as_str(), external_id])
    }

    /// Wire id consumed by existing frontends.
    pub fn doc_id(&self) -> String {
        format!("{}_{}", self.source_type.as_str(), self.external_id)
    }

    /// Insert or update by `(tenant, source, external_id)`.
    ///
    /// Returns the stored row plus whether it was created. An unchanged
    /// content hash leaves the row untouched so downstream extraction and
    /// embedding are not re-triggered. A changed hash clears
    /// `embedding_generated` and the structured summary, sending the document
    /// back through the pipeline.
    pub async fn upsert(
        db: &SurrealDbClient,
        draft: DocumentDraft,
    ) -> Result<(Self, bool), AppError> {
        let id = Self::record_key(&draft.tenant_id, draft.source_type, &draft.external_id);
        let new_hash = content_hash(&draft.content);

        match db.get_item::<Self>(&id).await? {
            Some(existing) if existing.content_hash == new_hash => Ok((existing, false)),
            Some(mut existing) => {
                existing.title = draft.title;
                existing.content = draft.content;
                existing.content_hash = new_hash;
                existing.doc_type = draft.doc_type;
                existing.sender = draft.sender;
                existing.source_created_at = draft.source_created_at;
                existing.source_updated_at = draft.source_updated_at;
                existing.metadata = draft.metadata;
                existing.structured_summary = None;
                existing.structured_summary_at = None;
                existing.embedding_generated = false;
                existing.embedded_at = None;
                existing.updated_at = Utc::now();

                let updated = db
                    .update_item(existing)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("document {id} vanished mid-upsert")))?;
                Ok((updated, false))
            }
            None => {
                let now = Utc::now();
                let document = Self {
                    id,
                    created_at: now,
                    updated_at: now,
                    tenant_id: draft.tenant_id,
                    project_id: draft.project_id,
                    source_type: draft.source_type,
                    external_id: draft.external_id,
                    title: draft.title,
                    content_hash: new_hash,
                    content: draft.content,
                    doc_type: draft.doc_type,
                    sender: draft.sender,
                    source_created_at: draft.source_created_at,
                    source_updated_at: draft.source_updated_at,
                    classification: DocumentClassification::Unknown,
                    classification_confidence: 0.0,
                    classification_borderline: false,
                    status: DocumentStatus::Pending,
                    user_confirmed: false,
                    structured_summary: None,
                    structured_summary_at: None,
                    embedding_generated: false,
                    embedded_chunk_count: 0,
                    embedded_at: None,
                    is_deleted: false,
                    metadata: draft.metadata,
                };

                let stored = db
                    .store_item(document)
                    .await?
                    .ok_or_else(|| AppError::InternalError("document create returned nothing".into()))?;
                Ok((stored, true))
            }
        }
    }

    pub async fn find_by_external_id(
        db: &SurrealDbClient,
        tenant_id: &str,
        source_type: SourceType,
        external_id: &str,
    ) -> Result<Option<Self>, AppError> {
        Ok(db
            .get_item::<Self>(&Self::record_key(tenant_id, source_type, external_id))
            .await?)
    }

    /// Snapshot read of the documents a gap analyzer may look at.
    ///
    /// Work documents that are confirmed or classified always qualify;
    /// pending documents are included when the filter asks for them. Rejected
    /// and deleted documents never appear. Ordered most-recent-first so the
    /// token budget favors fresh material.
    pub async fn list_for_analysis(
        db: &SurrealDbClient,
        tenant_id: &str,
        filter: &AnalysisFilter,
    ) -> Result<Vec<Self>, AppError> {
        let mut sql = String::from(
            "SELECT * FROM type::table($table) \
             WHERE tenant_id = $tenant_id AND is_deleted = false AND (\
                (status = $confirmed AND classification = $work) OR \
                (status = $classified AND classification = $work)",
        );
        if filter.include_pending {
            sql.push_str(" OR status = $pending");
        }
        sql.push(')');
        if filter.project_id.is_some() {
            sql.push_str(" AND project_id = $project_id");
        }
        sql.push_str(" ORDER BY source_created_at DESC LIMIT $limit");

        let limit = if filter.max_documents == 0 {
            200
        } else {
            filter.max_documents
        };

        let mut query = db
            .client
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("confirmed", DocumentStatus::Confirmed))
            .bind(("classified", DocumentStatus::Classified))
            .bind(("pending", DocumentStatus::Pending))
            .bind(("work", DocumentClassification::Work))
            .bind(("limit", limit));
        if let Some(project_id) = filter.project_id.clone() {
            query = query.bind(("project_id", project_id));
        }

        Ok(query.await?.take(0)?)
    }

    /// Confirmed work documents, used by the full re-embed in `complete_process`.
    pub async fn confirmed_work(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE tenant_id = $tenant_id AND is_deleted = false \
                 AND status = $confirmed AND classification = $work",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("confirmed", DocumentStatus::Confirmed))
            .bind(("work", DocumentClassification::Work))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        id: &str,
        status: DocumentStatus,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing($table, $id) SET status = $status, updated_at = time::now()")
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("status", status))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn set_structured_summary(
        db: &SurrealDbClient,
        id: &str,
        summary: StructuredSummary,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET \
                 structured_summary = $summary, \
                 structured_summary_at = time::now(), \
                 updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("summary", summary))
            .await?
            .check()?;

        Ok(())
    }

    /// Flip the embedding flags once at least the first chunk is in the index.
    pub async fn mark_embedded(
        db: &SurrealDbClient,
        id: &str,
        chunk_count: u32,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET \
                 embedding_generated = true, \
                 embedded_chunk_count = $chunk_count, \
                 embedded_at = time::now(), \
                 updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("chunk_count", chunk_count))
            .await?
            .check()?;

        Ok(())
    }

    /// Soft-delete documents and write resync tombstones in the same pass.
    ///
    /// Vector cleanup is the caller's job; the invariant is that by the time
    /// this returns, a re-sync of any of these ids is ignored.
    pub async fn mark_deleted(
        db: &SurrealDbClient,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<Self>, AppError> {
        let mut deleted = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(document) = db.get_item::<Self>(id).await? else {
                continue;
            };
            if document.tenant_id != tenant_id {
                return Err(AppError::TenantIsolation(format!(
                    "document {id} does not belong to tenant {tenant_id}"
                )));
            }

            db.client
                .query("UPDATE type::thing($table, $id) SET is_deleted = true, updated_at = time::now()")
                .bind(("table", Self::table_name()))
                .bind(("id", id.clone()))
                .await?
                .check()?;

            DeletedDocument::record(db, tenant_id, document.source_type, &document.external_id)
                .await?;
            deleted.push(document);
        }

        Ok(deleted)
    }
}
