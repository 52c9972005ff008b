use crate::{error::AppError, storage::db::SurrealDbClient};

/// Index definitions for the relational tables.
///
/// The vector table carries its own HNSW definition in the vector-store crate
/// because the dimension comes from runtime configuration.
const INDEX_DEFINITIONS: &[&str] = &[
    "DEFINE INDEX IF NOT EXISTS unique_tenant_slug ON TABLE tenant FIELDS slug UNIQUE",
    "DEFINE INDEX IF NOT EXISTS unique_user_email ON TABLE user FIELDS tenant_id, email UNIQUE",
    "DEFINE INDEX IF NOT EXISTS unique_connector_source ON TABLE source_connector FIELDS tenant_id, source_type UNIQUE",
    "DEFINE INDEX IF NOT EXISTS unique_document_external ON TABLE document FIELDS tenant_id, source_type, external_id UNIQUE",
    "DEFINE INDEX IF NOT EXISTS idx_document_sender ON TABLE document FIELDS tenant_id, sender",
    "DEFINE INDEX IF NOT EXISTS idx_document_embedded ON TABLE document FIELDS tenant_id, embedded_at",
    "DEFINE INDEX IF NOT EXISTS idx_document_created ON TABLE document FIELDS tenant_id, created_at",
    "DEFINE INDEX IF NOT EXISTS idx_document_confidence ON TABLE document FIELDS classification_confidence",
    "DEFINE INDEX IF NOT EXISTS unique_tombstone ON TABLE deleted_document FIELDS tenant_id, source_type, external_id UNIQUE",
    "DEFINE INDEX IF NOT EXISTS idx_gap_tenant ON TABLE knowledge_gap FIELDS tenant_id",
    "DEFINE INDEX IF NOT EXISTS idx_gap_status ON TABLE knowledge_gap FIELDS tenant_id, status",
    "DEFINE INDEX IF NOT EXISTS idx_answer_gap ON TABLE gap_answer FIELDS gap_id",
    "DEFINE INDEX IF NOT EXISTS idx_answer_tenant ON TABLE gap_answer FIELDS tenant_id",
    "DEFINE INDEX IF NOT EXISTS idx_job_status ON TABLE sync_job FIELDS status",
    "DEFINE INDEX IF NOT EXISTS idx_job_tenant ON TABLE sync_job FIELDS tenant_id",
    "DEFINE INDEX IF NOT EXISTS idx_job_created ON TABLE sync_job FIELDS created_at",
];

/// Apply every index definition. Safe to call repeatedly.
pub async fn ensure_indexes(db: &SurrealDbClient) -> Result<(), AppError> {
    // Sequential on purpose: concurrent DDL makes SurrealDB report read/write clashes.
    for definition in INDEX_DEFINITIONS {
        db.client.query(*definition).await?.check()?;
    }

    Ok(())
}
