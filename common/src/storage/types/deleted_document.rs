use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::hash::record_id,
};

use super::source_connector::SourceType;

stored_object!(DeletedDocument, "deleted_document", {
    tenant_id: String,
    source_type: SourceType,
    external_id: String
});

/// Tombstone preventing resync of a user-deleted item.
impl DeletedDocument {
    pub fn record_key(tenant_id: &str, source_type: SourceType, external_id: &str) -> String {
        record_id(&["tombstone", tenant_id, source_type.as_str(), external_id])
    }

    pub async fn record(
        db: &SurrealDbClient,
        tenant_id: &str,
        source_type: SourceType,
        external_id: &str,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let tombstone = Self {
            id: Self::record_key(tenant_id, source_type, external_id),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.to_string(),
            source_type,
            external_id: external_id.to_string(),
        };

        // Recording twice is a no-op; the tombstone already doing its job is fine.
        match db.store_item(tombstone).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("already exists") => Ok(()),
            Err(err) => Err(AppError::Database(err)),
        }
    }

    pub async fn exists(
        db: &SurrealDbClient,
        tenant_id: &str,
        source_type: SourceType,
        external_id: &str,
    ) -> Result<bool, AppError> {
        Ok(db
            .get_item::<Self>(&Self::record_key(tenant_id, source_type, external_id))
            .await?
            .is_some())
    }
}
