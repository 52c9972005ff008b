use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Project, "project", {
    tenant_id: String,
    name: String,
    description: Option<String>
});

impl Project {
    pub fn new(tenant_id: String, name: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            name,
            description,
        }
    }

    pub async fn list_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}
