use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Billing plan; maps to rate-limit admission pairs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TenantPlan {
    Free,
    Starter,
    Professional,
    Enterprise,
}

stored_object!(Tenant, "tenant", {
    slug: String,
    plan: TenantPlan,
    data_dir: String
});

impl Tenant {
    pub fn new(slug: String, plan: TenantPlan, data_dir: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            slug,
            plan,
            data_dir,
        }
    }

    pub async fn get_by_slug(db: &SurrealDbClient, slug: &str) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE slug = $slug LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("slug", slug.to_owned()))
            .await?;

        Ok(response.take::<Vec<Self>>(0)?.into_iter().next())
    }

    /// Destructive removal of the tenant row. Callers are responsible for
    /// purging the tenant's vector namespace and blob prefix first.
    pub async fn destroy(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        let _removed: Option<Self> = db.delete_item(id).await?;
        Ok(())
    }
}
