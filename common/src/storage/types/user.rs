use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    Admin,
    Member,
    Viewer,
}

stored_object!(User, "user", {
    tenant_id: String,
    email: String,
    password_hash: String,
    role: UserRole
});

impl User {
    pub fn new(tenant_id: String, email: String, password_hash: String, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            email,
            password_hash,
            role,
        }
    }

    pub async fn get_by_email(
        db: &SurrealDbClient,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id AND email = $email LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("email", email.to_owned()))
            .await?;

        Ok(response.take::<Vec<Self>>(0)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn email_is_unique_per_tenant_not_globally() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("user_ns", database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");

        let a = User::new("t1".into(), "jo@example.com".into(), "hash".into(), UserRole::Admin);
        let b = User::new("t2".into(), "jo@example.com".into(), "hash".into(), UserRole::Member);
        db.store_item(a).await.expect("store a");
        db.store_item(b).await.expect("store b, same email different tenant");

        let dup = User::new("t1".into(), "jo@example.com".into(), "hash".into(), UserRole::Viewer);
        assert!(db.store_item(dup).await.is_err());

        let found = User::get_by_email(&db, "t2", "jo@example.com")
            .await
            .expect("lookup");
        assert_eq!(found.map(|u| u.tenant_id), Some("t2".to_string()));
    }
}
