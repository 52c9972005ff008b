use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::hash::record_id,
};

/// The five supported source kinds. Serialized with the wire labels the
/// frontend already understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceType {
    #[serde(rename = "email-source")]
    EmailSource,
    #[serde(rename = "chat-source")]
    ChatSource,
    #[serde(rename = "cloud-files")]
    CloudFiles,
    #[serde(rename = "code-host")]
    CodeHost,
    #[serde(rename = "web-crawler")]
    WebCrawler,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::EmailSource => "email-source",
            SourceType::ChatSource => "chat-source",
            SourceType::CloudFiles => "cloud-files",
            SourceType::CodeHost => "code-host",
            SourceType::WebCrawler => "web-crawler",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectorStatus {
    Disconnected,
    Connecting,
    Connected,
    Syncing,
    Error,
}

/// Per-sync job summary surfaced to the tenant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub total: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub errored: u64,
}

stored_object!(SourceConnector, "source_connector", {
    tenant_id: String,
    source_type: SourceType,
    /// Opaque provider credentials; encrypted by the secrets layer before storage.
    credentials: serde_json::Value,
    /// Type-specific settings blob (folder excludes, channel lists, crawl options).
    settings: serde_json::Value,
    status: ConnectorStatus,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_summary: Option<SyncSummary>
});

impl SourceConnector {
    /// Record id derived from `(tenant, source)`, which is what enforces the
    /// one-active-connector-per-source invariant.
    pub fn record_key(tenant_id: &str, source_type: SourceType) -> String {
        record_id(&[tenant_id, source_type.as_str()])
    }

    pub fn new(
        tenant_id: String,
        source_type: SourceType,
        credentials: serde_json::Value,
        settings: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::record_key(&tenant_id, source_type),
            created_at: now,
            updated_at: now,
            tenant_id,
            source_type,
            credentials,
            settings,
            status: ConnectorStatus::Disconnected,
            last_sync: None,
            last_error: None,
            last_summary: None,
        }
    }

    pub async fn get(
        db: &SurrealDbClient,
        tenant_id: &str,
        source_type: SourceType,
    ) -> Result<Option<Self>, AppError> {
        Ok(db
            .get_item::<Self>(&Self::record_key(tenant_id, source_type))
            .await?)
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        id: &str,
        status: ConnectorStatus,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET status = $status, updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("status", status))
            .await?
            .check()?;

        Ok(())
    }

    /// Record a failed sync; ERROR is recoverable and keeps the cursor.
    pub async fn mark_error(
        db: &SurrealDbClient,
        id: &str,
        message: &str,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET status = $status, last_error = $message, updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("status", ConnectorStatus::Error))
            .bind(("message", message.to_owned()))
            .await?
            .check()?;

        Ok(())
    }

    /// Advance the incremental cursor after a successful sync.
    pub async fn mark_synced(
        db: &SurrealDbClient,
        id: &str,
        cursor: DateTime<Utc>,
        summary: SyncSummary,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET status = $status, last_sync = $cursor, last_error = NONE, last_summary = $summary, updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_owned()))
            .bind(("status", ConnectorStatus::Connected))
            .bind(("cursor", surrealdb::sql::Datetime::from(cursor)))
            .bind(("summary", summary))
            .await?
            .check()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn one_connector_per_tenant_and_source() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("conn_ns", database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");

        let first = SourceConnector::new(
            "t1".into(),
            SourceType::ChatSource,
            json!({"access_token": "xoxb"}),
            json!({"channels": []}),
        );
        db.store_item(first.clone()).await.expect("store first");

        // Same (tenant, source) maps to the same record id; creating again conflicts.
        let duplicate = SourceConnector::new(
            "t1".into(),
            SourceType::ChatSource,
            json!({"access_token": "other"}),
            json!({}),
        );
        assert_eq!(first.id, duplicate.id);
        assert!(db.store_item(duplicate).await.is_err());

        // A different source for the same tenant is a separate row.
        let crawler = SourceConnector::new("t1".into(), SourceType::WebCrawler, json!({}), json!({}));
        db.store_item(crawler).await.expect("store crawler");
    }

    #[tokio::test]
    async fn status_transitions_and_cursor() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("conn_ns", database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");

        let connector =
            SourceConnector::new("t1".into(), SourceType::EmailSource, json!({}), json!({}));
        let id = connector.id.clone();
        db.store_item(connector).await.expect("store");

        SourceConnector::set_status(&db, &id, ConnectorStatus::Syncing)
            .await
            .expect("set syncing");

        let cursor = Utc::now();
        let summary = SyncSummary {
            total: 10,
            succeeded: 9,
            skipped: 1,
            errored: 0,
        };
        SourceConnector::mark_synced(&db, &id, cursor, summary)
            .await
            .expect("mark synced");

        let stored = SourceConnector::get(&db, "t1", SourceType::EmailSource)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.status, ConnectorStatus::Connected);
        assert_eq!(stored.last_summary, Some(summary));
        assert!(stored.last_sync.is_some());
        assert!(stored.last_error.is_none());

        SourceConnector::mark_error(&db, &id, "token expired")
            .await
            .expect("mark error");
        let errored = SourceConnector::get(&db, "t1", SourceType::EmailSource)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(errored.status, ConnectorStatus::Error);
        assert_eq!(errored.last_error.as_deref(), Some("token expired"));
        // Cursor survives the error so the next sync stays incremental.
        assert!(errored.last_sync.is_some());
    }
}
