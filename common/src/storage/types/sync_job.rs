use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::source_connector::SourceType;

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 300;

/// What the worker should do for the tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobKind {
    Sync {
        source: SourceType,
    },
    Analyze {
        strategy: String,
        project_id: Option<String>,
        include_pending: bool,
        max_documents: usize,
    },
    CompleteProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Created,
    InProgress,
    Completed,
    Error(String),
    DeadLetter(String),
    Cancelled,
}

stored_object!(SyncJob, "sync_job", {
    tenant_id: String,
    kind: JobKind,
    status: JobStatus,
    attempts: u32,
    worker_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    lease_until: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    next_attempt_at: Option<DateTime<Utc>>
});

impl SyncJob {
    pub fn new(tenant_id: String, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            kind,
            status: JobStatus::Created,
            attempts: 0,
            worker_id: None,
            lease_until: None,
            next_attempt_at: None,
        }
    }

    pub async fn enqueue(
        db: &SurrealDbClient,
        tenant_id: String,
        kind: JobKind,
    ) -> Result<Self, AppError> {
        let job = Self::new(tenant_id, kind);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < MAX_ATTEMPTS
    }

    /// Claim the next runnable job for this worker.
    ///
    /// A job is runnable when it is Created (or Errored and due for retry)
    /// and its tenant has no other job currently in progress with a live
    /// lease; that is what serializes per-tenant work while letting tenants
    /// run in parallel. The claim itself is a conditional update, so two
    /// workers racing for the same job see exactly one winner.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<Self>, AppError> {
        let busy: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE status = $in_progress AND lease_until > $now",
            )
            .bind(("table", Self::table_name()))
            .bind(("in_progress", JobStatus::InProgress))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .await?
            .take(0)?;
        let busy_tenants: Vec<String> = busy.into_iter().map(|j| j.tenant_id).collect();

        let candidates: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE (status = $created OR (status.Error != NONE AND (next_attempt_at = NONE OR next_attempt_at <= $now))) \
                 AND tenant_id NOTINSIDE $busy \
                 ORDER BY created_at ASC LIMIT 10",
            )
            .bind(("table", Self::table_name()))
            .bind(("created", JobStatus::Created))
            .bind(("now", surrealdb::sql::Datetime::from(now)))
            .bind(("busy", busy_tenants))
            .await?
            .take(0)?;

        for candidate in candidates {
            let attempts = candidate.attempts.saturating_add(1);
            let claimed: Vec<Self> = db
                .client
                .query(
                    "UPDATE type::thing($table, $id) SET \
                     status = $in_progress, \
                     attempts = $attempts, \
                     worker_id = $worker_id, \
                     lease_until = $lease_until, \
                     updated_at = time::now() \
                     WHERE status = $previous",
                )
                .bind(("table", Self::table_name()))
                .bind(("id", candidate.id.clone()))
                .bind(("in_progress", JobStatus::InProgress))
                .bind(("attempts", attempts))
                .bind(("worker_id", worker_id.to_owned()))
                .bind((
                    "lease_until",
                    surrealdb::sql::Datetime::from(now + lease),
                ))
                .bind(("previous", candidate.status.clone()))
                .await?
                .take(0)?;

            if let Some(job) = claimed.into_iter().next() {
                return Ok(Some(job));
            }
            // Lost the race for this candidate; try the next one.
        }

        Ok(None)
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id) SET status = $status, lease_until = NONE, updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("status", JobStatus::Completed))
            .await?
            .check()?;

        Ok(())
    }

    /// Record a failure; the job becomes retryable after `retry_in`, or moves
    /// to the dead letter state when attempts are exhausted.
    pub async fn mark_failed(
        &self,
        db: &SurrealDbClient,
        reason: &str,
        retry_in: chrono::Duration,
    ) -> Result<(), AppError> {
        let status = if self.can_retry() {
            JobStatus::Error(reason.to_string())
        } else {
            JobStatus::DeadLetter(reason.to_string())
        };
        let next_attempt_at = Utc::now() + retry_in;

        db.client
            .query(
                "UPDATE type::thing($table, $id) SET \
                 status = $status, \
                 lease_until = NONE, \
                 next_attempt_at = $next_attempt_at, \
                 updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("status", status))
            .bind((
                "next_attempt_at",
                surrealdb::sql::Datetime::from(next_attempt_at),
            ))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn cancel_for_tenant(db: &SurrealDbClient, tenant_id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::table($table) SET status = $cancelled, updated_at = time::now() \
                 WHERE tenant_id = $tenant_id AND (status = $created OR status = $in_progress)",
            )
            .bind(("table", Self::table_name()))
            .bind(("cancelled", JobStatus::Cancelled))
            .bind(("created", JobStatus::Created))
            .bind(("in_progress", JobStatus::InProgress))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?
            .check()?;

        Ok(())
    }
}
