#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod extractor;
pub mod orchestrator;
pub mod pipeline;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            source_connector::{ConnectorStatus, SourceConnector, SourceType},
            sync_job::{JobKind, SyncJob, DEFAULT_LEASE_SECS},
            tenant::Tenant,
        },
    },
};
use connectors::{
    chat::ChatConnector, cloud_files::CloudFilesConnector, code_host::CodeHostConnector,
    crawler::WebCrawlerConnector, email::EmailConnector, Connector,
};
use gap_analysis::Strategy;

pub use orchestrator::{CompletionSummary, Orchestrator, StoreLedger};

/// Build the connector for a stored configuration row.
///
/// Cloud-files gets the store-backed hash ledger so unchanged files skip the
/// download entirely.
pub fn build_connector(
    db: &Arc<SurrealDbClient>,
    row: &SourceConnector,
) -> Result<Box<dyn Connector>, AppError> {
    let credentials = row.credentials.clone();
    let settings = row.settings.clone();

    Ok(match row.source_type {
        SourceType::EmailSource => Box::new(EmailConnector::new(credentials, settings)?),
        SourceType::ChatSource => Box::new(ChatConnector::new(credentials, settings)?),
        SourceType::CloudFiles => {
            let ledger = StoreLedger::new(
                Arc::clone(db),
                row.tenant_id.clone(),
                SourceType::CloudFiles,
            );
            Box::new(CloudFilesConnector::new(credentials, settings)?.with_ledger(Arc::new(ledger)))
        }
        SourceType::CodeHost => Box::new(CodeHostConnector::new(credentials, settings)?),
        SourceType::WebCrawler => Box::new(WebCrawlerConnector::new(settings)?),
    })
}

fn retry_delay(attempts: u32) -> ChronoDuration {
    // 30s, 60s, 120s... capped at 10 minutes.
    let capped = attempts.saturating_sub(1).min(5);
    let secs = 30_i64.saturating_mul(2_i64.saturating_pow(capped)).min(600);
    ChronoDuration::seconds(secs)
}

async fn run_job(orchestrator: &Orchestrator, job: &SyncJob) -> Result<(), AppError> {
    let db = orchestrator.db();
    let tenant: Option<Tenant> = db.get_item(&job.tenant_id).await?;
    let tenant = tenant
        .ok_or_else(|| AppError::NotFound(format!("tenant {} not found", job.tenant_id)))?;

    match &job.kind {
        JobKind::Sync { source } => {
            let row = SourceConnector::get(db, &tenant.id, *source)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("no {source} connector for tenant {}", tenant.slug))
                })?;
            let mut connector = build_connector(db, &row)?;

            SourceConnector::set_status(db, &row.id, ConnectorStatus::Connecting).await?;
            if let Err(err) = connector.connect().await {
                SourceConnector::mark_error(db, &row.id, &err.to_string()).await?;
                return Err(err);
            }
            SourceConnector::set_status(db, &row.id, ConnectorStatus::Connected).await?;

            orchestrator.sync(&tenant, connector.as_ref()).await?;
            Ok(())
        }
        JobKind::Analyze {
            strategy,
            project_id,
            include_pending,
            max_documents,
        } => {
            let strategy = Strategy::from_str(strategy)?;
            orchestrator
                .analyze(
                    &tenant,
                    strategy,
                    project_id.clone(),
                    *include_pending,
                    *max_documents,
                )
                .await?;
            Ok(())
        }
        JobKind::CompleteProcess => {
            orchestrator.complete_process(&tenant).await?;
            Ok(())
        }
    }
}

/// Claim-and-run loop over the tenant job queue.
///
/// The queue enforces one in-flight job per tenant; several workers can run
/// this loop concurrently and tenants still serialize.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    orchestrator: Arc<Orchestrator>,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = format!("sync-worker-{}", Uuid::new_v4());
    let lease = ChronoDuration::seconds(DEFAULT_LEASE_SECS);
    let idle_backoff = Duration::from_millis(500);

    loop {
        match SyncJob::claim_next_ready(&db, &worker_id, Utc::now(), lease).await {
            Ok(Some(job)) => {
                info!(
                    %worker_id,
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    attempt = job.attempts,
                    "claimed job"
                );
                match run_job(&orchestrator, &job).await {
                    Ok(()) => {
                        job.mark_succeeded(&db).await.ok();
                        info!(job_id = %job.id, "job succeeded");
                    }
                    Err(err) => {
                        error!(job_id = %job.id, error = %err, "job failed");
                        let delay = if err.is_retryable() {
                            retry_delay(job.attempts)
                        } else {
                            ChronoDuration::seconds(0)
                        };
                        job.mark_failed(&db, &err.to_string(), delay).await.ok();
                    }
                }
                orchestrator.sweep_rate_limiter();
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim job");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
