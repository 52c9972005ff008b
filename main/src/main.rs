use std::io::{self, BufRead, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::config::{get_config, AppConfig},
    storage::types::{
        tenant::{Tenant, TenantPlan},
        user::{User, UserRole},
        StoredObject,
    },
};
use vector_store::{SurrealVectorIndex, VectorIndex};

const RESET_CONFIRMATION: &str = "RESET ALL TENANT DATA";

/// Administrative surface: destructive reset, baseline seed, migrations.
#[derive(Parser)]
#[command(name = "admin", about = "Knowledge-transfer platform administration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drop the relational schema, purge every vector namespace, and flush
    /// blob storage. Requires typing the confirmation string unless --force.
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Create baseline tenants and users, one per plan.
    Seed,
    /// Apply schema migrations and ensure indices.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    match cli.command {
        Command::Reset { force } => reset(&db, &config, force).await?,
        Command::Seed => seed(&db).await?,
        Command::Migrate => migrate(&db, &config).await?,
    }

    Ok(())
}

const TABLES: &[&str] = &[
    "tenant",
    "user",
    "project",
    "source_connector",
    "document",
    "deleted_document",
    "knowledge_gap",
    "gap_answer",
    "video",
    "sync_job",
    "embedding_chunk",
];

async fn reset(
    db: &Arc<SurrealDbClient>,
    config: &AppConfig,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !force {
        print!("This destroys every tenant, document, gap, and vector.\nType \"{RESET_CONFIRMATION}\" to continue: ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        if line.trim() != RESET_CONFIRMATION {
            println!("Confirmation mismatch; nothing was touched.");
            return Ok(());
        }
    }

    // Vector namespaces first, one purge per tenant.
    let index = SurrealVectorIndex::new(Arc::clone(db), config.embedding_dimensions as usize);
    let tenants: Vec<Tenant> = db.get_all_stored_items().await.map_err(AppError::from)?;
    for tenant in &tenants {
        index.delete_namespace(&tenant.id).await?;
        println!("purged vector namespace for tenant {}", tenant.slug);
    }

    // Blob storage.
    let storage = StorageManager::new(config).await?;
    for tenant in &tenants {
        storage.delete_prefix(&format!("{}/", tenant.id)).await.ok();
    }

    // Relational schema.
    for table in TABLES {
        db.client
            .query(format!("REMOVE TABLE IF EXISTS {table};"))
            .await
            .map_err(AppError::from)?;
        println!("dropped table {table}");
    }

    println!("reset complete");
    Ok(())
}

async fn seed(db: &Arc<SurrealDbClient>) -> Result<(), Box<dyn std::error::Error>> {
    db.ensure_initialized().await?;

    let baseline = [
        ("demo-free", TenantPlan::Free),
        ("demo-starter", TenantPlan::Starter),
        ("demo-professional", TenantPlan::Professional),
        ("demo-enterprise", TenantPlan::Enterprise),
    ];

    for (slug, plan) in baseline {
        if Tenant::get_by_slug(db, slug).await?.is_some() {
            println!("tenant {slug} already present; skipping");
            continue;
        }

        let tenant = Tenant::new(slug.to_string(), plan, format!("./data/{slug}"));
        let tenant_id = tenant.id.clone();
        db.store_item(tenant).await.map_err(AppError::from)?;

        let admin = User::new(
            tenant_id,
            format!("admin@{slug}.example.com"),
            // Placeholder hash; real deployments set passwords through the
            // account flow, not the seed.
            "argon2-placeholder".to_string(),
            UserRole::Admin,
        );
        db.store_item(admin).await.map_err(AppError::from)?;
        println!("seeded tenant {slug} ({plan:?})");
    }

    println!("seed complete");
    Ok(())
}

async fn migrate(
    db: &Arc<SurrealDbClient>,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    db.ensure_initialized().await?;
    println!("relational indices ensured");

    let index = SurrealVectorIndex::new(Arc::clone(db), config.embedding_dimensions as usize);
    index.ensure_index().await?;
    println!(
        "vector index ensured (dimension {})",
        config.embedding_dimensions
    );

    // Report table presence for operator sanity.
    for table in TABLES {
        let count: Option<serde_json::Value> = db
            .client
            .query(format!("SELECT count() AS count FROM {table} GROUP ALL;"))
            .await
            .map_err(AppError::from)?
            .take(0)
            .unwrap_or(None);
        let rows = count
            .as_ref()
            .and_then(|v| v.get("count"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        println!("table {table}: {rows} rows");
    }

    println!("migrate complete");
    Ok(())
}
