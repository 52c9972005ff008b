use std::sync::Arc;
use std::time::Duration;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{
        config::get_config,
        embedding::OpenAiEmbedder,
        llm::OpenAiLlmClient,
    },
};
use connectors::parser::DefaultDocumentParser;
use ingestion_pipeline::{
    pipeline::DefaultPipelineServices, run_worker_loop, Orchestrator,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vector_store::{SurrealVectorIndex, VectorService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let timeout = Duration::from_secs(config.request_timeout_secs);

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
    db.ensure_initialized().await?;

    let openai_client = async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    );

    let llm = Arc::new(OpenAiLlmClient::new(
        openai_client.clone(),
        config.chat_model.clone(),
        timeout,
    ));
    let embedder = Arc::new(OpenAiEmbedder::new(
        openai_client,
        config.embedding_model.clone(),
        config.embedding_dimensions,
        timeout,
    ));

    let index = Arc::new(SurrealVectorIndex::new(
        Arc::clone(&db),
        config.embedding_dimensions as usize,
    ));
    index.ensure_index().await?;
    let vector = Arc::new(VectorService::new(index, embedder));

    let parser = Arc::new(DefaultDocumentParser::new(
        config.parser_document_endpoint.clone(),
        config.parser_image_endpoint.clone(),
    ));
    let storage = StorageManager::new(&config).await?;

    let services = Arc::new(DefaultPipelineServices::new(
        parser,
        llm.clone(),
        Arc::clone(&vector),
        Some(storage),
        config.llm_concurrency,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        services,
        vector,
        llm,
    ));

    run_worker_loop(db, orchestrator).await
}
