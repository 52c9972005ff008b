use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    /// Hosted parser endpoint for PDF/Office payloads.
    #[serde(default)]
    pub parser_document_endpoint: Option<String>,
    /// Hosted parser endpoint for image payloads (OCR).
    #[serde(default)]
    pub parser_image_endpoint: Option<String>,
    /// Upper bound on concurrent LLM calls across all tenants.
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    /// Deadline applied to every outbound provider call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_llm_concurrency() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    60
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Placeholder configuration for unit tests; no live endpoints.
    pub fn test_defaults() -> Self {
        Self {
            openai_api_key: "test".into(),
            surrealdb_address: "mem://".into(),
            surrealdb_username: "test".into(),
            surrealdb_password: "test".into(),
            surrealdb_namespace: "test".into(),
            surrealdb_database: "test".into(),
            data_dir: "/tmp/unused".into(),
            openai_base_url: default_base_url(),
            storage: StorageKind::Memory,
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            parser_document_endpoint: None,
            parser_image_endpoint: None,
            llm_concurrency: default_llm_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}
