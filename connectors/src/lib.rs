#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chat;
pub mod cloud_files;
pub mod code_host;
pub mod crawler;
pub mod email;
pub mod parser;
pub mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use common::{error::AppError, storage::types::source_connector::SourceType};

/// Canonical record emitted by every connector; one per source item.
///
/// `bytes` carries raw payloads for sources that need the document parser
/// (cloud files, crawled PDFs); text-native sources fill `content` directly.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub external_id: String,
    pub source: SourceType,
    pub title: String,
    pub content: String,
    pub bytes: Option<Bytes>,
    pub filename: Option<String>,
    pub doc_type: String,
    pub author: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl SourceDocument {
    /// Wire id consumed by existing frontends: `<source>_<external_id>`.
    pub fn doc_id(&self) -> String {
        format!("{}_{}", self.source.as_str(), self.external_id)
    }
}

/// Stream alias for incremental pulls.
pub type DocumentStream<'a> = BoxStream<'a, Result<SourceDocument, AppError>>;

/// One interface for all five source kinds.
///
/// `sync` must be idempotent per `external_id`: yielding an unchanged item
/// twice is fine, deleting is never allowed (deletions surface as tombstone
/// events elsewhere).
#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> SourceType;

    /// OAuth entry point; `None` for sources without OAuth (e.g. the crawler).
    fn auth_url(&self, _redirect_uri: &str, _state: &str) -> Option<String> {
        None
    }

    /// Exchange an OAuth code for credentials.
    async fn exchange_code(
        &self,
        _code: &str,
        _redirect_uri: &str,
    ) -> Result<serde_json::Value, AppError> {
        Err(AppError::Validation(
            "this source does not use OAuth".into(),
        ))
    }

    /// Validate credentials, refreshing tokens where the provider supports it.
    async fn connect(&mut self) -> Result<(), AppError>;

    /// Cheap liveness probe.
    async fn test(&self) -> bool;

    /// Incremental pull of everything changed since the cursor.
    fn sync(&self, since: Option<DateTime<Utc>>) -> DocumentStream<'_>;

    /// Rehydrate a single item by its external id.
    async fn fetch(&self, external_id: &str) -> Result<Option<SourceDocument>, AppError>;

    /// Best-effort credential revocation.
    async fn disconnect(&mut self) -> Result<(), AppError>;
}

/// Lookup seam the orchestrator provides so connectors can skip unchanged
/// items without touching the store directly.
#[async_trait]
pub trait SyncLedger: Send + Sync {
    /// The stored content hash (ours or provider-native) for an external id,
    /// if the document exists.
    async fn known_hash(&self, external_id: &str) -> Option<String>;
}

/// Ledger that knows nothing; every item looks new.
pub struct EmptyLedger;

#[async_trait]
impl SyncLedger for EmptyLedger {
    async fn known_hash(&self, _external_id: &str) -> Option<String> {
        None
    }
}
