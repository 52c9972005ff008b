use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{error::AppError, storage::types::source_connector::SourceType};

use crate::retry::{check_response, transport_error, with_backoff, RetryPolicy};
use crate::{Connector, DocumentStream, EmptyLedger, SourceDocument, SyncLedger};

const DEFAULT_API_BASE: &str = "https://api.box.com/2.0";
const DEFAULT_TOKEN_URL: &str = "https://api.box.com/oauth2/token";
const PAGE_LIMIT: usize = 1000;

fn default_extensions() -> Vec<String> {
    [
        "pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "txt", "md", "csv", "rtf", "png",
        "jpg", "jpeg",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_root_folder() -> String {
    "0".to_string()
}

fn default_max_file_size_mb() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CloudFilesCredentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudFilesSettings {
    #[serde(default = "default_root_folder")]
    pub root_folder_id: String,
    /// Folder names never descended into.
    #[serde(default)]
    pub excluded_folders: Vec<String>,
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl Default for CloudFilesSettings {
    fn default() -> Self {
        Self {
            root_folder_id: default_root_folder(),
            excluded_folders: Vec::new(),
            allowed_extensions: default_extensions(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

/// Cloud-drive connector: recursive folder walk with pagination and filters.
///
/// Incremental behavior leans on the provider's native content hash: when the
/// ledger already has the same hash for an external id, the file is not even
/// downloaded. Raw bytes are emitted for the document parser; the orchestrator
/// owns optional blob retention.
pub struct CloudFilesConnector {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
    oauth_client_id: Option<String>,
    credentials: RwLock<CloudFilesCredentials>,
    settings: CloudFilesSettings,
    ledger: Arc<dyn SyncLedger>,
    retry: RetryPolicy,
}

impl CloudFilesConnector {
    pub fn new(credentials: Value, settings: Value) -> Result<Self, AppError> {
        let credentials: CloudFilesCredentials = serde_json::from_value(credentials)
            .map_err(|e| AppError::Config(format!("cloud-files credentials: {e}")))?;
        let settings: CloudFilesSettings = serde_json::from_value(settings)
            .map_err(|e| AppError::Config(format!("cloud-files settings: {e}")))?;

        Ok(Self {
            http: crate::retry::http_client(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            oauth_client_id: credentials.client_id.clone(),
            credentials: RwLock::new(credentials),
            settings,
            ledger: Arc::new(EmptyLedger),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_api_base(mut self, api_base: String, token_url: String) -> Self {
        self.api_base = api_base;
        self.token_url = token_url;
        self
    }

    /// Install the orchestrator's hash ledger for incremental skips.
    pub fn with_ledger(mut self, ledger: Arc<dyn SyncLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    async fn api_get(&self, path: &str, query: &[(String, String)]) -> Result<Value, AppError> {
        match self.api_get_inner(path, query).await {
            Err(AppError::AuthExpired(_)) => {
                self.refresh_access_token().await?;
                self.api_get_inner(path, query).await
            }
            other => other,
        }
    }

    async fn api_get_inner(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, AppError> {
        let url = format!("{}{path}", self.api_base);
        let token = self.credentials.read().await.access_token.clone();

        with_backoff(&self.retry, || {
            let request = self.http.get(&url).bearer_auth(&token).query(query);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "cloud-files api"))?;
                check_response(&response, "cloud-files api")?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| transport_error(&e, "cloud-files api body"))
            }
        })
        .await
    }

    async fn download(&self, file_id: &str) -> Result<Bytes, AppError> {
        let url = format!("{}/files/{file_id}/content", self.api_base);
        let token = self.credentials.read().await.access_token.clone();

        with_backoff(&self.retry, || {
            let request = self.http.get(&url).bearer_auth(&token);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "cloud-files download"))?;
                check_response(&response, "cloud-files download")?;
                response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(&e, "cloud-files download body"))
            }
        })
        .await
        .map_err(AppError::from)
    }

    async fn refresh_access_token(&self) -> Result<(), AppError> {
        let (refresh_token, client_id, client_secret) = {
            let creds = self.credentials.read().await;
            (
                creds.refresh_token.clone(),
                creds.client_id.clone(),
                creds.client_secret.clone(),
            )
        };
        let refresh_token = refresh_token
            .ok_or_else(|| AppError::AuthExpired("no refresh token available".into()))?;
        let client_id =
            client_id.ok_or_else(|| AppError::Config("missing cloud-files client_id".into()))?;
        let client_secret = client_secret
            .ok_or_else(|| AppError::Config("missing cloud-files client_secret".into()))?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("token refresh: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::AuthExpired(format!(
                "token refresh failed: HTTP {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("token refresh body: {e}")))?;
        let mut creds = self.credentials.write().await;
        if let Some(token) = payload.get("access_token").and_then(Value::as_str) {
            creds.access_token = token.to_string();
        }
        if let Some(token) = payload.get("refresh_token").and_then(Value::as_str) {
            creds.refresh_token = Some(token.to_string());
        }
        info!("cloud-files access token refreshed");
        Ok(())
    }

    /// One page of folder children.
    async fn folder_items(&self, folder_id: &str, offset: usize) -> Result<Value, AppError> {
        let query = vec![
            (
                "fields".to_string(),
                "id,type,name,size,sha1,modified_at,created_at,created_by,extension".to_string(),
            ),
            ("limit".to_string(), PAGE_LIMIT.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        self.api_get(&format!("/folders/{folder_id}/items"), &query)
            .await
    }

    async fn file_entry_to_document(
        &self,
        entry: &Value,
    ) -> Result<Option<SourceDocument>, AppError> {
        let Some(file_id) = entry.get("id").and_then(Value::as_str) else {
            return Ok(None);
        };
        let name = entry.get("name").and_then(Value::as_str).unwrap_or("unnamed");

        if !file_passes_filters(entry, &self.settings) {
            return Ok(None);
        }

        // Native hash decides whether the download happens at all.
        let sha1 = entry.get("sha1").and_then(Value::as_str);
        if let Some(sha1) = sha1 {
            if self.ledger.known_hash(file_id).await.as_deref() == Some(sha1) {
                debug!(file_id, name, "file unchanged (sha1 match); skipping download");
                return Ok(None);
            }
        } else {
            warn!(file_id, name, "file has no provider hash; processing anyway");
        }

        let bytes = match self.download(file_id).await {
            Ok(bytes) => bytes,
            Err(AppError::Permanent(message)) => {
                warn!(file_id, name, %message, "download failed permanently; skipping file");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let extension = name.rsplit('.').next().unwrap_or_default().to_lowercase();
        Ok(Some(SourceDocument {
            external_id: file_id.to_string(),
            source: SourceType::CloudFiles,
            title: name.to_string(),
            content: String::new(),
            bytes: Some(bytes),
            filename: Some(name.to_string()),
            doc_type: "file".to_string(),
            author: entry
                .pointer("/created_by/name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            timestamp: entry
                .get("modified_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            metadata: json!({
                "sha1": sha1,
                "size": entry.get("size"),
                "extension": extension,
            }),
        }))
    }
}

/// Extension allow-list, size cap, and folder-name excludes.
fn file_passes_filters(entry: &Value, settings: &CloudFilesSettings) -> bool {
    let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();

    let extension = name.rsplit('.').next().unwrap_or_default().to_lowercase();
    if name.contains('.')
        && !settings
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    {
        debug!(name, "extension not in allow-list; skipping");
        return false;
    }

    let size = entry.get("size").and_then(Value::as_u64).unwrap_or(0);
    if size > settings.max_file_size_mb.saturating_mul(1024 * 1024) {
        debug!(name, size, "file exceeds size cap; skipping");
        return false;
    }

    true
}

#[async_trait]
impl Connector for CloudFilesConnector {
    fn source(&self) -> SourceType {
        SourceType::CloudFiles
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> Option<String> {
        let client_id = self.oauth_client_id.clone()?;
        let mut url = url::Url::parse("https://account.box.com/api/oauth2/authorize").ok()?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Some(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Value, AppError> {
        let (client_id, client_secret) = {
            let creds = self.credentials.read().await;
            (creds.client_id.clone(), creds.client_secret.clone())
        };
        let client_id =
            client_id.ok_or_else(|| AppError::Config("missing cloud-files client_id".into()))?;
        let client_secret = client_secret
            .ok_or_else(|| AppError::Config("missing cloud-files client_secret".into()))?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("code exchange: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::Permanent(format!(
                "code exchange failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AppError::Parse(format!("code exchange body: {e}")))
    }

    async fn connect(&mut self) -> Result<(), AppError> {
        self.api_get("/users/me", &[]).await.map(|_| ())
    }

    async fn test(&self) -> bool {
        self.api_get_inner("/users/me", &[]).await.is_ok()
    }

    fn sync(&self, since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
        Box::pin(try_stream! {
            // Iterative walk with a visited set: shared folders can form
            // cycles, and no folder id is expanded twice in one run.
            let mut stack = vec![self.settings.root_folder_id.clone()];
            let mut visited: HashSet<String> = HashSet::new();
            let mut files_seen = 0_usize;

            while let Some(folder_id) = stack.pop() {
                if !visited.insert(folder_id.clone()) {
                    continue;
                }

                let mut offset = 0_usize;
                loop {
                    let page = self.folder_items(&folder_id, offset).await?;
                    let entries = page
                        .get("entries")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let total = page
                        .get("total_count")
                        .and_then(Value::as_u64)
                        .unwrap_or(entries.len() as u64) as usize;

                    for entry in &entries {
                        match entry.get("type").and_then(Value::as_str) {
                            Some("folder") => {
                                let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
                                if self
                                    .settings
                                    .excluded_folders
                                    .iter()
                                    .any(|excluded| excluded.eq_ignore_ascii_case(name))
                                {
                                    debug!(name, "folder excluded by settings");
                                    continue;
                                }
                                if let Some(id) = entry.get("id").and_then(Value::as_str) {
                                    stack.push(id.to_string());
                                }
                            }
                            Some("file") => {
                                // Secondary cursor check for providers without hashes.
                                if let (Some(since), Some(modified)) = (
                                    since,
                                    entry
                                        .get("modified_at")
                                        .and_then(Value::as_str)
                                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok()),
                                ) {
                                    if entry.get("sha1").is_none() && modified.with_timezone(&Utc) < since {
                                        continue;
                                    }
                                }

                                if let Some(document) = self.file_entry_to_document(entry).await? {
                                    files_seen = files_seen.saturating_add(1);
                                    yield document;
                                }
                            }
                            _ => {}
                        }
                    }

                    offset = offset.saturating_add(entries.len());
                    if offset >= total || entries.is_empty() {
                        break;
                    }
                }
            }

            info!(files = files_seen, folders = visited.len(), "cloud-files walk complete");
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<SourceDocument>, AppError> {
        let file_id = external_id.strip_prefix("cloud-files_").unwrap_or(external_id);
        let query = vec![(
            "fields".to_string(),
            "id,type,name,size,sha1,modified_at,created_at,created_by,extension".to_string(),
        )];
        match self.api_get(&format!("/files/{file_id}"), &query).await {
            Ok(entry) => self.file_entry_to_document(&entry).await,
            Err(AppError::Permanent(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn disconnect(&mut self) -> Result<(), AppError> {
        let mut creds = self.credentials.write().await;
        creds.access_token.clear();
        creds.refresh_token = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64) -> Value {
        json!({"type": "file", "id": "f1", "name": name, "size": size})
    }

    #[test]
    fn extension_allow_list_is_enforced() {
        let settings = CloudFilesSettings::default();
        assert!(file_passes_filters(&entry("report.pdf", 1024), &settings));
        assert!(file_passes_filters(&entry("notes.md", 10), &settings));
        assert!(!file_passes_filters(&entry("video.mp4", 1024), &settings));
        assert!(!file_passes_filters(&entry("archive.zip", 1024), &settings));
        // No extension at all is allowed through for the parser to decide.
        assert!(file_passes_filters(&entry("README", 10), &settings));
    }

    #[test]
    fn size_cap_is_enforced() {
        let settings = CloudFilesSettings {
            max_file_size_mb: 1,
            ..Default::default()
        };
        assert!(file_passes_filters(&entry("ok.pdf", 1024 * 1024), &settings));
        assert!(!file_passes_filters(&entry("big.pdf", 2 * 1024 * 1024), &settings));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: CloudFilesSettings = serde_json::from_value(json!({})).expect("defaults");
        assert_eq!(settings.root_folder_id, "0");
        assert_eq!(settings.max_file_size_mb, 50);
        assert!(settings.allowed_extensions.contains(&"pdf".to_string()));
    }
}
