use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use common::{error::AppError, storage::types::source_connector::SourceType};

use crate::retry::{check_response, transport_error, with_backoff, RetryPolicy};
use crate::{Connector, DocumentStream, SourceDocument};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const DEFAULT_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// Source files worth indexing.
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "c", "h", "cpp", "hpp", "cs", "rb",
    "php", "swift", "scala", "sh", "sql", "html", "css", "scss", "vue", "svelte", "md", "yaml",
    "yml", "toml", "json", "tf", "proto",
];

/// Dependency and build output directories, never descended into.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "out",
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "coverage",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    ".idea",
    ".vscode",
];

fn default_max_files() -> usize {
    500
}

fn default_max_file_bytes() -> u64 {
    200 * 1024
}

fn default_max_chars_per_file() -> usize {
    40_000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CodeHostCredentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeHostSettings {
    /// `owner/name` entries; empty means every accessible repository.
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default = "default_max_files")]
    pub max_files_per_repo: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_chars_per_file")]
    pub max_chars_per_file: usize,
}

impl Default for CodeHostSettings {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            max_files_per_repo: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            max_chars_per_file: default_max_chars_per_file(),
        }
    }
}

/// Repository connector: walks each accessible repository's tree, keeps code
/// files in priority order (docs and configs first, tests last), and decodes
/// contents as UTF-8, skipping binaries.
pub struct CodeHostConnector {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    token_url: String,
    credentials: CodeHostCredentials,
    settings: CodeHostSettings,
    retry: RetryPolicy,
}

impl CodeHostConnector {
    pub fn new(credentials: Value, settings: Value) -> Result<Self, AppError> {
        let credentials: CodeHostCredentials = serde_json::from_value(credentials)
            .map_err(|e| AppError::Config(format!("code-host credentials: {e}")))?;
        let settings: CodeHostSettings = serde_json::from_value(settings)
            .map_err(|e| AppError::Config(format!("code-host settings: {e}")))?;

        Ok(Self {
            http: crate::retry::http_client(),
            api_base: DEFAULT_API_BASE.to_string(),
            auth_base: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            credentials,
            settings,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    async fn api_get(&self, path: &str, query: &[(String, String)]) -> Result<Value, AppError> {
        let url = format!("{}{path}", self.api_base);

        with_backoff(&self.retry, || {
            let request = self
                .http
                .get(&url)
                .bearer_auth(&self.credentials.access_token)
                .header(reqwest::header::USER_AGENT, "knowledge-transfer-sync")
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .query(query);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "code-host api"))?;
                check_response(&response, "code-host api")?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| transport_error(&e, "code-host api body"))
            }
        })
        .await
    }

    /// Accessible repositories as `(full_name, default_branch)`.
    async fn list_repositories(&self) -> Result<Vec<(String, String)>, AppError> {
        if !self.settings.repositories.is_empty() {
            let mut repos = Vec::new();
            for full_name in &self.settings.repositories {
                let payload = self.api_get(&format!("/repos/{full_name}"), &[]).await?;
                let branch = payload
                    .get("default_branch")
                    .and_then(Value::as_str)
                    .unwrap_or("main")
                    .to_string();
                repos.push((full_name.clone(), branch));
            }
            return Ok(repos);
        }

        let mut repos = Vec::new();
        let mut page = 1_usize;
        loop {
            let query = vec![
                ("per_page".to_string(), "100".to_string()),
                ("page".to_string(), page.to_string()),
                ("sort".to_string(), "pushed".to_string()),
            ];
            let payload = self.api_get("/user/repos", &query).await?;
            let Some(list) = payload.as_array() else { break };
            if list.is_empty() {
                break;
            }
            for repo in list {
                let Some(full_name) = repo.get("full_name").and_then(Value::as_str) else {
                    continue;
                };
                let branch = repo
                    .get("default_branch")
                    .and_then(Value::as_str)
                    .unwrap_or("main")
                    .to_string();
                repos.push((full_name.to_string(), branch));
            }
            page = page.saturating_add(1);
        }

        Ok(repos)
    }

    async fn repository_tree(&self, full_name: &str, branch: &str) -> Result<Vec<Value>, AppError> {
        let payload = self
            .api_get(
                &format!("/repos/{full_name}/git/trees/{branch}"),
                &[("recursive".to_string(), "1".to_string())],
            )
            .await?;

        if payload.get("truncated").and_then(Value::as_bool) == Some(true) {
            warn!(repo = full_name, "tree listing truncated by provider");
        }

        Ok(payload
            .get("tree")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn file_document(
        &self,
        full_name: &str,
        path: &str,
    ) -> Result<Option<SourceDocument>, AppError> {
        let payload = match self
            .api_get(&format!("/repos/{full_name}/contents/{path}"), &[])
            .await
        {
            Ok(payload) => payload,
            Err(AppError::Permanent(message)) => {
                warn!(repo = full_name, path, %message, "content fetch failed; skipping file");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let Some(encoded) = payload.get("content").and_then(Value::as_str) else {
            return Ok(None);
        };
        let Some(text) = decode_repo_content(encoded) else {
            debug!(repo = full_name, path, "binary or undecodable content; skipped");
            return Ok(None);
        };

        let content = truncate_with_marker(&text, self.settings.max_chars_per_file);
        let language = extension_to_language(path.rsplit('.').next().unwrap_or_default());

        Ok(Some(SourceDocument {
            external_id: format!("{full_name}:{path}"),
            source: SourceType::CodeHost,
            title: format!("{full_name}/{path}"),
            content,
            bytes: None,
            filename: Some(path.to_string()),
            doc_type: "code".to_string(),
            author: None,
            timestamp: None,
            metadata: json!({
                "repository": full_name,
                "path": path,
                "language": language,
                "sha": payload.get("sha").and_then(Value::as_str),
            }),
        }))
    }
}

#[async_trait]
impl Connector for CodeHostConnector {
    fn source(&self) -> SourceType {
        SourceType::CodeHost
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> Option<String> {
        let client_id = self.credentials.client_id.clone()?;
        let mut url = Url::parse(&self.auth_base).ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", "repo read:user")
            .append_pair("state", state);
        Some(url.to_string())
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Value, AppError> {
        let client_id = self
            .credentials
            .client_id
            .clone()
            .ok_or_else(|| AppError::Config("missing code-host client_id".into()))?;
        let client_secret = self
            .credentials
            .client_secret
            .clone()
            .ok_or_else(|| AppError::Config("missing code-host client_secret".into()))?;

        let response = self
            .http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("code", code),
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
        self.api_get("/user", &[]).await.map(|_| ())
    }

    async fn test(&self) -> bool {
        self.api_get("/user", &[]).await.is_ok()
    }

    fn sync(&self, _since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
        // Repository trees are hash-addressed; unchanged files dedupe by
        // content hash downstream, so the cursor is not used here.
        Box::pin(try_stream! {
            let repos = self.list_repositories().await?;
            info!(repositories = repos.len(), "code-host repositories to sync");

            for (full_name, branch) in repos {
                let tree = match self.repository_tree(&full_name, &branch).await {
                    Ok(tree) => tree,
                    Err(AppError::Permanent(message)) => {
                        warn!(repo = %full_name, %message, "tree fetch failed; skipping repository");
                        continue;
                    }
                    Err(err) => Err(err)?,
                };

                let paths = filter_code_files(
                    &tree,
                    self.settings.max_file_bytes,
                    self.settings.max_files_per_repo,
                );
                debug!(repo = %full_name, files = paths.len(), "repository files selected");

                for path in paths {
                    if let Some(document) = self.file_document(&full_name, &path).await? {
                        yield document;
                    }
                }
            }
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<SourceDocument>, AppError> {
        let Some((full_name, path)) = external_id.split_once(':') else {
            return Ok(None);
        };
        self.file_document(full_name, path).await
    }

    async fn disconnect(&mut self) -> Result<(), AppError> {
        self.credentials.access_token.clear();
        Ok(())
    }
}

/// Keep blob entries that look like reviewable code, sorted so the most
/// explanatory files (READMEs, configs) come first and tests last.
fn filter_code_files(tree: &[Value], max_file_bytes: u64, max_files: usize) -> Vec<String> {
    let mut selected: Vec<(i32, String)> = tree
        .iter()
        .filter_map(|item| {
            if item.get("type").and_then(Value::as_str) != Some("blob") {
                return None;
            }
            let path = item.get("path").and_then(Value::as_str)?;

            if path
                .split('/')
                .any(|part| SKIP_DIRS.contains(&part))
            {
                return None;
            }

            let extension = path.rsplit('.').next().unwrap_or_default().to_lowercase();
            if !CODE_EXTENSIONS.contains(&extension.as_str()) {
                return None;
            }

            let size = item.get("size").and_then(Value::as_u64).unwrap_or(0);
            if size > max_file_bytes {
                return None;
            }

            Some((priority_score(path), path.to_string()))
        })
        .collect();

    selected.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    selected.truncate(max_files);
    selected.into_iter().map(|(_, path)| path).collect()
}

/// Lower scores surface first.
fn priority_score(path: &str) -> i32 {
    let lower = path.to_lowercase();
    let mut score = 0_i32;

    if lower.contains("readme") {
        score -= 100;
    }
    if lower.ends_with(".md") {
        score -= 40;
    }
    if lower.ends_with(".toml")
        || lower.ends_with(".yaml")
        || lower.ends_with(".yml")
        || lower.ends_with(".json")
    {
        score -= 30;
    }
    // Shallow files explain a repo better than deeply nested ones.
    score = score.saturating_add((lower.matches('/').count() as i32).saturating_mul(2));
    if lower.contains("test") || lower.contains("spec") {
        score = score.saturating_add(50);
    }

    score
}

/// Tree contents arrive base64 encoded with embedded newlines. Returns `None`
/// for binaries (invalid UTF-8).
fn decode_repo_content(encoded: &str) -> Option<String> {
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD.decode(cleaned).ok()?;
    String::from_utf8(bytes).ok()
}

fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}\n\n[... truncated ...]")
}

fn extension_to_language(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "cs" => "csharp",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" => "shell",
        "sql" => "sql",
        "md" => "markdown",
        _ => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(path: &str, size: u64) -> Value {
        json!({"type": "blob", "path": path, "size": size})
    }

    #[test]
    fn filtering_drops_dependencies_binaries_and_oversize() {
        let tree = vec![
            blob("src/main.rs", 1000),
            blob("node_modules/left-pad/index.js", 500),
            blob("assets/logo.png", 500),
            blob("src/huge.rs", 10_000_000),
            json!({"type": "tree", "path": "src"}),
        ];

        let files = filter_code_files(&tree, 200 * 1024, 100);
        assert_eq!(files, vec!["src/main.rs"]);
    }

    #[test]
    fn priority_puts_readme_and_configs_first_and_tests_last() {
        let tree = vec![
            blob("src/lib.rs", 100),
            blob("README.md", 100),
            blob("Cargo.toml", 100),
            blob("tests/integration_test.rs", 100),
        ];

        let files = filter_code_files(&tree, 200 * 1024, 100);
        assert_eq!(files[0], "README.md");
        assert_eq!(files[1], "Cargo.toml");
        assert_eq!(files.last().map(String::as_str), Some("tests/integration_test.rs"));
    }

    #[test]
    fn file_cap_is_applied_after_sorting() {
        let tree = vec![
            blob("tests/a_test.rs", 10),
            blob("README.md", 10),
            blob("src/lib.rs", 10),
        ];
        let files = filter_code_files(&tree, 1024, 2);
        assert_eq!(files.len(), 2);
        assert!(!files.iter().any(|f| f.contains("test")));
    }

    #[test]
    fn base64_content_decodes_and_binaries_are_skipped() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("fn main() {}\n");
        // Providers wrap base64 at 60 columns.
        let wrapped = format!("{}\n{}", &encoded[..8], &encoded[8..]);
        assert_eq!(decode_repo_content(&wrapped).as_deref(), Some("fn main() {}\n"));

        let binary = base64::engine::general_purpose::STANDARD.encode([0xFF_u8, 0xFE, 0x00, 0x80]);
        assert!(decode_repo_content(&binary).is_none());
    }

    #[test]
    fn long_files_truncate_with_a_marker() {
        let text = "x".repeat(100);
        let out = truncate_with_marker(&text, 40);
        assert!(out.ends_with("[... truncated ...]"));
        assert!(out.starts_with(&"x".repeat(40)));

        assert_eq!(truncate_with_marker("short", 40), "short");
    }
}
