use std::sync::LazyLock;

use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use common::{error::AppError, storage::types::source_connector::SourceType};

use crate::retry::{check_response, transport_error, with_backoff, RetryPolicy};
use crate::{Connector, DocumentStream, SourceDocument};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmailCredentials {
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
pub struct EmailSettings {
    /// Labels or folders to page through.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_labels() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_max_messages() -> usize {
    500
}

fn default_page_size() -> usize {
    100
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            labels: default_labels(),
            max_messages: default_max_messages(),
            page_size: default_page_size(),
        }
    }
}

/// Mailbox connector: one document per message, MIME flattened to text with
/// quoted replies stripped. Supports an externally delivered history cursor
/// for push-notification mode.
pub struct EmailConnector {
    http: reqwest::Client,
    api_base: String,
    token_url: String,
    auth_base: String,
    oauth_client_id: Option<String>,
    credentials: RwLock<EmailCredentials>,
    settings: EmailSettings,
    retry: RetryPolicy,
}

impl EmailConnector {
    pub fn new(credentials: Value, settings: Value) -> Result<Self, AppError> {
        let credentials: EmailCredentials = serde_json::from_value(credentials)
            .map_err(|e| AppError::Config(format!("email credentials: {e}")))?;
        let settings: EmailSettings = serde_json::from_value(settings)
            .map_err(|e| AppError::Config(format!("email settings: {e}")))?;

        Ok(Self {
            http: crate::retry::http_client(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            auth_base: DEFAULT_AUTH_URL.to_string(),
            oauth_client_id: credentials.client_id.clone(),
            credentials: RwLock::new(credentials),
            settings,
            retry: RetryPolicy::default(),
        })
    }

    /// Point the connector at a different API host (tests, proxies).
    pub fn with_endpoints(mut self, api_base: String, token_url: String) -> Self {
        self.api_base = api_base;
        self.token_url = token_url;
        self
    }

    async fn bearer(&self) -> String {
        self.credentials.read().await.access_token.clone()
    }

    /// Authenticated GET that refreshes the token once on a 401.
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
        let token = self.bearer().await;

        with_backoff(&self.retry, || {
            let request = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .query(query);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "email api"))?;
                check_response(&response, "email api")?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| transport_error(&e, "email api body"))
            }
        })
        .await
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
            client_id.ok_or_else(|| AppError::Config("missing email client_id".into()))?;
        let client_secret =
            client_secret.ok_or_else(|| AppError::Config("missing email client_secret".into()))?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
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
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Parse("token refresh response missing access_token".into()))?;

        self.credentials.write().await.access_token = access_token.to_string();
        info!("email access token refreshed");
        Ok(())
    }

    /// Page message ids for one label since the cursor.
    async fn list_message_ids(
        &self,
        label: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, AppError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("labelIds".to_string(), label.to_string()),
                ("maxResults".to_string(), self.settings.page_size.to_string()),
            ];
            if let Some(since) = since {
                query.push(("q".to_string(), format!("after:{}", since.timestamp())));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken".to_string(), token.clone()));
            }

            let payload = self.api_get("/users/me/messages", &query).await?;
            if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
                for message in messages {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        ids.push(id.to_string());
                    }
                    if ids.len() >= self.settings.max_messages {
                        return Ok(ids);
                    }
                }
            }

            page_token = payload
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_owned);
            if page_token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<Option<SourceDocument>, AppError> {
        let path = format!("/users/me/messages/{id}");
        let query = vec![("format".to_string(), "full".to_string())];
        match self.api_get(&path, &query).await {
            Ok(payload) => Ok(message_to_document(&payload)),
            Err(AppError::Permanent(message)) => {
                warn!(id, %message, "message fetch failed permanently; skipping");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Push-notification mode: consume an externally delivered history cursor
    /// and return only the messages added since.
    pub async fn sync_since_history(
        &self,
        history_id: &str,
    ) -> Result<Vec<SourceDocument>, AppError> {
        let query = vec![
            ("startHistoryId".to_string(), history_id.to_string()),
            ("historyTypes".to_string(), "messageAdded".to_string()),
        ];
        let payload = self.api_get("/users/me/history", &query).await?;

        let mut documents = Vec::new();
        if let Some(history) = payload.get("history").and_then(Value::as_array) {
            for entry in history {
                let Some(added) = entry.get("messagesAdded").and_then(Value::as_array) else {
                    continue;
                };
                for wrapper in added {
                    let Some(id) = wrapper
                        .pointer("/message/id")
                        .and_then(Value::as_str)
                    else {
                        continue;
                    };
                    if let Some(document) = self.get_message(id).await? {
                        documents.push(document);
                    }
                }
            }
        }

        debug!(history_id, count = documents.len(), "history sync complete");
        Ok(documents)
    }
}

#[async_trait]
impl Connector for EmailConnector {
    fn source(&self) -> SourceType {
        SourceType::EmailSource
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> Option<String> {
        let client_id = self.oauth_client_id.clone()?;
        let mut url = Url::parse(&self.auth_base).ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", OAUTH_SCOPE)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
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
            client_id.ok_or_else(|| AppError::Config("missing email client_id".into()))?;
        let client_secret =
            client_secret.ok_or_else(|| AppError::Config("missing email client_secret".into()))?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
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
        match self.api_get_inner("/users/me/profile", &[]).await {
            Ok(_) => Ok(()),
            Err(AppError::AuthExpired(_)) => {
                self.refresh_access_token().await?;
                self.api_get_inner("/users/me/profile", &[]).await.map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    async fn test(&self) -> bool {
        self.api_get_inner("/users/me/profile", &[]).await.is_ok()
    }

    fn sync(&self, since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
        Box::pin(try_stream! {
            let mut seen = std::collections::HashSet::new();
            for label in self.settings.labels.clone() {
                let ids = self.list_message_ids(&label, since).await?;
                info!(label, messages = ids.len(), "email label listed");
                for id in ids {
                    // A message can carry several labels; emit it once.
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if let Some(document) = self.get_message(&id).await? {
                        yield document;
                    }
                }
            }
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<SourceDocument>, AppError> {
        self.get_message(external_id).await
    }

    async fn disconnect(&mut self) -> Result<(), AppError> {
        let mut creds = self.credentials.write().await;
        creds.access_token.clear();
        creds.refresh_token = None;
        Ok(())
    }
}

/// Convert one full-format message payload into the canonical document.
fn message_to_document(message: &Value) -> Option<SourceDocument> {
    let id = message.get("id").and_then(Value::as_str)?;
    let payload = message.get("payload")?;
    let headers = payload.get("headers").and_then(Value::as_array);

    let subject = header_value(headers, "Subject").unwrap_or("(no subject)");
    let from = header_value(headers, "From").unwrap_or_default();

    let timestamp = message
        .get("internalDate")
        .and_then(Value::as_str)
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    let raw_body = extract_body(payload);
    let body = clean_email_body(&raw_body);
    if body.trim().is_empty() {
        debug!(id, "message has no usable body; skipped");
        return None;
    }

    Some(SourceDocument {
        external_id: id.to_string(),
        source: SourceType::EmailSource,
        title: subject.to_string(),
        content: body,
        bytes: None,
        filename: None,
        doc_type: "email".to_string(),
        author: Some(extract_name_from_header(from)),
        timestamp,
        metadata: json!({
            "thread_id": message.get("threadId").and_then(Value::as_str),
            "snippet": message.get("snippet").and_then(Value::as_str),
        }),
    })
}

fn header_value<'a>(headers: Option<&'a Vec<Value>>, name: &str) -> Option<&'a str> {
    headers?.iter().find_map(|h| {
        let header_name = h.get("name").and_then(Value::as_str)?;
        if header_name.eq_ignore_ascii_case(name) {
            h.get("value").and_then(Value::as_str)
        } else {
            None
        }
    })
}

/// Flatten a MIME tree to text: prefer `text/plain` parts, fall back to
/// stripped `text/html`.
fn extract_body(payload: &Value) -> String {
    if let Some(text) = direct_body(payload, "text/plain") {
        return text;
    }

    let mut plain = String::new();
    let mut html = String::new();
    collect_parts(payload, &mut plain, &mut html);

    if !plain.trim().is_empty() {
        plain
    } else if !html.trim().is_empty() {
        html_to_text(&html)
    } else if let Some(text) = direct_body(payload, "text/html") {
        html_to_text(&text)
    } else {
        String::new()
    }
}

fn direct_body(part: &Value, mime: &str) -> Option<String> {
    let mime_type = part.get("mimeType").and_then(Value::as_str)?;
    if mime_type != mime {
        return None;
    }
    let data = part.pointer("/body/data").and_then(Value::as_str)?;
    decode_base64url(data)
}

fn collect_parts(part: &Value, plain: &mut String, html: &mut String) {
    if let Some(text) = direct_body(part, "text/plain") {
        plain.push_str(&text);
        plain.push('\n');
    } else if let Some(text) = direct_body(part, "text/html") {
        html.push_str(&text);
    }

    if let Some(parts) = part.get("parts").and_then(Value::as_array) {
        for child in parts {
            collect_parts(child, plain, html);
        }
    }
}

fn decode_base64url(data: &str) -> Option<String> {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let cleaned = data.trim_end_matches('=');
    engine
        .decode(cleaned)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<[^>]+>").expect("valid tag regex")
});
static BLANK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank-line regex"));

/// Minimal HTML flattening for email bodies; real pages go through the
/// crawler's readable extraction instead.
fn html_to_text(html: &str) -> String {
    let with_breaks = html
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("</p>", "\n")
        .replace("</div>", "\n");
    let stripped = TAG_RE.replace_all(&with_breaks, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let collapsed: String = decoded
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_RE.replace_all(&collapsed, "\n\n").trim().to_string()
}

static QUOTE_INTRO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^On .{0,200}wrote:\s*$").expect("valid quote-intro regex")
});

/// Cut quoted replies and forwarded-header blocks, drop `>` quote lines.
fn clean_email_body(body: &str) -> String {
    let mut text = body;

    if let Some(m) = QUOTE_INTRO_RE.find(text) {
        text = &text[..m.start()];
    }
    for marker in [
        "-----Original Message-----",
        "---------- Forwarded message ---------",
        "________________________________",
    ] {
        if let Some(pos) = text.find(marker) {
            text = &text[..pos];
        }
    }

    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect();

    kept.join("\n").trim().to_string()
}

/// `"Ada Lovelace <ada@example.com>"` → `"Ada Lovelace"`.
fn extract_name_from_header(from: &str) -> String {
    if let Some(pos) = from.find('<') {
        let name = from[..pos].trim().trim_matches('"');
        if !name.is_empty() {
            return name.to_string();
        }
    }
    from.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_replies_and_forward_blocks_are_stripped() {
        let body = "Thanks, shipping today.\n\nOn Tue, Jan 6, 2026 at 9:14 AM Sam Doe wrote:\n> earlier message\n> more quoting";
        assert_eq!(clean_email_body(body), "Thanks, shipping today.");

        let body = "See below.\n-----Original Message-----\nFrom: someone\nquoted";
        assert_eq!(clean_email_body(body), "See below.");

        let body = "Inline answer\n> quoted line\nmore inline";
        assert_eq!(clean_email_body(body), "Inline answer\nmore inline");
    }

    #[test]
    fn html_bodies_flatten_to_text() {
        let html = "<html><head><style>p{color:red}</style></head><body><p>First&nbsp;line</p><script>alert(1)</script><div>Second &amp; third</div></body></html>";
        let text = html_to_text(html);
        assert!(text.contains("First line"));
        assert!(text.contains("Second & third"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
    }

    #[test]
    fn sender_names_come_out_of_the_from_header() {
        assert_eq!(
            extract_name_from_header("Ada Lovelace <ada@example.com>"),
            "Ada Lovelace"
        );
        assert_eq!(
            extract_name_from_header("\"Doe, Sam\" <sam@example.com>"),
            "Doe, Sam"
        );
        assert_eq!(extract_name_from_header("bare@example.com"), "bare@example.com");
    }

    fn b64(data: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
    }

    #[test]
    fn full_message_payload_becomes_a_document() {
        let message = json!({
            "id": "msg-42",
            "threadId": "thread-7",
            "internalDate": "1767225600000",
            "snippet": "Thanks, shipping today",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": "Deploy window"},
                    {"name": "From", "value": "Ada Lovelace <ada@example.com>"}
                ],
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "body": {"data": b64("Thanks, shipping today.\n\nOn Mon someone wrote:\n> old stuff")}
                    },
                    {
                        "mimeType": "text/html",
                        "body": {"data": b64("<p>Thanks, shipping today.</p>")}
                    }
                ]
            }
        });

        let document = message_to_document(&message).expect("document");
        assert_eq!(document.external_id, "msg-42");
        assert_eq!(document.doc_id(), "email-source_msg-42");
        assert_eq!(document.title, "Deploy window");
        assert_eq!(document.content, "Thanks, shipping today.");
        assert_eq!(document.author.as_deref(), Some("Ada Lovelace"));
        assert!(document.timestamp.is_some());
    }

    #[test]
    fn message_without_usable_body_is_skipped() {
        let message = json!({
            "id": "empty",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [{"name": "Subject", "value": "nothing"}],
                "parts": []
            }
        });
        assert!(message_to_document(&message).is_none());
    }

    #[test]
    fn html_only_message_falls_back_to_stripped_html() {
        let message = json!({
            "id": "html-1",
            "payload": {
                "mimeType": "text/html",
                "headers": [
                    {"name": "Subject", "value": "Newsletter"},
                    {"name": "From", "value": "news@example.com"}
                ],
                "body": {"data": b64("<h1>Release 2.0</h1><p>It shipped.</p>")}
            }
        });

        let document = message_to_document(&message).expect("document");
        assert!(document.content.contains("Release 2.0"));
        assert!(document.content.contains("It shipped."));
    }
}
