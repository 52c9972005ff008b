use std::collections::HashMap;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use common::{error::AppError, storage::types::source_connector::SourceType};

use crate::retry::{check_response, transport_error, with_backoff, RetryPolicy};
use crate::{Connector, DocumentStream, SourceDocument};

const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Message subtypes that carry no knowledge: joins, leaves, bot chatter.
const SKIPPED_SUBTYPES: &[&str] = &[
    "channel_join",
    "channel_leave",
    "group_join",
    "group_leave",
    "bot_message",
    "message_deleted",
];

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatCredentials {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    /// Channel ids to sync; empty means every channel the bot is a member of.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_include_threads")]
    pub include_threads: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages_per_channel: usize,
    /// How far back a full sync reaches when there is no cursor.
    #[serde(default = "default_oldest_days")]
    pub oldest_days: i64,
}

fn default_include_threads() -> bool {
    true
}

fn default_max_messages() -> usize {
    1000
}

fn default_oldest_days() -> i64 {
    365
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            include_threads: default_include_threads(),
            max_messages_per_channel: default_max_messages(),
            oldest_days: default_oldest_days(),
        }
    }
}

/// Workspace-chat connector: pages channel history in time order, optionally
/// expands threads, and resolves `<@USERID>` mentions to display names
/// through a per-run cache.
pub struct ChatConnector {
    http: reqwest::Client,
    api_base: String,
    credentials: ChatCredentials,
    settings: ChatSettings,
    retry: RetryPolicy,
}

impl ChatConnector {
    pub fn new(credentials: Value, settings: Value) -> Result<Self, AppError> {
        let credentials: ChatCredentials = serde_json::from_value(credentials)
            .map_err(|e| AppError::Config(format!("chat credentials: {e}")))?;
        let settings: ChatSettings = serde_json::from_value(settings)
            .map_err(|e| AppError::Config(format!("chat settings: {e}")))?;

        Ok(Self {
            http: crate::retry::http_client(),
            api_base: DEFAULT_API_BASE.to_string(),
            credentials,
            settings,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }

    /// Chat APIs signal errors in the body (`ok: false`) on HTTP 200.
    async fn api_call(&self, method: &str, query: &[(String, String)]) -> Result<Value, AppError> {
        let url = format!("{}/{method}", self.api_base);

        let payload: Value = with_backoff(&self.retry, || {
            let request = self
                .http
                .get(&url)
                .bearer_auth(&self.credentials.access_token)
                .query(query);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "chat api"))?;
                check_response(&response, "chat api")?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| transport_error(&e, "chat api body"))
            }
        })
        .await?;

        if payload.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(payload)
        } else {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            match error {
                "token_revoked" | "invalid_auth" | "not_authed" => {
                    Err(AppError::AuthExpired(format!("chat api {method}: {error}")))
                }
                "ratelimited" => Err(AppError::Transient(format!("chat api {method}: {error}"))),
                _ => Err(AppError::Permanent(format!("chat api {method}: {error}"))),
            }
        }
    }

    /// Channels the bot is a member of, or the configured subset.
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, AppError> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("types".to_string(), "public_channel,private_channel".to_string()),
                ("limit".to_string(), "200".to_string()),
            ];
            if let Some(cursor) = &cursor {
                query.push(("cursor".to_string(), cursor.clone()));
            }

            let payload = self.api_call("conversations.list", &query).await?;
            if let Some(list) = payload.get("channels").and_then(Value::as_array) {
                for channel in list {
                    let Some(id) = channel.get("id").and_then(Value::as_str) else {
                        continue;
                    };
                    let is_member = channel
                        .get("is_member")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let configured = self.settings.channels.is_empty()
                        || self.settings.channels.iter().any(|c| c == id);
                    if is_member && configured {
                        channels.push(ChannelInfo {
                            id: id.to_string(),
                            name: channel
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string(),
                        });
                    }
                }
            }

            cursor = payload
                .pointer("/response_metadata/next_cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_owned);
            if cursor.is_none() {
                break;
            }
        }

        Ok(channels)
    }

    /// Page one channel's history oldest-first.
    async fn channel_messages(
        &self,
        channel: &ChannelInfo,
        oldest: Option<f64>,
    ) -> Result<Vec<Value>, AppError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("channel".to_string(), channel.id.clone()),
                ("limit".to_string(), "200".to_string()),
            ];
            if let Some(oldest) = oldest {
                query.push(("oldest".to_string(), format!("{oldest:.6}")));
            }
            if let Some(cursor) = &cursor {
                query.push(("cursor".to_string(), cursor.clone()));
            }

            let payload = self.api_call("conversations.history", &query).await?;
            if let Some(list) = payload.get("messages").and_then(Value::as_array) {
                messages.extend(list.iter().cloned());
            }
            if messages.len() >= self.settings.max_messages_per_channel {
                messages.truncate(self.settings.max_messages_per_channel);
                break;
            }

            cursor = payload
                .pointer("/response_metadata/next_cursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_owned);
            if cursor.is_none() {
                break;
            }
        }

        // History comes newest-first; emit in time order.
        messages.sort_by(|a, b| {
            let ts_a = a.get("ts").and_then(Value::as_str).unwrap_or_default();
            let ts_b = b.get("ts").and_then(Value::as_str).unwrap_or_default();
            ts_a.cmp(ts_b)
        });

        Ok(messages)
    }

    async fn thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<Value>, AppError> {
        let query = vec![
            ("channel".to_string(), channel_id.to_string()),
            ("ts".to_string(), thread_ts.to_string()),
            ("limit".to_string(), "200".to_string()),
        ];
        let payload = self.api_call("conversations.replies", &query).await?;
        let replies = payload
            .get("messages")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    // The parent is included in replies; keep children only.
                    .filter(|m| m.get("ts") != m.get("thread_ts"))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(replies)
    }

    /// Resolve a user id to a display name, caching per sync run.
    async fn user_name(
        &self,
        user_id: &str,
        cache: &mut HashMap<String, String>,
    ) -> String {
        if let Some(name) = cache.get(user_id) {
            return name.clone();
        }

        let query = vec![("user".to_string(), user_id.to_string())];
        let name = match self.api_call("users.info", &query).await {
            Ok(payload) => payload
                .pointer("/user/profile/display_name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .or_else(|| payload.pointer("/user/real_name").and_then(Value::as_str))
                .unwrap_or(user_id)
                .to_string(),
            Err(err) => {
                debug!(user_id, error = %err, "user lookup failed; keeping raw id");
                user_id.to_string()
            }
        };

        cache.insert(user_id.to_string(), name.clone());
        name
    }

    async fn message_to_document(
        &self,
        channel: &ChannelInfo,
        message: &Value,
        cache: &mut HashMap<String, String>,
    ) -> Option<SourceDocument> {
        if should_skip_message(message) {
            return None;
        }

        let ts = message.get("ts").and_then(Value::as_str)?;
        let raw_text = message.get("text").and_then(Value::as_str)?;
        if raw_text.trim().is_empty() {
            return None;
        }

        let mut text = raw_text.to_string();
        for user_id in mentioned_user_ids(raw_text) {
            let name = self.user_name(&user_id, cache).await;
            text = text.replace(&format!("<@{user_id}>"), &format!("@{name}"));
        }

        let author = match message.get("user").and_then(Value::as_str) {
            Some(user_id) => Some(self.user_name(user_id, cache).await),
            None => None,
        };

        let timestamp = parse_chat_ts(ts);
        let date_label = timestamp
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        Some(SourceDocument {
            external_id: format!("{}-{ts}", channel.id),
            source: SourceType::ChatSource,
            title: format!("#{} {date_label}", channel.name),
            content: match &author {
                Some(author) => format!("{author}: {text}"),
                None => text,
            },
            bytes: None,
            filename: None,
            doc_type: "chat_message".to_string(),
            author,
            timestamp,
            metadata: json!({
                "channel_id": channel.id.clone(),
                "channel_name": channel.name.clone(),
                "thread_ts": message.get("thread_ts").and_then(Value::as_str),
            }),
        })
    }
}

#[derive(Debug, Clone)]
struct ChannelInfo {
    id: String,
    name: String,
}

#[async_trait]
impl Connector for ChatConnector {
    fn source(&self) -> SourceType {
        SourceType::ChatSource
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> Option<String> {
        let client_id = self.credentials.client_id.clone()?;
        let mut url = url::Url::parse("https://slack.com/oauth/v2/authorize").ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("scope", "channels:history,channels:read,users:read")
            .append_pair("redirect_uri", redirect_uri)
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
            .ok_or_else(|| AppError::Config("missing chat client_id".into()))?;
        let client_secret = self
            .credentials
            .client_secret
            .clone()
            .ok_or_else(|| AppError::Config("missing chat client_secret".into()))?;

        let response = self
            .http
            .post(format!("{}/oauth.v2.access", self.api_base))
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
        self.api_call("auth.test", &[]).await.map(|_| ())
    }

    async fn test(&self) -> bool {
        self.api_call("auth.test", &[]).await.is_ok()
    }

    fn sync(&self, since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
        Box::pin(try_stream! {
            // Mention and author lookups are cached per run, never globally,
            // so parallel tenants cannot observe each other's workspaces.
            let mut user_cache: HashMap<String, String> = HashMap::new();

            let oldest = since
                .map(|s| s.timestamp() as f64)
                .or_else(|| {
                    let days = self.settings.oldest_days;
                    (days > 0).then(|| (Utc::now() - chrono::Duration::days(days)).timestamp() as f64)
                });

            let channels = self.list_channels().await?;
            info!(channels = channels.len(), "chat channels to sync");

            for channel in channels {
                let messages = match self.channel_messages(&channel, oldest).await {
                    Ok(messages) => messages,
                    Err(AppError::Permanent(message)) => {
                        warn!(channel = %channel.id, %message, "channel sync failed; skipping channel");
                        continue;
                    }
                    Err(err) => Err(err)?,
                };

                for message in &messages {
                    if let Some(document) = self
                        .message_to_document(&channel, message, &mut user_cache)
                        .await
                    {
                        yield document;
                    }

                    // Expand threads rooted at this message.
                    let is_thread_root = message.get("thread_ts").is_some()
                        && message.get("thread_ts") == message.get("ts");
                    if self.settings.include_threads && is_thread_root {
                        if let Some(thread_ts) = message.get("ts").and_then(Value::as_str) {
                            let replies = self.thread_replies(&channel.id, thread_ts).await?;
                            for reply in &replies {
                                if let Some(document) = self
                                    .message_to_document(&channel, reply, &mut user_cache)
                                    .await
                                {
                                    yield document;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<SourceDocument>, AppError> {
        // external_id is `<channel>-<ts>`; chat APIs can address a single
        // message through the replies endpoint.
        let Some((channel_id, ts)) = external_id.rsplit_once('-') else {
            return Ok(None);
        };

        let query = vec![
            ("channel".to_string(), channel_id.to_string()),
            ("ts".to_string(), ts.to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let payload = self.api_call("conversations.replies", &query).await?;
        let Some(message) = payload
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
        else {
            return Ok(None);
        };

        let channel = ChannelInfo {
            id: channel_id.to_string(),
            name: channel_id.to_string(),
        };
        let mut cache = HashMap::new();
        Ok(self.message_to_document(&channel, message, &mut cache).await)
    }

    async fn disconnect(&mut self) -> Result<(), AppError> {
        self.credentials.access_token.clear();
        Ok(())
    }
}

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([A-Z0-9]+)>").expect("valid mention regex"));

/// User ids referenced as `<@U12345>` in a message body.
fn mentioned_user_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = MENTION_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    ids.dedup();
    ids
}

fn should_skip_message(message: &Value) -> bool {
    if let Some(subtype) = message.get("subtype").and_then(Value::as_str) {
        if SKIPPED_SUBTYPES.contains(&subtype) {
            return true;
        }
    }
    // Bot posts carry a bot_id even without a subtype.
    message.get("bot_id").and_then(Value::as_str).is_some()
}

/// Chat timestamps are `"<epoch>.<sequence>"` strings.
fn parse_chat_ts(ts: &str) -> Option<DateTime<Utc>> {
    let seconds = ts.split('.').next()?.parse::<i64>().ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_ids_are_extracted_in_order() {
        let text = "<@U111> please sync with <@U222> and <@U111>";
        assert_eq!(mentioned_user_ids(text), vec!["U111", "U222", "U111"]);

        assert!(mentioned_user_ids("no mentions here").is_empty());
    }

    #[test]
    fn join_leave_and_bot_messages_are_skipped() {
        assert!(should_skip_message(&json!({"subtype": "channel_join", "text": "joined"})));
        assert!(should_skip_message(&json!({"subtype": "channel_leave", "text": "left"})));
        assert!(should_skip_message(&json!({"subtype": "bot_message", "text": "beep"})));
        assert!(should_skip_message(&json!({"bot_id": "B01", "text": "automated"})));
        assert!(!should_skip_message(&json!({"user": "U1", "text": "real talk"})));
    }

    #[test]
    fn chat_timestamps_parse_to_utc() {
        let ts = parse_chat_ts("1767225600.000200").expect("parse");
        assert_eq!(ts.timestamp(), 1_767_225_600);
        assert!(parse_chat_ts("garbage").is_none());
    }
}
