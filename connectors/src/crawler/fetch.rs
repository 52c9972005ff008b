use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use common::error::AppError;

use crate::retry::{check_response, transport_error, with_backoff, RetryPolicy};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; KnowledgeTransferBot/1.0; +https://example.com/bot)";

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type.contains("text/html")
            || self.content_type.contains("application/xhtml")
            // Servers that omit the header are treated as HTML.
            || self.content_type.is_empty()
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type.contains("application/pdf")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Seam between the crawl loop and the network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, AppError>;
}

/// Authentication modes for protected sites.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CrawlerAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    Cookie {
        cookie: String,
    },
    /// Posts the login form once on `connect`; the session cookie rides along
    /// on subsequent requests.
    Form {
        login_url: String,
        username_field: String,
        password_field: String,
        username: String,
        password: String,
    },
}

/// reqwest-backed fetcher with user-agent rotation, proxy rotation, retry
/// with backoff, and the auth modes above.
pub struct HttpFetcher {
    clients: Vec<reqwest::Client>,
    user_agents: Vec<String>,
    auth: CrawlerAuth,
    counter: AtomicUsize,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(
        user_agents: Vec<String>,
        proxies: Vec<String>,
        auth: CrawlerAuth,
    ) -> Result<Self, AppError> {
        let user_agents = if user_agents.is_empty() {
            vec![DEFAULT_USER_AGENT.to_string()]
        } else {
            user_agents
        };

        // One client per proxy; a single direct client otherwise. Cookies are
        // kept per client so form logins survive rotation.
        let mut clients = Vec::new();
        if proxies.is_empty() {
            clients.push(
                reqwest::Client::builder()
                    .cookie_store(true)
                    .timeout(crate::retry::HTTP_TIMEOUT)
                    .build()
                    .map_err(|e| AppError::Config(format!("http client: {e}")))?,
            );
        } else {
            for proxy in &proxies {
                let proxy = reqwest::Proxy::all(proxy)
                    .map_err(|e| AppError::Config(format!("proxy {proxy}: {e}")))?;
                clients.push(
                    reqwest::Client::builder()
                        .cookie_store(true)
                        .timeout(crate::retry::HTTP_TIMEOUT)
                        .proxy(proxy)
                        .build()
                        .map_err(|e| AppError::Config(format!("http client: {e}")))?,
                );
            }
        }

        Ok(Self {
            clients,
            user_agents,
            auth,
            counter: AtomicUsize::new(0),
            retry: RetryPolicy::default(),
        })
    }

    fn next_slot(&self) -> (usize, usize) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (n % self.clients.len(), n % self.user_agents.len())
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            CrawlerAuth::None | CrawlerAuth::Form { .. } => request,
            CrawlerAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            CrawlerAuth::Bearer { token } => request.bearer_auth(token),
            CrawlerAuth::Cookie { cookie } => request.header(reqwest::header::COOKIE, cookie),
        }
    }

    /// Perform the form login when configured. No-op for other modes.
    pub async fn login(&self) -> Result<(), AppError> {
        let CrawlerAuth::Form {
            login_url,
            username_field,
            password_field,
            username,
            password,
        } = &self.auth
        else {
            return Ok(());
        };

        for client in &self.clients {
            let response = client
                .post(login_url)
                .form(&[
                    (username_field.as_str(), username.as_str()),
                    (password_field.as_str(), password.as_str()),
                ])
                .send()
                .await
                .map_err(|e| AppError::Transient(format!("form login: {e}")))?;
            if !response.status().is_success() && response.status().as_u16() != 302 {
                return Err(AppError::AuthExpired(format!(
                    "form login failed: HTTP {}",
                    response.status()
                )));
            }
        }

        debug!("form login completed");
        Ok(())
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, AppError> {
        let (client_idx, agent_idx) = self.next_slot();
        let client = self
            .clients
            .get(client_idx)
            .ok_or_else(|| AppError::InternalError("no http client available".into()))?;
        let user_agent = self
            .user_agents
            .get(agent_idx)
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENT);

        let page = with_backoff(&self.retry, || {
            let request = self.apply_auth(
                client
                    .get(url.clone())
                    .header(reqwest::header::USER_AGENT, user_agent),
            );
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| transport_error(&e, "crawler fetch"))?;
                check_response(&response, "crawler fetch")?;

                let final_url = response.url().clone();
                let status = response.status().as_u16();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| transport_error(&e, "crawler fetch body"))?;

                Ok(FetchedPage {
                    url: final_url,
                    status,
                    content_type,
                    body,
                })
            }
        })
        .await?;

        Ok(page)
    }
}
