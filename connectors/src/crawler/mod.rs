pub mod extract;
pub mod fetch;
pub mod render;
pub mod robots;
pub mod sitemap;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use common::{error::AppError, storage::types::source_connector::SourceType};

use crate::{Connector, DocumentStream, SourceDocument};

use self::extract::{extract_links, extract_readable};
use self::fetch::{CrawlerAuth, HttpFetcher, PageFetcher};
use self::render::{build_renderer, PageRenderer, RenderEngine};
use self::robots::RobotsTxt;
use self::sitemap::{parse_sitemap, same_origin, sitemap_url};

fn default_max_depth() -> usize {
    3
}

fn default_max_pages() -> usize {
    50
}

fn default_min_content_length() -> usize {
    100
}

fn default_include_pdfs() -> bool {
    true
}

fn default_rate_limit_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerSettings {
    pub start_url: String,
    /// Paths crawled before the breadth-first queue (e.g. `/docs/`, `/protocols/`).
    #[serde(default)]
    pub priority_paths: Vec<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
    #[serde(default = "default_include_pdfs")]
    pub include_pdfs: bool,
    /// Polite delay between requests to the same host.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default)]
    pub respect_robots: bool,
    #[serde(default)]
    pub use_sitemap: bool,
    #[serde(default)]
    pub render: Option<RenderEngine>,
    #[serde(default)]
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub auth: CrawlerAuth,
}

/// Everything one crawl produced, including the visited set for diagnostics.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub documents: Vec<SourceDocument>,
    pub visited_urls: HashSet<String>,
    pub pages_crawled: usize,
    pub pages_skipped: usize,
}

/// Same-origin breadth-first crawler with a priority queue for configured
/// paths, readable-content extraction, and optional robots/sitemap/JS-render
/// support.
pub struct WebCrawlerConnector {
    settings: CrawlerSettings,
    fetcher: Arc<dyn PageFetcher>,
    /// Kept alongside the trait object for the form-login step; absent when a
    /// custom fetcher is injected.
    login_fetcher: Option<Arc<HttpFetcher>>,
    renderer: Option<Arc<dyn PageRenderer>>,
    user_agent_label: String,
}

impl WebCrawlerConnector {
    pub fn new(settings: Value) -> Result<Self, AppError> {
        let settings: CrawlerSettings = serde_json::from_value(settings)
            .map_err(|e| AppError::Config(format!("crawler settings: {e}")))?;

        let fetcher = Arc::new(HttpFetcher::new(
            settings.user_agents.clone(),
            settings.proxies.clone(),
            settings.auth.clone(),
        )?);
        let renderer = settings
            .render
            .as_ref()
            .map(|engine| Arc::from(build_renderer(engine)));
        let user_agent_label = settings
            .user_agents
            .first()
            .cloned()
            .unwrap_or_else(|| "knowledge-transfer-crawler".to_string());

        Ok(Self {
            settings,
            fetcher: Arc::clone(&fetcher) as Arc<dyn PageFetcher>,
            login_fetcher: Some(fetcher),
            renderer,
            user_agent_label,
        })
    }

    /// Swap the network seam; used by tests and by callers that already hold
    /// a shared fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = fetcher;
        self.login_fetcher = None;
        self
    }

    fn start_url(&self) -> Result<Url, AppError> {
        let raw = self.settings.start_url.trim();
        let candidate = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };
        Url::parse(&candidate)
            .map_err(|_| AppError::Config(format!("invalid start_url: {raw:?}")))
    }

    /// Fetch robots.txt for the origin; per-crawl, never cached globally.
    async fn load_robots(&self, origin: &Url) -> Option<RobotsTxt> {
        if !self.settings.respect_robots {
            return None;
        }
        let robots_url = origin.join("/robots.txt").ok()?;
        match self.fetcher.fetch(&robots_url).await {
            Ok(page) if page.status == 200 => {
                Some(RobotsTxt::parse(&page.text(), &self.user_agent_label))
            }
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "robots.txt unavailable; crawling without it");
                None
            }
        }
    }

    async fn page_html(&self, url: &Url, raw_html: String) -> String {
        let Some(renderer) = &self.renderer else {
            return raw_html;
        };
        match renderer.render(url).await {
            Ok(rendered) if !rendered.trim().is_empty() => rendered,
            Ok(_) => raw_html,
            Err(err) => {
                warn!(url = %url, error = %err, "JS rendering failed; using raw fetch");
                raw_html
            }
        }
    }

    /// Run the breadth-first crawl to completion.
    pub async fn crawl(&self) -> Result<CrawlOutcome, AppError> {
        let start = self.start_url()?;
        let origin = {
            let mut origin = start.clone();
            origin.set_path("/");
            origin.set_query(None);
            origin.set_fragment(None);
            origin
        };

        let robots = self.load_robots(&origin).await;
        let polite_delay = robots
            .as_ref()
            .and_then(RobotsTxt::crawl_delay)
            .unwrap_or(Duration::from_millis(self.settings.rate_limit_delay_ms));

        // Two queues: configured priority paths drain first, then the normal
        // breadth-first queue.
        let mut priority_queue: VecDeque<(Url, usize)> = VecDeque::new();
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();

        for path in &self.settings.priority_paths {
            if let Ok(url) = start.join(path) {
                priority_queue.push_back((url, 1));
            }
        }
        if self.settings.use_sitemap {
            if let Some(sitemap) = sitemap_url(&origin) {
                if let Ok(page) = self.fetcher.fetch(&sitemap).await {
                    let urls = parse_sitemap(&page.text(), &origin);
                    info!(urls = urls.len(), "sitemap discovered");
                    for url in urls {
                        priority_queue.push_back((url, 1));
                    }
                }
            }
        }
        queue.push_back((start.clone(), 0));

        let mut outcome = CrawlOutcome::default();
        let mut first_fetch = true;

        while outcome.pages_crawled < self.settings.max_pages {
            let Some((url, depth)) = priority_queue.pop_front().or_else(|| queue.pop_front())
            else {
                break;
            };

            let url_key = url.to_string();
            if outcome.visited_urls.contains(&url_key) {
                continue;
            }
            if let Some(robots) = &robots {
                if !robots.is_allowed(url.path()) {
                    debug!(url = %url_key, "disallowed by robots.txt");
                    continue;
                }
            }

            if !first_fetch && !polite_delay.is_zero() {
                tokio::time::sleep(polite_delay).await;
            }
            first_fetch = false;

            outcome.visited_urls.insert(url_key.clone());
            let page = match self.fetcher.fetch(&url).await {
                Ok(page) => page,
                Err(AppError::Permanent(message)) => {
                    debug!(url = %url_key, %message, "page fetch failed; skipping");
                    outcome.pages_skipped = outcome.pages_skipped.saturating_add(1);
                    continue;
                }
                Err(err) => {
                    warn!(url = %url_key, error = %err, "page fetch errored; skipping");
                    outcome.pages_skipped = outcome.pages_skipped.saturating_add(1);
                    continue;
                }
            };
            outcome.pages_crawled = outcome.pages_crawled.saturating_add(1);

            if page.is_pdf() {
                if self.settings.include_pdfs {
                    outcome.documents.push(SourceDocument {
                        external_id: url_key.clone(),
                        source: SourceType::WebCrawler,
                        title: url.path().to_string(),
                        content: String::new(),
                        bytes: Some(page.body.clone()),
                        filename: Some(
                            url.path_segments()
                                .and_then(|mut s| s.next_back())
                                .unwrap_or("document.pdf")
                                .to_string(),
                        ),
                        doc_type: "pdf".to_string(),
                        author: None,
                        timestamp: Some(Utc::now()),
                        metadata: json!({"url": url_key, "depth": depth}),
                    });
                }
                continue;
            }
            if !page.is_html() {
                debug!(url = %url_key, content_type = %page.content_type, "unsupported content type");
                continue;
            }

            let html = self.page_html(&url, page.text()).await;
            let extracted = extract_readable(&html, &url);

            if extracted.text.chars().count() >= self.settings.min_content_length {
                outcome.documents.push(SourceDocument {
                    external_id: url_key.clone(),
                    source: SourceType::WebCrawler,
                    title: extracted.title,
                    content: extracted.text,
                    bytes: None,
                    filename: None,
                    doc_type: "webpage".to_string(),
                    author: None,
                    timestamp: Some(Utc::now()),
                    metadata: json!({"url": url_key, "depth": depth}),
                });
            } else {
                debug!(
                    url = %url_key,
                    chars = extracted.text.chars().count(),
                    "below min content length; skipped"
                );
                outcome.pages_skipped = outcome.pages_skipped.saturating_add(1);
            }

            // Frontier expansion happens for every fetched page, even thin ones.
            if depth < self.settings.max_depth {
                for link in extract_links(&html, &url) {
                    if same_origin(&link, &origin)
                        && !outcome.visited_urls.contains(link.as_str())
                    {
                        queue.push_back((link, depth.saturating_add(1)));
                    }
                }
            }
        }

        info!(
            pages = outcome.pages_crawled,
            documents = outcome.documents.len(),
            skipped = outcome.pages_skipped,
            visited = outcome.visited_urls.len(),
            "crawl complete"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl Connector for WebCrawlerConnector {
    fn source(&self) -> SourceType {
        SourceType::WebCrawler
    }

    async fn connect(&mut self) -> Result<(), AppError> {
        let start = self.start_url()?;
        if let Some(fetcher) = &self.login_fetcher {
            fetcher.login().await?;
        }
        let page = self.fetcher.fetch(&start).await?;
        if page.status >= 400 {
            return Err(AppError::Permanent(format!(
                "start_url returned HTTP {}",
                page.status
            )));
        }
        Ok(())
    }

    async fn test(&self) -> bool {
        match self.start_url() {
            Ok(url) => self.fetcher.fetch(&url).await.is_ok(),
            Err(_) => false,
        }
    }

    fn sync(&self, _since: Option<DateTime<Utc>>) -> DocumentStream<'_> {
        // Web content has no reliable change cursor; every sync re-crawls and
        // the content hash downstream keeps unchanged pages from reprocessing.
        Box::pin(try_stream! {
            let outcome = self.crawl().await?;
            for document in outcome.documents {
                yield document;
            }
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Option<SourceDocument>, AppError> {
        let Ok(url) = Url::parse(external_id) else {
            return Ok(None);
        };
        let page = self.fetcher.fetch(&url).await?;
        if !page.is_html() {
            return Ok(None);
        }
        let extracted = extract_readable(&page.text(), &url);
        Ok(Some(SourceDocument {
            external_id: external_id.to_string(),
            source: SourceType::WebCrawler,
            title: extracted.title,
            content: extracted.text,
            bytes: None,
            filename: None,
            doc_type: "webpage".to_string(),
            author: None,
            timestamp: Some(Utc::now()),
            metadata: json!({"url": external_id}),
        }))
    }

    async fn disconnect(&mut self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::fetch::FetchedPage;
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory site; records the order of fetches.
    struct StubFetcher {
        pages: HashMap<String, (String, String)>, // url -> (content_type, body)
        log: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn new(pages: &[(&str, &str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(url, ct, body)| {
                        ((*url).to_string(), ((*ct).to_string(), (*body).to_string()))
                    })
                    .collect(),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, url: &Url) -> Result<FetchedPage, AppError> {
            if let Ok(mut log) = self.log.lock() {
                log.push(url.to_string());
            }
            let Some((content_type, body)) = self.pages.get(url.as_str()) else {
                return Err(AppError::Permanent(format!("crawler fetch: HTTP 404 {url}")));
            };
            Ok(FetchedPage {
                url: url.clone(),
                status: 200,
                content_type: content_type.clone(),
                body: Bytes::from(body.clone()),
            })
        }
    }

    fn settings(json: Value) -> CrawlerSettings {
        serde_json::from_value(json).expect("settings")
    }

    fn connector(settings_json: Value, fetcher: StubFetcher) -> WebCrawlerConnector {
        WebCrawlerConnector {
            settings: settings(settings_json),
            fetcher: Arc::new(fetcher),
            login_fetcher: None,
            renderer: None,
            user_agent_label: "test-crawler".to_string(),
        }
    }

    fn page_with(body_len: usize, links: &str) -> String {
        let filler = "content ".repeat(body_len / 8 + 1);
        format!(
            "<html><head><title>Page</title></head><body><main><p>{}</p></main>{links}</body></html>",
            &filler[..body_len]
        )
    }

    #[tokio::test]
    async fn min_content_filter_and_visited_tracking() {
        // Index (~800 chars) links to /a (50 chars) and /b (500 chars).
        let index = page_with(
            800,
            r#"<a href="/a">a</a><a href="/b">b</a>"#,
        );
        let a = page_with(50, "");
        let b = page_with(500, "");

        let fetcher = StubFetcher::new(&[
            ("https://example.test/", "text/html", index.as_str()),
            ("https://example.test/a", "text/html", a.as_str()),
            ("https://example.test/b", "text/html", b.as_str()),
        ]);
        let crawler = connector(
            json!({
                "start_url": "https://example.test/",
                "max_depth": 1,
                "max_pages": 3,
                "min_content_length": 100,
                "rate_limit_delay_ms": 0
            }),
            fetcher,
        );

        let outcome = crawler.crawl().await.expect("crawl");
        assert_eq!(outcome.visited_urls.len(), 3);
        assert_eq!(outcome.pages_crawled, 3);
        assert_eq!(outcome.documents.len(), 2, "the 50-char page is filtered out");

        let ids: Vec<_> = outcome
            .documents
            .iter()
            .map(|d| d.external_id.as_str())
            .collect();
        assert!(ids.contains(&"https://example.test/"));
        assert!(ids.contains(&"https://example.test/b"));
    }

    #[tokio::test]
    async fn max_pages_bounds_the_crawl() {
        let index = page_with(300, r#"<a href="/p1">1</a><a href="/p2">2</a><a href="/p3">3</a>"#);
        let child = page_with(300, "");

        let fetcher = StubFetcher::new(&[
            ("https://example.test/", "text/html", index.as_str()),
            ("https://example.test/p1", "text/html", child.as_str()),
            ("https://example.test/p2", "text/html", child.as_str()),
            ("https://example.test/p3", "text/html", child.as_str()),
        ]);
        let crawler = connector(
            json!({
                "start_url": "https://example.test/",
                "max_pages": 2,
                "rate_limit_delay_ms": 0
            }),
            fetcher,
        );

        let outcome = crawler.crawl().await.expect("crawl");
        assert_eq!(outcome.pages_crawled, 2);
    }

    #[tokio::test]
    async fn priority_paths_are_crawled_first() {
        let index = page_with(300, "");
        let docs = page_with(300, "");

        let fetcher = StubFetcher::new(&[
            ("https://example.test/", "text/html", index.as_str()),
            ("https://example.test/docs/", "text/html", docs.as_str()),
        ]);

        // With the page budget capped at one, only the priority path is
        // fetched; the start URL never gets its turn.
        let crawler = connector(
            json!({
                "start_url": "https://example.test/",
                "priority_paths": ["/docs/"],
                "max_pages": 1,
                "rate_limit_delay_ms": 0
            }),
            fetcher,
        );

        let outcome = crawler.crawl().await.expect("crawl");
        assert_eq!(outcome.pages_crawled, 1);
        assert!(outcome.visited_urls.contains("https://example.test/docs/"));
        assert!(!outcome.visited_urls.contains("https://example.test/"));
    }

    #[tokio::test]
    async fn robots_disallow_is_respected_when_configured() {
        let robots = "User-agent: *\nDisallow: /private/\n";
        let index = page_with(300, r#"<a href="/private/x">secret</a><a href="/open">open</a>"#);
        let open = page_with(300, "");
        let private = page_with(300, "");

        let fetcher = StubFetcher::new(&[
            ("https://example.test/robots.txt", "text/plain", robots),
            ("https://example.test/", "text/html", index.as_str()),
            ("https://example.test/open", "text/html", open.as_str()),
            ("https://example.test/private/x", "text/html", private.as_str()),
        ]);
        let crawler = connector(
            json!({
                "start_url": "https://example.test/",
                "respect_robots": true,
                "rate_limit_delay_ms": 0
            }),
            fetcher,
        );

        let outcome = crawler.crawl().await.expect("crawl");
        assert!(!outcome.visited_urls.contains("https://example.test/private/x"));
        assert!(outcome.visited_urls.contains("https://example.test/open"));
    }

    #[tokio::test]
    async fn external_links_and_cycles_are_ignored() {
        let index = page_with(
            300,
            r#"<a href="https://elsewhere.test/x">ext</a><a href="/loop">loop</a>"#,
        );
        let looping = page_with(300, r#"<a href="/">back</a><a href="/loop">self</a>"#);

        let fetcher = StubFetcher::new(&[
            ("https://example.test/", "text/html", index.as_str()),
            ("https://example.test/loop", "text/html", looping.as_str()),
        ]);
        let crawler = connector(
            json!({
                "start_url": "https://example.test/",
                "rate_limit_delay_ms": 0
            }),
            fetcher,
        );

        let outcome = crawler.crawl().await.expect("crawl");
        assert_eq!(outcome.pages_crawled, 2);
        assert!(outcome.visited_urls.iter().all(|u| u.starts_with("https://example.test/")));
    }

    #[tokio::test]
    async fn pdf_pages_are_emitted_as_bytes_for_the_parser() {
        let index = page_with(300, r#"<a href="/paper.pdf">paper</a>"#);

        let fetcher = StubFetcher::new(&[
            ("https://example.test/", "text/html", index.as_str()),
            ("https://example.test/paper.pdf", "application/pdf", "%PDF-1.7 fake"),
        ]);
        let crawler = connector(
            json!({
                "start_url": "https://example.test/",
                "rate_limit_delay_ms": 0
            }),
            fetcher,
        );

        let outcome = crawler.crawl().await.expect("crawl");
        let pdf = outcome
            .documents
            .iter()
            .find(|d| d.doc_type == "pdf")
            .expect("pdf document");
        assert!(pdf.bytes.is_some());
        assert_eq!(pdf.filename.as_deref(), Some("paper.pdf"));
    }
}
