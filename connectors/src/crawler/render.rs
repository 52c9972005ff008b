use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use common::error::AppError;

/// JS-rendering capability: URL in, rendered HTML out.
///
/// Two engines ship behind this seam; both are optional and the crawl loop
/// falls back to the raw fetch when rendering fails.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &Url) -> Result<String, AppError>;
}

/// Engine selection from connector settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum RenderEngine {
    /// Local headless Chrome over the DevTools protocol.
    Chrome,
    /// Remote rendering service (browserless-style POST endpoint).
    Remote { endpoint: String },
}

pub fn build_renderer(engine: &RenderEngine) -> Box<dyn PageRenderer> {
    match engine {
        RenderEngine::Chrome => Box::new(ChromeRenderer),
        RenderEngine::Remote { endpoint } => Box::new(RemoteRenderer {
            endpoint: endpoint.clone(),
            http: crate::retry::http_client(),
        }),
    }
}

pub struct ChromeRenderer;

#[async_trait]
impl PageRenderer for ChromeRenderer {
    async fn render(&self, url: &Url) -> Result<String, AppError> {
        let url = url.to_string();

        // The DevTools client is synchronous; keep it off the async runtime.
        tokio::task::spawn_blocking(move || -> Result<String, AppError> {
            let browser = {
                #[cfg(feature = "docker")]
                {
                    let options = headless_chrome::LaunchOptionsBuilder::default()
                        .sandbox(false)
                        .build()
                        .map_err(|e| AppError::InternalError(e.to_string()))?;
                    headless_chrome::Browser::new(options)
                        .map_err(|e| AppError::Transient(format!("chrome launch: {e}")))?
                }
                #[cfg(not(feature = "docker"))]
                {
                    headless_chrome::Browser::default()
                        .map_err(|e| AppError::Transient(format!("chrome launch: {e}")))?
                }
            };

            let tab = browser
                .new_tab()
                .map_err(|e| AppError::Transient(format!("chrome tab: {e}")))?;
            tab.navigate_to(&url)
                .map_err(|e| AppError::Transient(format!("chrome navigate: {e}")))?
                .wait_until_navigated()
                .map_err(|e| AppError::Transient(format!("chrome load: {e}")))?;
            tab.get_content()
                .map_err(|e| AppError::Transient(format!("chrome content: {e}")))
        })
        .await?
    }
}

pub struct RemoteRenderer {
    endpoint: String,
    http: reqwest::Client,
}

#[async_trait]
impl PageRenderer for RemoteRenderer {
    async fn render(&self, url: &Url) -> Result<String, AppError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "url": url.to_string() }))
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("remote render: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "remote render failed: HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::Transient(format!("remote render body: {e}")))
    }
}
