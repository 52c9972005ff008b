use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::jitter;
use tracing::{debug, warn};

use common::error::AppError;

/// Deadline applied to every provider request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared client constructor so every connector carries the same deadline.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Outcome classification for one provider call.
#[derive(Debug)]
pub enum ProviderError {
    /// 5xx, timeout, rate limit. Retried with backoff; `retry_after` wins
    /// over the computed delay when the provider supplies one.
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// 401. Surfaced so the connector can refresh once and retry itself.
    AuthExpired(String),
    /// Remaining 4xx. Never retried; the item is skipped and the job continues.
    Permanent(String),
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient { message, .. } => AppError::Transient(message),
            ProviderError::AuthExpired(message) => AppError::AuthExpired(message),
            ProviderError::Permanent(message) => AppError::Permanent(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential delay for a zero-based attempt number.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt.min(16));
        let raw = self.base_delay.saturating_mul(exp).min(self.max_delay);
        jitter(raw)
    }
}

/// Run a provider call with exponential backoff on transient failures.
///
/// `Retry-After` from the provider overrides the computed delay. Auth and
/// permanent errors pass straight through; refresh and skip decisions belong
/// to the caller.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0_u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ProviderError::Transient {
                message,
                retry_after,
            }) => {
                let next_attempt = attempt.saturating_add(1);
                if next_attempt >= policy.max_attempts {
                    warn!(attempts = next_attempt, %message, "giving up after transient failures");
                    return Err(AppError::Transient(message));
                }

                let delay = retry_after
                    .map_or_else(|| policy.delay_for(attempt), |ra| ra.max(policy.delay_for(attempt)));
                debug!(
                    attempt = next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "transient provider error; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt = next_attempt;
            }
            Err(other) => return Err(other.into()),
        }
    }
}

/// Classify an HTTP response status plus headers into a provider outcome.
pub fn classify_response(status: u16, retry_after_header: Option<&str>, context: &str) -> Option<ProviderError> {
    match status {
        200..=299 => None,
        401 => Some(ProviderError::AuthExpired(format!("{context}: HTTP 401"))),
        429 => Some(ProviderError::Transient {
            message: format!("{context}: HTTP 429"),
            retry_after: parse_retry_after(retry_after_header),
        }),
        500..=599 => Some(ProviderError::Transient {
            message: format!("{context}: HTTP {status}"),
            retry_after: parse_retry_after(retry_after_header),
        }),
        _ => Some(ProviderError::Permanent(format!("{context}: HTTP {status}"))),
    }
}

fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Shortcut for reqwest results: network errors are transient, statuses go
/// through `classify_response`.
pub fn check_response(
    response: &reqwest::Response,
    context: &str,
) -> Result<(), ProviderError> {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match classify_response(response.status().as_u16(), retry_after.as_deref(), context) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

pub fn transport_error(err: &reqwest::Error, context: &str) -> ProviderError {
    ProviderError::Transient {
        message: format!("{context}: {err}"),
        retry_after: None,
    }
}
