//! Per-domain request throttling + bounded HTTP fetch for detail pages.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::info_span;

use vef_core::urls::host_of;

pub const CRATE_NAME: &str = "vef-fetch";

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("url has no resolvable host: {0}")]
    InvalidUrl(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Minimum delay still owed before the next request to a host, given the
/// configured interval and the time elapsed since the last request there.
pub fn required_delay(min_interval: Duration, elapsed_since_last: Option<Duration>) -> Duration {
    match elapsed_since_last {
        Some(elapsed) => min_interval.saturating_sub(elapsed),
        None => Duration::ZERO,
    }
}

/// Per-host minimum-interval limiter. Holds last-request instants per host;
/// requests to distinct hosts never delay each other. One instance is shared
/// across all sequential fetches of a pipeline run; tests construct their
/// own instance to keep clocks isolated.
#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl Default for RequestThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

impl RequestThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep as needed so that two requests to this URL's host are at least
    /// `min_interval` apart.
    pub async fn wait_if_needed(&self, url: &str) -> Result<(), FetchError> {
        let host = host_of(url).ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

        let delay = {
            let last = self.last_request.lock().await;
            let elapsed = last
                .get(&host)
                .map(|prev| Instant::now().saturating_duration_since(*prev));
            required_delay(self.min_interval, elapsed)
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut last = self.last_request.lock().await;
        last.insert(host, Instant::now());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Something that can fetch a detail page. The enrichment stage depends on
/// this seam so tests can substitute canned pages and injected failures.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Real HTTP fetcher: bounded timeout, retry on transient failures with
/// capped exponential backoff. Throttling is the caller's job.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn fetch_once_or_retry(&self, url: &str) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::InvalidUrl(url.to_string())),
        }
    }
}

#[async_trait]
impl DetailFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("detail_fetch", url);
        let _guard = span.enter();
        self.fetch_once_or_retry(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_delay_owes_remainder_of_interval() {
        let interval = Duration::from_secs(2);
        assert_eq!(required_delay(interval, None), Duration::ZERO);
        assert_eq!(
            required_delay(interval, Some(Duration::from_millis(500))),
            Duration::from_millis(1500)
        );
        assert_eq!(
            required_delay(interval, Some(Duration::from_secs(3))),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_host_requests_are_spaced_apart() {
        let throttle = RequestThrottle::new(Duration::from_secs(2));
        let started = Instant::now();

        throttle
            .wait_if_needed("https://example.org/event/1")
            .await
            .unwrap();
        throttle
            .wait_if_needed("https://example.org/event/2")
            .await
            .unwrap();

        // paused clock only advances through sleeps
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_hosts_never_block_each_other() {
        let throttle = RequestThrottle::new(Duration::from_secs(2));
        let started = Instant::now();

        throttle
            .wait_if_needed("https://example.org/event/1")
            .await
            .unwrap();
        throttle
            .wait_if_needed("https://other.example.net/event/1")
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn hostless_url_is_rejected() {
        let throttle = RequestThrottle::default();
        let err = throttle.wait_if_needed("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
