//! Shared GET transport used by every provider adapter: auth header,
//! whole-call deadline, quota, global in-flight limit, retries and counters.

use super::rate_limit::{QuotaSnapshot, RateLimiter};
use super::retry::{classify_status, parse_retry_after, RetryPolicy, StatusClass};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::health::ProviderStats;
use anyhow::Context;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

/// Headers providers use to report how many calls are left on their side.
const REMAINING_HEADERS: &[&str] = &[
    "x-ratelimit-requests-remaining",
    "x-requests-available-minute",
    "x-requests-remaining",
];

const MAX_ERROR_BODY: usize = 200;

/// What came back from one HTTP attempt.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub remaining: Option<u64>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum SendFailure {
    Timeout,
    Connect(String),
}

/// Quota + retry + deadline wrapper around a single logical call.
pub struct CallPolicy {
    provider: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
    deadline: Duration,
    in_flight: Arc<Semaphore>,
    stats: Arc<ProviderStats>,
}

impl CallPolicy {
    pub fn new(
        provider: &str,
        limiter: RateLimiter,
        retry: RetryPolicy,
        deadline: Duration,
        in_flight: Arc<Semaphore>,
        stats: Arc<ProviderStats>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            limiter,
            retry,
            deadline,
            in_flight,
            stats,
        }
    }

    pub fn quota(&self) -> QuotaSnapshot {
        self.limiter.snapshot()
    }

    /// Run `send` until it succeeds, is rejected, or retries run out. Every
    /// attempt takes a quota slot. The deadline starts with the first attempt
    /// and covers the whole call, retries and backoff included.
    pub async fn run<F, Fut>(&self, mut send: F) -> Result<String, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RawResponse, SendFailure>>,
    {
        let mut deadline: Option<Instant> = None;
        let mut retry = 0u32;
        loop {
            let outcome = {
                let _permit = self.reserve(deadline).await?;
                let call_deadline = *deadline.get_or_insert_with(|| Instant::now() + self.deadline);
                self.stats.record_request();
                match tokio::time::timeout_at(call_deadline, send()).await {
                    Ok(result) => result,
                    Err(_) => Err(SendFailure::Timeout),
                }
            };

            let backoff = self.retry.delay_for(retry);
            let (failure, wait) = match outcome {
                Ok(resp) => {
                    self.stats.record_status(resp.status);
                    if let Some(remaining) = resp.remaining {
                        self.stats.set_reported_remaining(remaining);
                    }
                    match classify_status(resp.status) {
                        StatusClass::Success => return Ok(resp.body),
                        StatusClass::ClientError => {
                            let err = ProviderError::Rejected {
                                provider: self.provider.clone(),
                                status: resp.status,
                                body: truncate(&resp.body, MAX_ERROR_BODY),
                            };
                            self.stats.record_rejection(&err.to_string());
                            tracing::error!(provider = %self.provider, status = resp.status, "provider rejected request");
                            return Err(err);
                        }
                        StatusClass::RateLimited => {
                            let wait = resp
                                .retry_after
                                .as_deref()
                                .and_then(|v| parse_retry_after(v, Utc::now()))
                                .unwrap_or(backoff);
                            let failure = ProviderError::Transient {
                                provider: self.provider.clone(),
                                detail: "rate limited (429)".to_string(),
                            };
                            (failure, wait)
                        }
                        StatusClass::ServerError => {
                            let failure = ProviderError::Transient {
                                provider: self.provider.clone(),
                                detail: format!("server error ({})", resp.status),
                            };
                            (failure, backoff)
                        }
                    }
                }
                Err(SendFailure::Timeout) => {
                    self.stats.record_timeout();
                    let failure = ProviderError::Timeout {
                        provider: self.provider.clone(),
                    };
                    (failure, backoff)
                }
                Err(SendFailure::Connect(detail)) => {
                    self.stats.record_transport_error();
                    let failure = ProviderError::Transient {
                        provider: self.provider.clone(),
                        detail,
                    };
                    (failure, backoff)
                }
            };

            if retry >= self.retry.max_retries {
                tracing::warn!(provider = %self.provider, error = %failure, "provider call failed after retries");
                return Err(failure);
            }
            if deadline.is_some_and(|d| Instant::now() + wait >= d) {
                tracing::warn!(provider = %self.provider, error = %failure, "provider call deadline reached");
                return Err(failure);
            }
            tracing::debug!(
                provider = %self.provider,
                retry,
                wait_ms = wait.as_millis() as u64,
                error = %failure,
                "retrying provider call"
            );
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }

    /// Take an in-flight permit, then a rate slot while holding it, so the
    /// slot timestamp is the send time. The permit is released while waiting
    /// for the minute window to free up.
    async fn reserve(&self, deadline: Option<Instant>) -> Result<SemaphorePermit<'_>, ProviderError> {
        loop {
            let permit = self.in_flight.acquire().await.map_err(|_| ProviderError::Transient {
                provider: self.provider.clone(),
                detail: "in-flight limiter closed".to_string(),
            })?;
            let wake = match self.limiter.try_reserve() {
                Ok(None) => return Ok(permit),
                Ok(Some(wake)) => wake,
                Err(_) => {
                    self.stats.record_quota_exhausted();
                    return Err(ProviderError::QuotaExhausted {
                        provider: self.provider.clone(),
                    });
                }
            };
            drop(permit);
            if deadline.is_some_and(|d| wake >= d) {
                self.stats.record_timeout();
                return Err(ProviderError::Timeout {
                    provider: self.provider.clone(),
                });
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    pub fn record_malformed(&self, count: usize) {
        if count > 0 {
            self.stats.record_malformed(count as u64);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Parse a quota header that may be an integer or float (e.g. "14527.0").
fn parse_quota_header(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    REMAINING_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|v| v.max(0.0) as u64)
    })
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth_header: String,
    auth_value: String,
    policy: CallPolicy,
}

impl HttpTransport {
    pub fn new(
        config: &ProviderConfig,
        auth_value: String,
        in_flight: Arc<Semaphore>,
        stats: Arc<ProviderStats>,
    ) -> anyhow::Result<Self> {
        let deadline = Duration::from_secs(config.timeout_seconds.max(1));
        let client = Client::builder()
            .timeout(deadline)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .with_context(|| format!("failed to build HTTP client for {}", config.name))?;
        let policy = CallPolicy::new(
            &config.name,
            RateLimiter::new(config.requests_per_minute, config.requests_per_day),
            RetryPolicy::with_max_retries(config.max_retries),
            deadline,
            in_flight,
            stats,
        );
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: config.auth_header().to_string(),
            auth_value,
            policy,
        })
    }

    pub fn provider(&self) -> &str {
        &self.policy.provider
    }

    pub fn quota(&self) -> QuotaSnapshot {
        self.policy.quota()
    }

    pub fn record_malformed(&self, count: usize) {
        self.policy.record_malformed(count);
    }

    /// GET `path` and decode the body. A body that is not the expected JSON
    /// shape is `Malformed`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let body = self.policy.run(|| self.send_once(&url, query)).await?;
        serde_json::from_str(&body).map_err(|e| {
            self.policy.record_malformed(1);
            ProviderError::Malformed {
                provider: self.provider().to_string(),
                detail: e.to_string(),
            }
        })
    }

    async fn send_once(&self, url: &str, query: &[(&str, String)]) -> Result<RawResponse, SendFailure> {
        let resp = self
            .client
            .get(url)
            .header(self.auth_header.as_str(), self.auth_value.as_str())
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let remaining = parse_quota_header(resp.headers());
        let body = resp.text().await.map_err(classify_reqwest_error)?;
        Ok(RawResponse {
            status,
            retry_after,
            remaining,
            body,
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> SendFailure {
    if e.is_timeout() {
        SendFailure::Timeout
    } else {
        SendFailure::Connect(e.to_string())
    }
}
