//! Record storage + polite HTTP fetch utilities for traitsync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use traitsync_core::config::{DEFAULT_MIN_DELAY, DEFAULT_USER_AGENT, FETCH_TIMEOUT};
use traitsync_core::SourceRecord;
use url::Url;

mod postgres;
mod robots;
mod store;

pub use postgres::PgRecordStore;
pub use robots::RobotsPolicy;
pub use store::{
    DeletePredicate, MemoryRecordStore, OrderKey, RecordStore, StoreError, TraitFilter, TraitOrder,
};

pub const CRATE_NAME: &str = "traitsync-storage";

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

/// Caller-side retry schedule for [`PoliteFetcher::fetch_with_retry`].
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
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
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub min_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: FETCH_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_delay: DEFAULT_MIN_DELAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{url} is disallowed by robots policy")]
    Disallowed { url: String },
    #[error("rate limited by {host}; minimum delay raised to {min_delay:?}")]
    RateLimited { host: String, min_delay: Duration },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::RateLimited { .. } => RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Request(err) => classify_reqwest_error(err),
            Self::InvalidUrl { .. } | Self::Disallowed { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Lifecycle of one host inside the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    Uninitialized,
    PolicyLoaded { conservative: bool },
    Ready,
}

#[derive(Debug)]
struct LimiterState {
    min_delay: Duration,
    last_slot: HashMap<String, Instant>,
}

/// Robots-aware, rate-limited fetcher for direct page access.
///
/// All hosts share one limiter lock, so the minimum interval holds for every
/// concurrent caller. Throttling responses double the delay for the rest of the
/// process lifetime. Each host's robots document loads at most once, outside
/// the map lock.
pub struct PoliteFetcher {
    client: reqwest::Client,
    user_agent: String,
    policies: Mutex<HashMap<String, Arc<OnceCell<RobotsPolicy>>>>,
    limiter: Mutex<LimiterState>,
    ledger: Option<Arc<dyn RecordStore>>,
    ledger_tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for PoliteFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoliteFetcher")
            .field("user_agent", &self.user_agent)
            .field("has_ledger", &self.ledger.is_some())
            .finish()
    }
}

struct Target {
    url: Url,
    host: String,
    origin: String,
}

fn parse_target(raw: &str) -> Result<Target, FetchError> {
    let url = Url::parse(raw).map_err(|err| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    let Some(host) = url.host_str() else {
        return Err(FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "url has no host".to_string(),
        });
    };
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let origin = url.origin().ascii_serialization();
    Ok(Target { url, host, origin })
}

impl PoliteFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            user_agent: config.user_agent,
            policies: Mutex::new(HashMap::new()),
            limiter: Mutex::new(LimiterState {
                min_delay: config.min_delay,
                last_slot: HashMap::new(),
            }),
            ledger: None,
            ledger_tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Record last-fetched timestamps for each origin in `store`.
    pub fn with_ledger(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.ledger = Some(store);
        self
    }

    /// Seed the policy cache for `host` (`name` or `name:port`).
    pub async fn with_policy(self, host: &str, policy: RobotsPolicy) -> Self {
        self.policies
            .lock()
            .await
            .insert(host.to_string(), Arc::new(OnceCell::new_with(Some(policy))));
        self
    }

    pub async fn min_delay(&self) -> Duration {
        self.limiter.lock().await.min_delay
    }

    pub async fn phase(&self, url: &str) -> Result<HostPhase, FetchError> {
        let target = parse_target(url)?;
        let cell = self.policies.lock().await.get(&target.host).cloned();
        let Some(policy) = cell.as_deref().and_then(OnceCell::get) else {
            return Ok(HostPhase::Uninitialized);
        };
        let conservative = policy.is_conservative();
        if self.limiter.lock().await.last_slot.contains_key(&target.host) {
            Ok(HostPhase::Ready)
        } else {
            Ok(HostPhase::PolicyLoaded { conservative })
        }
    }

    pub async fn is_allowed(&self, url: &str) -> Result<bool, FetchError> {
        let target = parse_target(url)?;
        let policy = self.policy_for(&target).await;
        Ok(policy.is_allowed(target.url.as_str(), &self.user_agent))
    }

    /// Crawl delay the host's policy asks for, if any.
    pub async fn crawl_delay(&self, url: &str) -> Result<Option<Duration>, FetchError> {
        let target = parse_target(url)?;
        Ok(self.policy_for(&target).await.crawl_delay(&self.user_agent))
    }

    async fn policy_for(&self, target: &Target) -> RobotsPolicy {
        let cell = {
            let mut policies = self.policies.lock().await;
            policies.entry(target.host.clone()).or_default().clone()
        };
        cell.get_or_init(|| self.load_policy(target)).await.clone()
    }

    async fn load_policy(&self, target: &Target) -> RobotsPolicy {
        let robots_url = format!("{}/robots.txt", target.origin);
        match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => RobotsPolicy::parse(&body),
                Err(err) => {
                    warn!(%robots_url, error = %err, "reading robots.txt failed; denying all paths");
                    RobotsPolicy::conservative()
                }
            },
            Ok(resp) => {
                warn!(%robots_url, status = resp.status().as_u16(), "robots.txt unavailable; denying all paths");
                RobotsPolicy::conservative()
            }
            Err(err) => {
                warn!(%robots_url, error = %err, "fetching robots.txt failed; denying all paths");
                RobotsPolicy::conservative()
            }
        }
    }

    /// Reserve the next request slot for `host` and sleep until it opens.
    async fn wait_for_slot(&self, host: &str, crawl_delay: Option<Duration>) {
        let slot = {
            let mut state = self.limiter.lock().await;
            let delay = state.min_delay.max(crawl_delay.unwrap_or_default());
            let now = Instant::now();
            let slot = match state.last_slot.get(host) {
                Some(previous) => (*previous + delay).max(now),
                None => now,
            };
            state.last_slot.insert(host.to_string(), slot);
            slot
        };
        if slot > Instant::now() {
            debug!(host, wait = ?(slot - Instant::now()), "rate limiting");
        }
        tokio::time::sleep_until(slot).await;
    }

    async fn escalate_backoff(&self) -> Duration {
        let mut state = self.limiter.lock().await;
        state.min_delay = state.min_delay.saturating_mul(2);
        state.min_delay
    }

    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let target = parse_target(url)?;
        let policy = self.policy_for(&target).await;
        if !policy.is_allowed(target.url.as_str(), &self.user_agent) {
            return Err(FetchError::Disallowed {
                url: url.to_string(),
            });
        }

        self.wait_for_slot(&target.host, policy.crawl_delay(&self.user_agent))
            .await;

        let span = info_span!("polite_fetch", host = %target.host, url);
        let resp = self
            .client
            .get(target.url.clone())
            .send()
            .instrument(span.clone())
            .await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let min_delay = self.escalate_backoff().await;
            span.in_scope(|| warn!(?min_delay, "server throttled request; backing off"));
            return Err(FetchError::RateLimited {
                host: target.host,
                min_delay,
            });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.text().instrument(span).await?;
        self.record_visit(target.origin).await;
        Ok(body)
    }

    /// [`Self::fetch`] with caller-side retries for retryable failures.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        backoff: &BackoffPolicy,
    ) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch(url).await {
                Ok(body) => return Ok(body),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(url, attempt, ?delay, error = %err, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_visit(&self, origin: String) {
        let Some(store) = self.ledger.clone() else {
            return;
        };
        let source = SourceRecord {
            url: origin,
            last_scraped_at: Utc::now(),
        };
        let mut tasks = self.ledger_tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(err) = store.upsert_source(&source).await {
                warn!(url = %source.url, error = %err, "recording last scraped time failed");
            }
        });
    }

    /// Waits for pending last-scraped writes. Call before the runtime shuts down.
    pub async fn flush(&self) {
        let mut tasks = std::mem::take(&mut *self.ledger_tasks.lock().await);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "last scraped write task failed");
            }
        }
    }
}
