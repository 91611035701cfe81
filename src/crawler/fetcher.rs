//! Page fetcher with limiter-gated retries
//!
//! Every attempt goes through the rate limiter and, when a proxy pool is
//! configured, through the best proxy the pool currently offers. Each attempt
//! reports its outcome to both before the worker decides whether to retry.

use crate::config::ApiConfig;
use crate::crawler::api::{classify_response, ResponseClass};
use crate::limiter::RateLimiter;
use crate::proxy::{build_proxy_client, ProxyErrorKind, ProxyPool};
use crate::storage::ItemRecord;
use crate::HarvestError;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER};
use reqwest::{Client, ClientBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Final outcome of fetching one page
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// The page was fetched; the list may be empty
    Success(Vec<ItemRecord>),

    /// Still rate limited after every attempt
    RateLimited,

    /// Failure that retrying will not fix (missing login)
    Permanent(String),

    /// Still failing after every attempt for some other reason
    Transient(String),
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success(_))
    }

    /// Whether a later pass may still recover this page
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchResult::RateLimited | FetchResult::Transient(_))
    }
}

/// Attempt budget and backoff for one page
///
/// Backoff formulas are expressed in `unit`, which is one second in
/// production:
///
/// | Condition    | Sleep before next attempt          |
/// |--------------|------------------------------------|
/// | rate limited | `1 + 2^attempt + jitter` units     |
/// | other error  | `0.5 + attempt + jitter` units     |
///
/// `jitter` is uniform in `[0, 1)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(16) as i32);
        self.unit.mul_f64(1.0 + exp + jitter())
    }

    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        self.unit.mul_f64(0.5 + attempt as f64 + jitter())
    }
}

fn jitter() -> f64 {
    rand::thread_rng().gen::<f64>()
}

/// Fetches listing pages for one partition
pub struct FetchWorker {
    client: Client,
    headers: HeaderMap,
    user_agent: String,
    base_url: String,
    game: String,
    timeout: Duration,
    limiter: Arc<RateLimiter>,
    proxies: Option<Arc<ProxyPool>>,
    proxy_clients: Mutex<HashMap<String, Client>>,
    policy: RetryPolicy,
}

impl FetchWorker {
    /// Creates a worker with its own HTTP client
    ///
    /// # Arguments
    ///
    /// * `api` - Endpoint and request identity
    /// * `cookie` - Pre-joined `Cookie` header value, if any
    /// * `timeout` - Per-request timeout
    /// * `limiter` - Rate limiter gating every attempt
    /// * `proxies` - Optional proxy pool
    /// * `policy` - Attempt budget and backoff
    pub fn new(
        api: &ApiConfig,
        cookie: Option<&str>,
        timeout: Duration,
        limiter: Arc<RateLimiter>,
        proxies: Option<Arc<ProxyPool>>,
        policy: RetryPolicy,
    ) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_str(&api.referer)?);
        if let Some(cookie) = cookie {
            headers.insert(COOKIE, HeaderValue::from_str(cookie)?);
        }

        let client = client_builder(&api.user_agent, &headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            headers,
            user_agent: api.user_agent.clone(),
            base_url: api.base_url.clone(),
            game: api.game.clone(),
            timeout,
            limiter,
            proxies,
            proxy_clients: Mutex::new(HashMap::new()),
            policy,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetches one page, retrying rate limits and transient errors
    pub async fn fetch(&self, page: u32) -> FetchResult {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            let (class, proxy, elapsed) = {
                let _permit = self.limiter.acquire().await;
                // Picked after the gate so a long wait never lands on a proxy
                // that went unhealthy meanwhile
                let proxy = self.proxies.as_ref().and_then(|pool| pool.get_proxy());
                let client = match proxy.as_deref() {
                    Some(url) => self.proxy_client(url),
                    None => self.client.clone(),
                };
                let started = Instant::now();
                let class = self.request(&client, page).await;
                (class, proxy, started.elapsed())
            };

            self.report(&class, proxy.as_deref(), elapsed);

            match class {
                ResponseClass::Items(items) => {
                    tracing::debug!("Page {} returned {} items", page, items.len());
                    return FetchResult::Success(items);
                }
                ResponseClass::AuthRequired(msg) => {
                    tracing::error!("Page {} requires login, check the cookie file: {}", page, msg);
                    return FetchResult::Permanent(msg);
                }
                ResponseClass::RateLimited => {
                    if attempt == max_attempts {
                        tracing::warn!("Page {} still rate limited after {} attempts", page, attempt);
                        return FetchResult::RateLimited;
                    }
                    let wait = self.policy.rate_limit_backoff(attempt);
                    tracing::warn!(
                        "Page {} rate limited (attempt {}/{}), backing off {:?}",
                        page,
                        attempt,
                        max_attempts,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                ResponseClass::Failed { reason, .. } => {
                    if attempt == max_attempts {
                        tracing::warn!("Page {} failed after {} attempts: {}", page, attempt, reason);
                        return FetchResult::Transient(reason);
                    }
                    let wait = self.policy.transient_backoff(attempt);
                    tracing::debug!(
                        "Page {} attempt {}/{} failed: {}, retrying in {:?}",
                        page,
                        attempt,
                        max_attempts,
                        reason,
                        wait
                    );
                    last_reason = reason;
                    tokio::time::sleep(wait).await;
                }
            }
        }

        FetchResult::Transient(last_reason)
    }

    /// One HTTP round trip, classified
    async fn request(&self, client: &Client, page: u32) -> ResponseClass {
        let page_num = page.to_string();
        let result = client
            .get(&self.base_url)
            .query(&[
                ("game", self.game.as_str()),
                ("page_num", page_num.as_str()),
                ("use_suggestion", "0"),
            ])
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => return network_failure(e),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => classify_response(status, &body),
            Err(e) => network_failure(e),
        }
    }

    /// Feeds one attempt's outcome to the limiter and the proxy pool
    fn report(&self, class: &ResponseClass, proxy: Option<&str>, elapsed: Duration) {
        match class {
            ResponseClass::Items(_) => self.limiter.record_success(),
            ResponseClass::RateLimited => self.limiter.record_rate_limited(),
            ResponseClass::AuthRequired(_) | ResponseClass::Failed { .. } => {
                self.limiter.record_error()
            }
        }

        let (Some(pool), Some(url)) = (self.proxies.as_ref(), proxy) else {
            return;
        };
        match class {
            ResponseClass::Items(_) => pool.record_success(url, elapsed),
            ResponseClass::RateLimited => pool.record_error(url, ProxyErrorKind::RateLimited),
            ResponseClass::AuthRequired(_) => pool.record_error(url, ProxyErrorKind::AuthRequired),
            ResponseClass::Failed { kind, .. } => pool.record_error(url, *kind),
        }
    }

    /// Returns the cached client for a proxy, building it on first use
    ///
    /// Falls back to the direct client if the proxy URL cannot be used.
    fn proxy_client(&self, url: &str) -> Client {
        let mut clients = self
            .proxy_clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(url) {
            return client.clone();
        }

        let builder = client_builder(&self.user_agent, &self.headers);
        match build_proxy_client(builder, url, self.timeout) {
            Ok(client) => {
                clients.insert(url.to_string(), client.clone());
                client
            }
            Err(e) => {
                tracing::warn!("Could not use proxy {}: {} (going direct)", url, e);
                self.client.clone()
            }
        }
    }
}

fn client_builder(user_agent: &str, headers: &HeaderMap) -> ClientBuilder {
    Client::builder()
        .user_agent(user_agent)
        .default_headers(headers.clone())
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
}

fn network_failure(e: reqwest::Error) -> ResponseClass {
    if e.is_timeout() {
        ResponseClass::Failed {
            reason: "Request timeout".to_string(),
            kind: ProxyErrorKind::Timeout,
        }
    } else if e.is_connect() {
        ResponseClass::Failed {
            reason: format!("Connection failed: {}", e),
            kind: ProxyErrorKind::Connect,
        }
    } else {
        ResponseClass::Failed {
            reason: e.to_string(),
            kind: ProxyErrorKind::Other,
        }
    }
}
