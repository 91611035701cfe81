//! Proxy pool implementation

use chrono::{DateTime, Utc};
use reqwest::Client;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Number of response-time samples kept per proxy
pub const MAX_RESPONSE_SAMPLES: usize = 20;

/// A proxy is demoted when its success rate drops below this value...
const UNHEALTHY_SUCCESS_RATE: f64 = 0.3;

/// ...and it has failed more than this many times.
const UNHEALTHY_MIN_ERRORS: u64 = 5;

/// Why a request through a proxy failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    RateLimited,
    Timeout,
    Connect,
    Status(u16),
    AuthRequired,
    Other,
}

impl fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::Timeout => write!(f, "timeout"),
            Self::Connect => write!(f, "connect error"),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::AuthRequired => write!(f, "authentication required"),
            Self::Other => write!(f, "other error"),
        }
    }
}

/// Health and performance record for one proxy endpoint
#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub url: String,
    pub success_count: u64,
    pub error_count: u64,
    pub last_used: Option<Instant>,
    pub is_healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    response_times: VecDeque<Duration>,
}

impl ProxyRecord {
    fn new(url: String) -> Self {
        Self {
            url,
            success_count: 0,
            error_count: 0,
            last_used: None,
            is_healthy: true,
            last_health_check: None,
            response_times: VecDeque::with_capacity(MAX_RESPONSE_SAMPLES),
        }
    }

    /// Fraction of successful requests; an unused proxy counts as fully successful
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Mean of the retained response-time samples (zero when there are none)
    pub fn avg_response_time(&self) -> Duration {
        if self.response_times.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.response_times.iter().sum();
        total / self.response_times.len() as u32
    }

    pub fn response_times(&self) -> impl Iterator<Item = &Duration> {
        self.response_times.iter()
    }

    fn push_response_time(&mut self, response_time: Duration) {
        if self.response_times.len() == MAX_RESPONSE_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(response_time);
    }

    /// Ordering used for selection: higher success rate wins, then lower latency
    fn rank(&self, other: &Self) -> Ordering {
        self.success_rate()
            .partial_cmp(&other.success_rate())
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.avg_response_time().cmp(&self.avg_response_time()))
    }
}

/// Point-in-time view of one proxy, for reporting
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyStats {
    pub url: String,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: f64,
    pub avg_response_time: Duration,
    pub is_healthy: bool,
}

/// Outcome of one health-check round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Pool of proxy endpoints
///
/// All record mutations go through one lock, so counter updates and the
/// health transition they trigger are observed together.
pub struct ProxyPool {
    records: Mutex<Vec<ProxyRecord>>,
}

impl ProxyPool {
    /// Creates a pool from a list of proxy URLs (duplicates are dropped)
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut records: Vec<ProxyRecord> = Vec::new();
        for url in urls {
            let url = url.into();
            if !records.iter().any(|r| r.url == url) {
                records.push(ProxyRecord::new(url));
            }
        }

        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProxyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.lock().iter().filter(|r| r.is_healthy).count()
    }

    /// Picks the healthy proxy with the best success rate, then lowest latency
    ///
    /// The proxy is not reserved; concurrent callers may receive the same one.
    pub fn get_proxy(&self) -> Option<String> {
        let mut records = self.lock();
        let best = records
            .iter_mut()
            .filter(|r| r.is_healthy)
            // first registered wins ties
            .max_by(|a, b| a.rank(b).then(Ordering::Greater))?;

        best.last_used = Some(Instant::now());
        Some(best.url.clone())
    }

    /// Records a successful request through `url`
    pub fn record_success(&self, url: &str, response_time: Duration) {
        let mut records = self.lock();
        if let Some(record) = records.iter_mut().find(|r| r.url == url) {
            record.success_count += 1;
            record.push_response_time(response_time);
        }
    }

    /// Records a failed request through `url`, demoting it if it keeps failing
    pub fn record_error(&self, url: &str, kind: ProxyErrorKind) {
        let mut records = self.lock();
        let Some(record) = records.iter_mut().find(|r| r.url == url) else {
            return;
        };

        record.error_count += 1;
        if record.is_healthy
            && record.success_rate() < UNHEALTHY_SUCCESS_RATE
            && record.error_count > UNHEALTHY_MIN_ERRORS
        {
            record.is_healthy = false;
            tracing::warn!(
                proxy = %record.url,
                "Proxy marked unhealthy after {} ({} ok / {} errors)",
                kind,
                record.success_count,
                record.error_count
            );
        } else {
            tracing::debug!(proxy = %record.url, "Proxy error: {}", kind);
        }
    }

    /// A passing probe restores the proxy with fresh counters
    fn record_probe_success(&self, url: &str, response_time: Duration) {
        let mut records = self.lock();
        if let Some(record) = records.iter_mut().find(|r| r.url == url) {
            if !record.is_healthy {
                tracing::info!(proxy = %record.url, "Proxy restored by health check");
            }
            record.is_healthy = true;
            record.success_count = 1;
            record.error_count = 0;
            record.push_response_time(response_time);
            record.last_health_check = Some(Utc::now());
        }
    }

    fn record_probe_failure(&self, url: &str, kind: ProxyErrorKind) {
        self.record_error(url, kind);
        let mut records = self.lock();
        if let Some(record) = records.iter_mut().find(|r| r.url == url) {
            record.last_health_check = Some(Utc::now());
        }
    }

    /// Probes every proxy with a lightweight GET to `probe_url`
    ///
    /// Probes run concurrently, so a round takes about one `timeout` however
    /// many proxies are dead. Probe failures are recorded against the proxy
    /// and never returned.
    pub async fn health_check(&self, probe_url: &str, timeout: Duration) -> HealthCheckSummary {
        let urls: Vec<String> = self.lock().iter().map(|r| r.url.clone()).collect();

        let mut probes = JoinSet::new();
        for url in urls {
            let probe_url = probe_url.to_string();
            probes.spawn(async move {
                let outcome = probe(&url, &probe_url, timeout).await;
                (url, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((url, Ok(elapsed))) => self.record_probe_success(&url, elapsed),
                Ok((url, Err(kind))) => self.record_probe_failure(&url, kind),
                Err(e) => tracing::warn!("Proxy probe task failed: {}", e),
            }
        }

        let records = self.lock();
        let healthy = records.iter().filter(|r| r.is_healthy).count();
        let summary = HealthCheckSummary {
            healthy,
            unhealthy: records.len() - healthy,
        };
        tracing::info!(
            "Proxy health check: {} healthy, {} unhealthy",
            summary.healthy,
            summary.unhealthy
        );
        summary
    }

    pub fn snapshot(&self) -> Vec<ProxyStats> {
        self.lock()
            .iter()
            .map(|r| ProxyStats {
                url: r.url.clone(),
                success_count: r.success_count,
                error_count: r.error_count,
                success_rate: r.success_rate(),
                avg_response_time: r.avg_response_time(),
                is_healthy: r.is_healthy,
            })
            .collect()
    }

    /// Returns a copy of the record for `url`
    pub fn record(&self, url: &str) -> Option<ProxyRecord> {
        self.lock().iter().find(|r| r.url == url).cloned()
    }
}

/// One GET to `probe_url` through `proxy_url`
async fn probe(
    proxy_url: &str,
    probe_url: &str,
    timeout: Duration,
) -> Result<Duration, ProxyErrorKind> {
    let started = Instant::now();
    let client = super::build_proxy_client(Client::builder(), proxy_url, timeout).map_err(|e| {
        tracing::debug!(proxy = %proxy_url, "Cannot build probe client: {}", e);
        ProxyErrorKind::Other
    })?;

    match client.get(probe_url).send().await {
        Ok(response) if response.status().is_success() => Ok(started.elapsed()),
        Ok(response) => Err(ProxyErrorKind::Status(response.status().as_u16())),
        Err(e) if e.is_timeout() => Err(ProxyErrorKind::Timeout),
        Err(e) if e.is_connect() => Err(ProxyErrorKind::Connect),
        Err(_) => Err(ProxyErrorKind::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const A: &str = "http://10.0.0.1:8080";
    const B: &str = "http://10.0.0.2:8080";
    const C: &str = "http://10.0.0.3:8080";

    #[test]
    fn test_empty_pool_returns_none() {
        let pool = ProxyPool::new(Vec::<String>::new());
        assert!(pool.is_empty());
        assert_eq!(pool.get_proxy(), None);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let pool = ProxyPool::new([A, A, B]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_prefers_higher_success_rate() {
        let pool = ProxyPool::new([A, B]);
        pool.record_success(A, Duration::from_millis(10));
        pool.record_error(A, ProxyErrorKind::Timeout);
        pool.record_success(B, Duration::from_millis(500));

        assert_eq!(pool.get_proxy().as_deref(), Some(B));
    }

    #[test]
    fn test_ties_broken_by_latency() {
        let pool = ProxyPool::new([A, B, C]);
        pool.record_success(A, Duration::from_millis(300));
        pool.record_success(B, Duration::from_millis(100));
        pool.record_success(C, Duration::from_millis(200));

        assert_eq!(pool.get_proxy().as_deref(), Some(B));
    }

    #[test]
    fn test_response_times_are_a_ring_buffer() {
        let pool = ProxyPool::new([A]);
        for ms in 0..25u64 {
            pool.record_success(A, Duration::from_millis(ms));
        }

        let record = pool.record(A).unwrap();
        let samples: Vec<_> = record.response_times().copied().collect();
        assert_eq!(samples.len(), MAX_RESPONSE_SAMPLES);
        assert_eq!(samples[0], Duration::from_millis(5));
        assert_eq!(samples[19], Duration::from_millis(24));
        assert_eq!(record.success_count, 25);
    }

    #[test]
    fn test_unhealthy_transition_needs_both_conditions() {
        let pool = ProxyPool::new([A]);

        // Five errors: success rate is 0 but error_count is not > 5 yet
        for _ in 0..5 {
            pool.record_error(A, ProxyErrorKind::Connect);
        }
        assert!(pool.record(A).unwrap().is_healthy);

        pool.record_error(A, ProxyErrorKind::Connect);
        assert!(!pool.record(A).unwrap().is_healthy);
        assert_eq!(pool.get_proxy(), None);
    }

    #[test]
    fn test_many_errors_with_good_rate_stay_healthy() {
        let pool = ProxyPool::new([A]);
        for _ in 0..30 {
            pool.record_success(A, Duration::from_millis(50));
        }
        for _ in 0..10 {
            pool.record_error(A, ProxyErrorKind::Status(502));
        }
        assert!(pool.record(A).unwrap().is_healthy);
    }

    #[test]
    fn test_unhealthy_is_sticky_without_probe() {
        let pool = ProxyPool::new([A, B]);
        for _ in 0..6 {
            pool.record_error(A, ProxyErrorKind::Timeout);
        }
        for _ in 0..100 {
            pool.record_success(A, Duration::from_millis(5));
        }

        assert!(!pool.record(A).unwrap().is_healthy);
        for _ in 0..10 {
            assert_eq!(pool.get_proxy().as_deref(), Some(B));
        }
    }

    #[test]
    fn test_unknown_proxy_is_ignored() {
        let pool = ProxyPool::new([A]);
        pool.record_success("http://unknown:1", Duration::from_millis(5));
        pool.record_error("http://unknown:1", ProxyErrorKind::Other);
        assert_eq!(pool.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_restores_and_demotes() {
        // The mock server doubles as a forward proxy: it answers any request.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let good = server.uri();
        let bad = "http://127.0.0.1:1".to_string();
        let pool = ProxyPool::new([good.clone(), bad.clone()]);

        for _ in 0..6 {
            pool.record_error(&good, ProxyErrorKind::Timeout);
            pool.record_error(&bad, ProxyErrorKind::Timeout);
        }
        assert_eq!(pool.healthy_count(), 0);

        let summary = pool
            .health_check("http://probe.invalid/ping", Duration::from_secs(2))
            .await;

        assert_eq!(summary, HealthCheckSummary { healthy: 1, unhealthy: 1 });
        let restored = pool.record(&good).unwrap();
        assert!(restored.is_healthy);
        assert_eq!(restored.error_count, 0);
        assert!(restored.last_health_check.is_some());

        let still_bad = pool.record(&bad).unwrap();
        assert!(!still_bad.is_healthy);
        assert_eq!(still_bad.error_count, 7);
        assert!(still_bad.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_health_check_probes_concurrently() {
        let mut urls = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..3 {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
                .mount(&server)
                .await;
            urls.push(server.uri());
            servers.push(server);
        }
        let pool = ProxyPool::new(urls);

        let started = Instant::now();
        let summary = pool
            .health_check("http://probe.invalid/ping", Duration::from_secs(5))
            .await;

        assert_eq!(summary, HealthCheckSummary { healthy: 3, unhealthy: 0 });
        // One at a time would take at least 1.5s
        assert!(started.elapsed() < Duration::from_millis(1200));
    }
}
