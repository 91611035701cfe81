use serde::Deserialize;
use std::time::Duration;

/// Default marketplace goods endpoint
pub const DEFAULT_API_URL: &str = "https://buff.163.com/api/market/goods";

/// Default browser user agent sent with every request
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

/// Main configuration structure for Market-Harvest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default, rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

/// Page range, partitioning and retry behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlConfig {
    /// First page to fetch (1-based)
    pub start_page: u32,

    /// Number of pages to fetch starting at `start_page`
    pub max_pages: u32,

    /// Number of independent partitions the page range is split into
    pub partitions: u32,

    /// Attempts per page before giving up
    pub max_retries: u32,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Capacity of the ingest queue between fetchers and the writer
    pub queue_capacity: usize,

    /// Records per transactional batch
    pub batch_size: usize,

    /// Lower bound of the random delay between task spawns (milliseconds)
    pub stagger_min_ms: u64,

    /// Upper bound of the random delay between task spawns (milliseconds)
    pub stagger_max_ms: u64,

    /// Time unit the retry backoff formulas are expressed in (milliseconds)
    pub backoff_unit_ms: u64,

    /// Fetch rate-limited and transient pages once more after the main pass
    pub retry_failed_pages: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: 2000,
            partitions: 5,
            max_retries: 3,
            request_timeout_secs: 30,
            queue_capacity: 10_000,
            batch_size: 200,
            stagger_min_ms: 10,
            stagger_max_ms: 200,
            backoff_unit_ms: 1000,
            retry_failed_pages: true,
        }
    }
}

impl CrawlConfig {
    /// Last page of the configured range (inclusive)
    pub fn end_page(&self) -> u32 {
        self.start_page
            .saturating_add(self.max_pages.saturating_sub(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

/// Adaptive rate limiter bounds and factors
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub min_concurrency: u32,
    pub initial_concurrency: u32,
    pub max_concurrency: u32,

    /// Upper bound on the per-acquire delay (seconds)
    pub max_delay_secs: f64,

    /// Multiplier applied to concurrency on a rate-limit signal
    pub backoff_factor: f64,

    /// Multiplier applied to concurrency after a run of successes
    pub recovery_factor: f64,

    /// Consecutive successes needed before concurrency grows
    pub recovery_threshold: u32,

    /// One limiter for the whole process instead of one per partition
    pub shared: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            initial_concurrency: 6,
            max_concurrency: 12,
            max_delay_secs: 10.0,
            backoff_factor: 0.5,
            recovery_factor: 1.5,
            recovery_threshold: 10,
            shared: true,
        }
    }
}

impl RateLimitConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs.max(0.0))
    }
}

/// Upstream API endpoint and request identity
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiConfig {
    pub base_url: String,
    pub game: String,
    pub user_agent: String,
    pub referer: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            game: "csgo".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: "https://buff.163.com/market/csgo".to_string(),
        }
    }
}

/// Cookie and proxy inputs
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SourcesConfig {
    /// File with one `key=value` cookie per line
    pub cookie_file: Option<String>,

    /// File with one proxy URL per line
    pub proxy_file: Option<String>,

    /// URL fetched through each proxy by the health probe
    pub health_check_url: Option<String>,

    /// Interval between background health probes (seconds)
    pub health_check_interval_secs: Option<u64>,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    pub database_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            database_path: "./market.db".to_string(),
        }
    }
}

/// Feature toggles
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FeatureFlags {
    pub enable_price_history: bool,
    pub enable_proxy_pool: bool,
    pub enable_rate_limiting: bool,

    /// Run the whole pipeline but discard records instead of writing them
    pub no_db: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_price_history: true,
            enable_proxy_pool: false,
            enable_rate_limiting: true,
            no_db: false,
        }
    }
}
