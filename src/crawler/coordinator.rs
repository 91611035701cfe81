//! Harvest coordinator - main orchestration logic
//!
//! This module wires the pieces of one run together:
//! - Loading cookies and proxies
//! - Building rate limiters and one fetch worker per partition
//! - Starting the batch writer and the proxy health loop
//! - Running the partitions and the failed-page retry pass
//! - Closing the ingest queue and collecting the final report

use crate::config::{validate, Config};
use crate::crawler::fetcher::{FetchWorker, RetryPolicy};
use crate::crawler::partition::{
    PageFailure, PageRange, PartitionManager, PartitionReport, RetryReport, StaggerWindow,
};
use crate::limiter::{RateLimiter, RateLimiterSettings, RateLimiterSnapshot};
use crate::pipeline::{spawn_writer, IngestQueue, WriterReport};
use crate::proxy::{ProxyPool, ProxyStats};
use crate::sources::{cookie_header, load_cookie_file, load_proxy_file};
use crate::storage::{open_storage, DiscardStore};
use crate::HarvestError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Everything one run did, merged from partitions, writer, limiters and proxies
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub partitions: Vec<PartitionReport>,
    pub retry: Option<RetryReport>,
    pub writer: WriterReport,
    /// One snapshot per distinct limiter
    pub limiters: Vec<RateLimiterSnapshot>,
    pub proxies: Vec<ProxyStats>,
    /// Records the ingest queue refused because the writer was gone
    pub queue_dropped: u64,
    pub elapsed: Duration,
}

impl HarvestReport {
    pub fn pages_requested(&self) -> u32 {
        self.partitions.iter().map(|p| p.range.page_count()).sum()
    }

    /// Pages that returned data, including those recovered by the retry pass
    pub fn pages_ok(&self) -> u32 {
        let main: u32 = self.partitions.iter().map(|p| p.pages.pages_ok).sum();
        main + self.retry.as_ref().map_or(0, |r| r.pages.pages_ok)
    }

    pub fn pages_empty(&self) -> u32 {
        let main: u32 = self.partitions.iter().map(|p| p.pages.pages_empty).sum();
        main + self.retry.as_ref().map_or(0, |r| r.pages.pages_empty)
    }

    pub fn items_enqueued(&self) -> u64 {
        let main: u64 = self.partitions.iter().map(|p| p.pages.items_enqueued).sum();
        main + self.retry.as_ref().map_or(0, |r| r.pages.items_enqueued)
    }

    /// Pages that ended the run without data, in ascending order
    pub fn failed_pages(&self) -> Vec<(u32, PageFailure)> {
        let mut failed: Vec<(u32, PageFailure)> = match &self.retry {
            // Retryable failures were fetched again; their final state is in the retry tally
            Some(retry) => self
                .partitions
                .iter()
                .flat_map(|p| p.pages.failed.iter().copied())
                .filter(|(_, failure)| !failure.is_retryable())
                .chain(retry.pages.failed.iter().copied())
                .collect(),
            None => self
                .partitions
                .iter()
                .flat_map(|p| p.pages.failed.iter().copied())
                .collect(),
        };
        failed.sort_unstable_by_key(|(page, _)| *page);
        failed
    }

    pub fn total_requests(&self) -> u64 {
        self.limiters.iter().map(|l| l.total_requests).sum()
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.limiters.iter().map(|l| l.rate_limit_count).sum()
    }

    /// Fraction of all reported request attempts that succeeded
    pub fn request_success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        let successes: u64 = self.limiters.iter().map(|l| l.successes).sum();
        successes as f64 / total as f64
    }
}

/// Main harvest coordinator structure
pub struct Coordinator {
    config: Config,
    manager: PartitionManager,
    limiters: Vec<Arc<RateLimiter>>,
    workers: Vec<Arc<FetchWorker>>,
    proxies: Option<Arc<ProxyPool>>,
}

impl Coordinator {
    /// Creates a coordinator for one run
    ///
    /// # Arguments
    ///
    /// * `config` - Resolved configuration, validated here
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Workers and limiters are ready
    /// * `Err(HarvestError)` - Invalid configuration or HTTP client setup failed
    pub fn new(config: Config) -> Result<Self, HarvestError> {
        validate(&config)?;

        let crawl = &config.crawl;
        let manager = PartitionManager::new(
            crawl.start_page,
            crawl.end_page(),
            crawl.partitions,
            StaggerWindow::new(crawl.stagger_min_ms, crawl.stagger_max_ms),
        );

        let cookies = config
            .sources
            .cookie_file
            .as_deref()
            .map(|path| load_cookie_file(Path::new(path)))
            .unwrap_or_default();
        if cookies.is_empty() {
            tracing::warn!("No cookies loaded, the API may answer with Login Required");
        }
        let cookie = cookie_header(&cookies);

        let proxies = build_proxy_pool(&config);

        let settings = RateLimiterSettings::from_config(
            &config.rate_limit,
            config.features.enable_rate_limiting,
        );
        let limiter_count = if config.rate_limit.shared {
            1
        } else {
            manager.partitions().len().max(1)
        };
        let limiters: Vec<Arc<RateLimiter>> = (0..limiter_count)
            .map(|_| Arc::new(RateLimiter::new(settings.clone())))
            .collect();

        let policy = RetryPolicy {
            max_attempts: crawl.max_retries,
            unit: crawl.backoff_unit(),
        };

        let workers = (0..manager.partitions().len())
            .map(|id| {
                FetchWorker::new(
                    &config.api,
                    cookie.as_deref(),
                    crawl.request_timeout(),
                    limiters[id % limiters.len()].clone(),
                    proxies.clone(),
                    policy.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            manager,
            limiters,
            workers,
            proxies,
        })
    }

    pub fn partitions(&self) -> &[PageRange] {
        self.manager.partitions()
    }

    /// Runs the harvest to completion
    ///
    /// Per-page and per-batch failures are counted in the report, never
    /// returned as errors.
    pub async fn run(self) -> Result<HarvestReport, HarvestError> {
        let started = Instant::now();
        let crawl = &self.config.crawl;
        tracing::info!(
            "Harvesting pages {}-{} of '{}' in {} partitions",
            crawl.start_page,
            crawl.end_page(),
            self.config.api.game,
            self.manager.partitions().len()
        );

        let health = self.start_health_checks().await;

        let (sender, receiver) = IngestQueue::bounded(crawl.queue_capacity);
        let writer = if self.config.features.no_db {
            tracing::info!("Database output disabled, records will be discarded");
            spawn_writer(|| Ok(DiscardStore::default()), crawl.batch_size, receiver)
        } else {
            let path = PathBuf::from(&self.config.output.database_path);
            let history = self.config.features.enable_price_history;
            spawn_writer(
                move || open_storage(&path, history),
                crawl.batch_size,
                receiver,
            )
        };

        let partitions = self.manager.run(&self.workers, &sender).await;

        let retry = if crawl.retry_failed_pages {
            self.manager
                .retry_failed(&partitions, &self.workers, &sender)
                .await
        } else {
            None
        };

        if let Some(health) = health {
            health.stop().await;
        }

        let queue_dropped = sender.dropped();
        if let Err(e) = sender.finish().await {
            tracing::error!("Could not signal end of stream to the writer: {}", e);
        }
        let writer = writer.await?;

        let report = HarvestReport {
            partitions,
            retry,
            writer,
            limiters: self.limiters.iter().map(|l| l.snapshot()).collect(),
            proxies: self
                .proxies
                .as_ref()
                .map(|pool| pool.snapshot())
                .unwrap_or_default(),
            queue_dropped,
            elapsed: started.elapsed(),
        };

        tracing::info!(
            "Harvest complete: {}/{} pages ok, {} items enqueued, {} written in {:.1}s",
            report.pages_ok() + report.pages_empty(),
            report.pages_requested(),
            report.items_enqueued(),
            report.writer.records_written,
            report.elapsed.as_secs_f64()
        );

        Ok(report)
    }

    /// Runs the startup probe and spawns the periodic one, when configured
    async fn start_health_checks(&self) -> Option<HealthLoop> {
        let pool = self.proxies.clone()?;
        let probe_url = self.config.sources.health_check_url.clone()?;
        let timeout = self.config.crawl.request_timeout();

        pool.health_check(&probe_url, timeout).await;

        let interval = self.config.sources.health_check_interval_secs?;
        Some(HealthLoop::spawn(
            pool,
            probe_url,
            Duration::from_secs(interval),
            timeout,
        ))
    }
}

fn build_proxy_pool(config: &Config) -> Option<Arc<ProxyPool>> {
    if !config.features.enable_proxy_pool {
        return None;
    }

    let Some(path) = config.sources.proxy_file.as_deref() else {
        tracing::warn!("Proxy pool enabled but no proxy file configured, going direct");
        return None;
    };

    let pool = ProxyPool::new(load_proxy_file(Path::new(path)));
    if pool.is_empty() {
        tracing::warn!("Proxy file {} has no proxies, going direct", path);
        return None;
    }

    tracing::info!("Proxy pool ready with {} proxies", pool.len());
    Some(Arc::new(pool))
}

/// Background task that re-probes every proxy on a fixed interval
struct HealthLoop {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthLoop {
    fn spawn(pool: Arc<ProxyPool>, probe_url: String, every: Duration, timeout: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately and the startup probe already ran
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        pool.health_check(&probe_url, timeout).await;
                    }
                }
            }
            tracing::debug!("Proxy health loop stopped");
        });
        Self { stop, handle }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            tracing::error!("Proxy health loop failed: {}", e);
        }
    }
}

/// Runs a complete harvest with the given configuration
pub async fn run_harvest(config: Config) -> Result<HarvestReport, HarvestError> {
    Coordinator::new(config)?.run().await
}
