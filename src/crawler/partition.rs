//! Page-range partitioning and per-partition fetch loops
//!
//! The configured page range is split into contiguous partitions. Each
//! partition runs as its own task with its own fetch worker; pages inside a
//! partition are spawned with a small random stagger and throttled by the
//! worker's rate limiter.

use crate::crawler::fetcher::{FetchResult, FetchWorker};
use crate::pipeline::IngestSender;
use rand::Rng;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Inclusive range of page numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn pages(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn contains(&self, page: u32) -> bool {
        self.pages().contains(&page)
    }
}

/// Splits `start..=end` into at most `count` contiguous partitions
///
/// Each partition gets `floor(total / count)` pages and the first
/// `total % count` partitions get one extra. Partitions that would be empty
/// are not produced, so asking for more partitions than pages yields one
/// partition per page.
pub fn partition_range(start: u32, end: u32, count: u32) -> Vec<PageRange> {
    if end < start || count == 0 {
        return Vec::new();
    }

    // Widened so a range ending at u32::MAX cannot overflow
    let total = u64::from(end - start) + 1;
    let count = u64::from(count).min(total);
    let base = total / count;
    let remainder = total % count;

    let mut ranges = Vec::with_capacity(count as usize);
    let mut next = u64::from(start);
    for i in 0..count {
        let size = base + u64::from(i < remainder);
        let last = next + size - 1;
        ranges.push(PageRange {
            start: next as u32,
            end: last as u32,
        });
        next = last + 1;
    }
    ranges
}

/// Random pause between page task spawns
#[derive(Debug, Clone, Copy)]
pub struct StaggerWindow {
    pub min: Duration,
    pub max: Duration,
}

impl StaggerWindow {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms.max(min_ms)),
        }
    }

    pub fn none() -> Self {
        Self::new(0, 0)
    }

    fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Why a page ended without data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFailure {
    RateLimited,
    Permanent,
    Transient,
}

impl PageFailure {
    /// Whether another pass may still recover the page
    pub fn is_retryable(self) -> bool {
        !matches!(self, PageFailure::Permanent)
    }
}

/// Per-page outcome counts for one pass over a set of pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTally {
    pub pages_ok: u32,
    pub pages_empty: u32,
    pub items_found: u64,
    pub items_enqueued: u64,
    /// Failed pages in ascending order
    pub failed: Vec<(u32, PageFailure)>,
}

impl PageTally {
    pub fn pages_attempted(&self) -> u32 {
        self.pages_ok + self.pages_empty + self.failed.len() as u32
    }

    /// Failed pages another pass may still recover
    pub fn retryable_pages(&self) -> Vec<u32> {
        self.failed
            .iter()
            .filter(|(_, failure)| failure.is_retryable())
            .map(|(page, _)| *page)
            .collect()
    }

    fn record(&mut self, page: u32, outcome: PageOutcome) {
        match outcome {
            PageOutcome::Loaded { found, enqueued } => {
                self.pages_ok += 1;
                self.items_found += found as u64;
                self.items_enqueued += enqueued as u64;
            }
            PageOutcome::Empty => self.pages_empty += 1,
            PageOutcome::Failed(failure) => self.failed.push((page, failure)),
        }
    }

    fn merge(&mut self, other: PageTally) {
        self.pages_ok += other.pages_ok;
        self.pages_empty += other.pages_empty;
        self.items_found += other.items_found;
        self.items_enqueued += other.items_enqueued;
        self.failed.extend(other.failed);
        self.failed.sort_unstable_by_key(|(page, _)| *page);
    }
}

/// What one partition did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub id: usize,
    pub range: PageRange,
    pub pages: PageTally,
}

/// Result of the second pass over failed pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: u32,
    pub pages: PageTally,
}

impl RetryReport {
    pub fn recovered(&self) -> u32 {
        self.pages.pages_ok + self.pages.pages_empty
    }
}

#[derive(Debug, Clone, Copy)]
enum PageOutcome {
    Loaded { found: usize, enqueued: usize },
    Empty,
    Failed(PageFailure),
}

/// Fetches one page and hands its items to the ingest queue
async fn process_page(worker: &FetchWorker, sender: &IngestSender, page: u32) -> PageOutcome {
    match worker.fetch(page).await {
        FetchResult::Success(items) if items.is_empty() => {
            tracing::debug!("Page {} has no items", page);
            PageOutcome::Empty
        }
        FetchResult::Success(items) => {
            let found = items.len();
            let enqueued = sender.push_all(items).await;
            PageOutcome::Loaded { found, enqueued }
        }
        FetchResult::RateLimited => PageOutcome::Failed(PageFailure::RateLimited),
        FetchResult::Permanent(_) => PageOutcome::Failed(PageFailure::Permanent),
        FetchResult::Transient(_) => PageOutcome::Failed(PageFailure::Transient),
    }
}

/// Fetches every page of `pages` concurrently, staggering task spawns
///
/// A page task that panics is logged and counted as a transient failure.
async fn fetch_pages<I>(
    worker: Arc<FetchWorker>,
    sender: IngestSender,
    pages: I,
    stagger: StaggerWindow,
) -> PageTally
where
    I: IntoIterator<Item = u32>,
{
    let mut tasks = JoinSet::new();
    let mut outstanding = BTreeSet::new();

    for page in pages {
        let worker = worker.clone();
        let sender = sender.clone();
        outstanding.insert(page);
        tasks.spawn(async move {
            let outcome = process_page(&worker, &sender, page).await;
            (page, outcome)
        });

        let pause = stagger.sample();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    drop(sender);

    let mut tally = PageTally::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((page, outcome)) => {
                outstanding.remove(&page);
                tally.record(page, outcome);
            }
            Err(e) => tracing::error!("Page task failed: {}", e),
        }
    }

    // Whatever is left belongs to tasks that never returned
    for page in outstanding {
        tally.record(page, PageOutcome::Failed(PageFailure::Transient));
    }
    tally.failed.sort_unstable_by_key(|(page, _)| *page);
    tally
}

async fn run_partition(
    id: usize,
    range: PageRange,
    worker: Arc<FetchWorker>,
    sender: IngestSender,
    stagger: StaggerWindow,
) -> PartitionReport {
    tracing::info!(
        "Partition {} starting: pages {}-{} ({} pages)",
        id,
        range.start,
        range.end,
        range.page_count()
    );

    let pages = fetch_pages(worker, sender, range.pages(), stagger).await;

    tracing::info!(
        "Partition {} finished: {} ok, {} empty, {} failed, {} items enqueued",
        id,
        pages.pages_ok,
        pages.pages_empty,
        pages.failed.len(),
        pages.items_enqueued
    );

    PartitionReport { id, range, pages }
}

/// Runs the partitions of a page range side by side
pub struct PartitionManager {
    partitions: Vec<PageRange>,
    stagger: StaggerWindow,
}

impl PartitionManager {
    pub fn new(start: u32, end: u32, count: u32, stagger: StaggerWindow) -> Self {
        Self {
            partitions: partition_range(start, end, count),
            stagger,
        }
    }

    pub fn partitions(&self) -> &[PageRange] {
        &self.partitions
    }

    /// Runs every partition to completion
    ///
    /// Partition `i` uses `workers[i % workers.len()]`. Reports come back in
    /// partition order.
    pub async fn run(
        &self,
        workers: &[Arc<FetchWorker>],
        sender: &IngestSender,
    ) -> Vec<PartitionReport> {
        if workers.is_empty() {
            tracing::error!("No fetch workers available, nothing to crawl");
            return Vec::new();
        }

        let handles: Vec<_> = self
            .partitions
            .iter()
            .enumerate()
            .map(|(id, range)| {
                let worker = workers[id % workers.len()].clone();
                let handle = tokio::spawn(run_partition(
                    id,
                    *range,
                    worker,
                    sender.clone(),
                    self.stagger,
                ));
                (id, *range, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (id, range, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!("Partition {} aborted: {}", id, e);
                    let failed = range
                        .pages()
                        .map(|page| (page, PageFailure::Transient))
                        .collect();
                    reports.push(PartitionReport {
                        id,
                        range,
                        pages: PageTally {
                            failed,
                            ..PageTally::default()
                        },
                    });
                }
            }
        }
        reports
    }

    /// Fetches retryable failed pages once more, each with its own partition's worker
    ///
    /// Returns `None` when no page qualifies.
    pub async fn retry_failed(
        &self,
        reports: &[PartitionReport],
        workers: &[Arc<FetchWorker>],
        sender: &IngestSender,
    ) -> Option<RetryReport> {
        if workers.is_empty() {
            return None;
        }

        let mut tasks = JoinSet::new();
        let mut attempted = 0;
        for report in reports {
            let pages = report.pages.retryable_pages();
            if pages.is_empty() {
                continue;
            }
            attempted += pages.len() as u32;
            let worker = workers[report.id % workers.len()].clone();
            tasks.spawn(fetch_pages(worker, sender.clone(), pages, self.stagger));
        }

        if attempted == 0 {
            return None;
        }
        tracing::info!("Retrying {} failed pages", attempted);

        let mut retry = RetryReport {
            attempted,
            pages: PageTally::default(),
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tally) => retry.pages.merge(tally),
                Err(e) => tracing::error!("Retry task failed: {}", e),
            }
        }

        tracing::info!(
            "Retry pass recovered {} of {} pages",
            retry.recovered(),
            attempted
        );
        Some(retry)
    }
}
