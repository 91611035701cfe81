//! Crawler module for listing-page fetching and orchestration
//!
//! This module contains the core harvesting logic, including:
//! - Upstream payload classification and item normalization
//! - Page fetching with limiter-gated retries
//! - Page-range partitioning
//! - Overall run coordination

mod api;
mod coordinator;
mod fetcher;
mod partition;

pub use api::normalize_item;
pub use coordinator::{run_harvest, Coordinator, HarvestReport};
pub use fetcher::{FetchResult, FetchWorker, RetryPolicy};
pub use partition::{
    partition_range, PageFailure, PageRange, PageTally, PartitionManager, PartitionReport,
    RetryReport, StaggerWindow,
};
