//! Market-Harvest: an adaptive-concurrency marketplace crawler
//!
//! This crate crawls a paginated marketplace API under unpredictable
//! server-side rate limits and lands normalized item records in SQLite.
//! The pipeline is made of a proxy pool, an AIMD rate limiter, partitioned
//! fetch workers, a bounded ingest queue and a single batch writer.

pub mod config;
pub mod crawler;
pub mod limiter;
pub mod output;
pub mod pipeline;
pub mod proxy;
pub mod sources;
pub mod storage;

use thiserror::Error;

/// Main error type for Market-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid proxy URL {url}: {message}")]
    InvalidProxy { url: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("Ingest queue is closed")]
    QueueClosed,

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Market-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{run_harvest, FetchResult, HarvestReport};
pub use limiter::RateLimiter;
pub use pipeline::{BatchWriter, IngestQueue, QueueItem};
pub use proxy::ProxyPool;
pub use storage::ItemRecord;
