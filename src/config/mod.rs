//! Configuration module for Market-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! The crawl pipeline only ever sees the resolved [`Config`] value.
//!
//! # Example
//!
//! ```no_run
//! use market_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Crawling {} pages", config.crawl.max_pages);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    ApiConfig, Config, CrawlConfig, FeatureFlags, OutputConfig, RateLimitConfig, SourcesConfig,
    DEFAULT_API_URL, DEFAULT_USER_AGENT,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
