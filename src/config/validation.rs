use crate::config::types::{ApiConfig, Config, CrawlConfig, RateLimitConfig, SourcesConfig};
use crate::ConfigError;
use url::Url;

/// Largest accepted per-acquire delay (one hour)
const MAX_DELAY_CEILING_SECS: f64 = 3600.0;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawl_config(&config.crawl)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_api_config(&config.api)?;
    validate_sources_config(&config.sources)?;

    if !config.features.no_db && config.output.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates page range and pipeline sizing
fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    if config.start_page < 1 {
        return Err(ConfigError::Validation(format!(
            "start_page must be >= 1, got {}",
            config.start_page
        )));
    }

    if config.max_pages < 1 {
        return Err(ConfigError::Validation(format!(
            "max_pages must be >= 1, got {}",
            config.max_pages
        )));
    }

    if config.start_page.checked_add(config.max_pages - 1).is_none() {
        return Err(ConfigError::Validation(format!(
            "page range starting at {} with {} pages runs past page {}",
            config.start_page,
            config.max_pages,
            u32::MAX
        )));
    }

    if config.partitions < 1 {
        return Err(ConfigError::Validation(format!(
            "partitions must be >= 1, got {}",
            config.partitions
        )));
    }

    if config.max_retries < 1 {
        return Err(ConfigError::Validation(format!(
            "max_retries must be >= 1, got {}",
            config.max_retries
        )));
    }

    if config.queue_capacity < 1 {
        return Err(ConfigError::Validation(
            "queue_capacity must be >= 1".to_string(),
        ));
    }

    if config.batch_size < 1 {
        return Err(ConfigError::Validation("batch_size must be >= 1".to_string()));
    }

    if config.stagger_min_ms > config.stagger_max_ms {
        return Err(ConfigError::Validation(format!(
            "stagger_min_ms ({}) must not exceed stagger_max_ms ({})",
            config.stagger_min_ms, config.stagger_max_ms
        )));
    }

    Ok(())
}

/// Validates concurrency bounds and AIMD factors
fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.min_concurrency < 1 {
        return Err(ConfigError::Validation(format!(
            "min_concurrency must be >= 1, got {}",
            config.min_concurrency
        )));
    }

    if config.min_concurrency > config.initial_concurrency
        || config.initial_concurrency > config.max_concurrency
    {
        return Err(ConfigError::Validation(format!(
            "concurrency bounds must satisfy min <= initial <= max, got {} / {} / {}",
            config.min_concurrency, config.initial_concurrency, config.max_concurrency
        )));
    }

    if !(config.backoff_factor > 0.0 && config.backoff_factor < 1.0) {
        return Err(ConfigError::Validation(format!(
            "backoff_factor must be in (0, 1), got {}",
            config.backoff_factor
        )));
    }

    if !(config.recovery_factor > 1.0) {
        return Err(ConfigError::Validation(format!(
            "recovery_factor must be > 1, got {}",
            config.recovery_factor
        )));
    }

    if config.recovery_threshold < 1 {
        return Err(ConfigError::Validation(
            "recovery_threshold must be >= 1".to_string(),
        ));
    }

    if !(0.0..=MAX_DELAY_CEILING_SECS).contains(&config.max_delay_secs) {
        return Err(ConfigError::Validation(format!(
            "max_delay_secs must be between 0 and {}, got {}",
            MAX_DELAY_CEILING_SECS, config.max_delay_secs
        )));
    }

    Ok(())
}

fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;

    if config.game.is_empty() {
        return Err(ConfigError::Validation("game cannot be empty".to_string()));
    }

    Ok(())
}

fn validate_sources_config(config: &SourcesConfig) -> Result<(), ConfigError> {
    if let Some(probe) = &config.health_check_url {
        Url::parse(probe)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid health_check_url: {}", e)))?;
    }

    if config.health_check_interval_secs == Some(0) {
        return Err(ConfigError::Validation(
            "health_check_interval_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}
