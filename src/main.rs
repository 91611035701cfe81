//! Market-Harvest main entry point
//!
//! This is the command-line interface for the Market-Harvest crawler.

use clap::Parser;
use market_harvest::config::{load_config_with_hash, validate, Config};
use market_harvest::crawler::{run_harvest, Coordinator};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Market-Harvest: an adaptive-concurrency marketplace crawler
///
/// Market-Harvest walks the paginated goods listing of a marketplace API,
/// backs off when the server rate-limits it, and stores every item with its
/// price history in SQLite.
#[derive(Parser, Debug)]
#[command(name = "market-harvest")]
#[command(version = "1.0.0")]
#[command(about = "An adaptive-concurrency marketplace crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Override the number of pages to fetch
    #[arg(long, value_name = "N")]
    max_pages: Option<u32>,

    /// Override the number of partitions
    #[arg(long, value_name = "N")]
    partitions: Option<u32>,

    /// Crawl without writing to the database
    #[arg(long)]
    no_db: bool,

    /// Validate config and show the crawl plan without fetching anything
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, _config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    apply_overrides(&mut config, &cli);
    validate(&config)?;

    if cli.dry_run {
        handle_dry_run(config)?;
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_harvest(config).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("market_harvest=info,warn"),
            1 => EnvFilter::new("market_harvest=debug,info"),
            2 => EnvFilter::new("market_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(max_pages) = cli.max_pages {
        config.crawl.max_pages = max_pages;
    }
    if let Some(partitions) = cli.partitions {
        config.crawl.partitions = partitions;
    }
    if cli.no_db {
        config.features.no_db = true;
    }
}

/// Handles the --dry-run mode: validates config and shows the crawl plan
fn handle_dry_run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Market-Harvest Dry Run ===\n");

    println!("API:");
    println!("  Endpoint: {}", config.api.base_url);
    println!("  Game: {}", config.api.game);

    println!("\nCrawl:");
    println!(
        "  Pages: {}-{} ({} pages)",
        config.crawl.start_page,
        config.crawl.end_page(),
        config.crawl.max_pages
    );
    println!("  Attempts per page: {}", config.crawl.max_retries);
    println!("  Request timeout: {}s", config.crawl.request_timeout_secs);
    println!(
        "  Batch size: {} (queue capacity {})",
        config.crawl.batch_size, config.crawl.queue_capacity
    );
    println!(
        "  Retry failed pages: {}",
        if config.crawl.retry_failed_pages { "yes" } else { "no" }
    );

    let rl = &config.rate_limit;
    println!("\nRate Limiting:");
    if config.features.enable_rate_limiting {
        println!(
            "  Concurrency: {} (min {}, max {})",
            rl.initial_concurrency, rl.min_concurrency, rl.max_concurrency
        );
        println!(
            "  Backoff x{}, recovery x{} after {} successes, max delay {}s",
            rl.backoff_factor, rl.recovery_factor, rl.recovery_threshold, rl.max_delay_secs
        );
        println!(
            "  Limiter: {}",
            if rl.shared { "shared" } else { "per partition" }
        );
    } else {
        println!("  Fixed concurrency: {}", rl.initial_concurrency);
    }

    println!("\nOutput:");
    if config.features.no_db {
        println!("  Database: disabled");
    } else {
        println!("  Database: {}", config.output.database_path);
        println!(
            "  Price history: {}",
            if config.features.enable_price_history { "yes" } else { "no" }
        );
    }

    println!("\nProxies:");
    match (
        config.features.enable_proxy_pool,
        config.sources.proxy_file.as_deref(),
    ) {
        (true, Some(path)) => println!("  Proxy file: {}", path),
        (true, None) => println!("  Enabled but no proxy file configured"),
        (false, _) => println!("  Disabled"),
    }

    let coordinator = Coordinator::new(config)?;
    let partitions = coordinator.partitions();
    println!("\nPartitions ({}):", partitions.len());
    for (id, range) in partitions.iter().enumerate() {
        println!(
            "  {:>3}: pages {:>6}-{:<6} ({} pages)",
            id,
            range.start,
            range.end,
            range.page_count()
        );
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    use market_harvest::output::{load_statistics, print_statistics};

    println!("Database: {}\n", config.output.database_path);
    let stats = load_statistics(Path::new(&config.output.database_path))?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main harvest operation
async fn handle_harvest(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    use market_harvest::output::print_summary;

    match run_harvest(config).await {
        Ok(report) => {
            print_summary(&report);
            if let Some(fatal) = &report.writer.fatal {
                tracing::error!("Harvest finished without storage: {}", fatal);
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("Harvest failed: {}", e);
            Err(e.into())
        }
    }
}
