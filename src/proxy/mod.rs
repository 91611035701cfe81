//! Proxy pool with health and latency tracking
//!
//! The pool picks the best-performing healthy proxy for each request and
//! demotes proxies that keep failing. Demotion is sticky: only an explicit
//! health probe brings a proxy back.

mod pool;

pub use pool::{HealthCheckSummary, ProxyErrorKind, ProxyPool, ProxyRecord, ProxyStats};

use crate::HarvestError;
use reqwest::{Client, ClientBuilder, Proxy};
use std::time::Duration;

/// Builds an HTTP client that routes every request through `proxy_url`
///
/// The caller supplies a builder already carrying its default headers so the
/// proxied client sends the same identity as the direct one.
pub fn build_proxy_client(
    builder: ClientBuilder,
    proxy_url: &str,
    timeout: Duration,
) -> Result<Client, HarvestError> {
    let proxy = Proxy::all(proxy_url).map_err(|e| HarvestError::InvalidProxy {
        url: proxy_url.to_string(),
        message: e.to_string(),
    })?;

    Ok(builder.proxy(proxy).timeout(timeout).build()?)
}
