//! End-of-run summary

use crate::crawler::{HarvestReport, PageFailure};

/// Renders the operator-facing summary of one run
pub fn render_summary(report: &HarvestReport) -> String {
    let mut out = String::new();
    out.push_str("=== Harvest Summary ===\n\n");

    let requested = report.pages_requested();
    let failed = report.failed_pages();
    let count = |kind: PageFailure| failed.iter().filter(|(_, f)| *f == kind).count();

    out.push_str("Pages:\n");
    out.push_str(&format!("  Requested: {}\n", requested));
    out.push_str(&format!("  With items: {}\n", report.pages_ok()));
    out.push_str(&format!("  Empty: {}\n", report.pages_empty()));
    out.push_str(&format!(
        "  Failed: {} (rate limited {}, login required {}, other {})\n",
        failed.len(),
        count(PageFailure::RateLimited),
        count(PageFailure::Permanent),
        count(PageFailure::Transient)
    ));
    if let Some(retry) = &report.retry {
        out.push_str(&format!(
            "  Retry pass: {} of {} recovered\n",
            retry.recovered(),
            retry.attempted
        ));
    }
    if !failed.is_empty() {
        let pages: Vec<String> = failed.iter().take(20).map(|(p, _)| p.to_string()).collect();
        let more = if failed.len() > 20 { ", ..." } else { "" };
        out.push_str(&format!("  Failed pages: {}{}\n", pages.join(", "), more));
    }
    out.push('\n');

    let writer = &report.writer;
    out.push_str("Records:\n");
    out.push_str(&format!("  Enqueued: {}\n", report.items_enqueued()));
    out.push_str(&format!("  Written: {}\n", writer.records_written));
    out.push_str(&format!(
        "  Dropped: {} ({} by failed batches, {} refused by the queue)\n",
        writer.records_dropped + report.queue_dropped,
        writer.records_dropped,
        report.queue_dropped
    ));
    out.push_str(&format!(
        "  Batches: {} committed, {} failed\n",
        writer.batches_committed, writer.batches_failed
    ));
    if let Some(fatal) = &writer.fatal {
        out.push_str(&format!("  Writer failed to start: {}\n", fatal));
    }
    out.push('\n');

    out.push_str("Requests:\n");
    out.push_str(&format!("  Total: {}\n", report.total_requests()));
    out.push_str(&format!(
        "  Success rate: {:.1}%\n",
        report.request_success_rate() * 100.0
    ));
    out.push_str(&format!("  Rate-limit hits: {}\n", report.rate_limit_hits()));
    for (i, limiter) in report.limiters.iter().enumerate() {
        out.push_str(&format!(
            "  Limiter {}: concurrency {}, delay {:.2}s\n",
            i,
            limiter.current_concurrency,
            limiter.current_delay.as_secs_f64()
        ));
    }

    if !report.proxies.is_empty() {
        out.push_str("\nProxies:\n");
        for proxy in &report.proxies {
            out.push_str(&format!(
                "  {} {:<40} ok {:>5}  err {:>5}  rate {:>5.1}%  avg {:>6}ms\n",
                if proxy.is_healthy { "+" } else { "-" },
                proxy.url,
                proxy.success_count,
                proxy.error_count,
                proxy.success_rate * 100.0,
                proxy.avg_response_time.as_millis()
            ));
        }
    }

    out.push_str(&format!(
        "\nElapsed: {:.1}s\n",
        report.elapsed.as_secs_f64()
    ));
    out
}

/// Prints the summary to stdout
pub fn print_summary(report: &HarvestReport) {
    print!("{}", render_summary(report));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{PageRange, PageTally, PartitionReport};
    use crate::limiter::{RateLimiter, RateLimiterSettings};
    use crate::pipeline::WriterReport;
    use crate::proxy::ProxyPool;
    use std::time::Duration;

    #[test]
    fn test_summary_mentions_key_figures() {
        let limiter = RateLimiter::new(RateLimiterSettings::default());
        limiter.record_success();
        limiter.record_rate_limited();

        let pool = ProxyPool::new(["http://10.0.0.1:3128"]);
        pool.record_success("http://10.0.0.1:3128", Duration::from_millis(120));

        let report = HarvestReport {
            partitions: vec![PartitionReport {
                id: 0,
                range: PageRange { start: 1, end: 4 },
                pages: PageTally {
                    pages_ok: 2,
                    pages_empty: 1,
                    items_found: 40,
                    items_enqueued: 40,
                    failed: vec![(3, PageFailure::RateLimited)],
                },
            }],
            retry: None,
            writer: WriterReport {
                records_received: 40,
                records_written: 40,
                batches_committed: 1,
                ..WriterReport::default()
            },
            limiters: vec![limiter.snapshot()],
            proxies: pool.snapshot(),
            queue_dropped: 0,
            elapsed: Duration::from_secs(3),
        };

        let text = render_summary(&report);
        assert!(text.contains("Requested: 4"));
        assert!(text.contains("Failed: 1 (rate limited 1, login required 0, other 0)"));
        assert!(text.contains("Failed pages: 3"));
        assert!(text.contains("Written: 40"));
        assert!(text.contains("Success rate: 50.0%"));
        assert!(text.contains("Rate-limit hits: 1"));
        assert!(text.contains("Limiter 0: concurrency 3"));
        assert!(text.contains("http://10.0.0.1:3128"));
    }
}
