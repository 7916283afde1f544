//! Request counters, latency moving averages, and Prometheus exposition.
//!
//! Counters and averages update with atomic compare-exchange loops; exact
//! sample-accurate values are not required. Latency averages are
//! exponentially weighted at 9/10 old, 1/10 new.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::store::StoreStats;

pub struct Metrics {
    pub requests: AtomicU64,
    pub searches: AtomicU64,
    pub chats: AtomicU64,
    pub embeds: AtomicU64,
    pub errors: AtomicU64,
    avg_search_ms: AtomicU64,
    avg_chat_ms: AtomicU64,
    avg_embed_ms: AtomicU64,
    started_at: i64,
    start_instant: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            chats: AtomicU64::new(0),
            embeds: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            avg_search_ms: AtomicU64::new(0f64.to_bits()),
            avg_chat_ms: AtomicU64::new(0f64.to_bits()),
            avg_embed_ms: AtomicU64::new(0f64.to_bits()),
            started_at: chrono::Utc::now().timestamp(),
            start_instant: Instant::now(),
        }
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_instant.elapsed().as_secs()
    }

    pub fn record_search_duration(&self, start: Instant) {
        record(&self.avg_search_ms, start);
    }

    pub fn record_chat_duration(&self, start: Instant) {
        record(&self.avg_chat_ms, start);
    }

    pub fn record_embed_duration(&self, start: Instant) {
        record(&self.avg_embed_ms, start);
    }

    pub fn avg_search_ms(&self) -> f64 {
        f64::from_bits(self.avg_search_ms.load(Ordering::Relaxed))
    }

    pub fn avg_chat_ms(&self) -> f64 {
        f64::from_bits(self.avg_chat_ms.load(Ordering::Relaxed))
    }

    pub fn avg_embed_ms(&self) -> f64 {
        f64::from_bits(self.avg_embed_ms.load(Ordering::Relaxed))
    }

    /// Prometheus text exposition: counters end in `_total`, gauges do not.
    pub fn render_prometheus(&self, stats: Option<&StoreStats>) -> String {
        let mut out = String::with_capacity(2048);
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        };
        counter(
            "embedder_requests_total",
            "Total requests",
            self.requests.load(Ordering::Relaxed),
        );
        counter(
            "embedder_search_requests_total",
            "Total search requests",
            self.searches.load(Ordering::Relaxed),
        );
        counter(
            "embedder_chat_requests_total",
            "Total chat requests",
            self.chats.load(Ordering::Relaxed),
        );
        counter(
            "embedder_embed_requests_total",
            "Total embedding requests",
            self.embeds.load(Ordering::Relaxed),
        );
        counter(
            "embedder_error_requests_total",
            "Total error requests",
            self.errors.load(Ordering::Relaxed),
        );

        let mut gauge = |name: &str, help: &str, value: f64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n\n"
            ));
        };
        gauge(
            "embedder_avg_search_time_ms",
            "Average search time in milliseconds",
            self.avg_search_ms(),
        );
        gauge(
            "embedder_avg_chat_time_ms",
            "Average chat time in milliseconds",
            self.avg_chat_ms(),
        );
        gauge(
            "embedder_avg_embed_time_ms",
            "Average embedding time in milliseconds",
            self.avg_embed_ms(),
        );

        match stats {
            Some(stats) => {
                gauge(
                    "embedder_database_chunks_total",
                    "Total chunks in database",
                    stats.total_chunks as f64,
                );
                gauge(
                    "embedder_database_vectors_total",
                    "Total vectors in database",
                    stats.vector_count as f64,
                );
                gauge(
                    "embedder_database_sources_total",
                    "Total sources in database",
                    stats.sources.len() as f64,
                );
            }
            None => out.push_str("# Database metrics unavailable\n\n"),
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 9/10-weighted moving average over f64 bit patterns, updated with a
/// compare-exchange loop.
fn record(average: &AtomicU64, start: Instant) {
    let sample_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mut current = average.load(Ordering::Relaxed);
    loop {
        let updated = f64::from_bits(current) * 0.9 + sample_ms * 0.1;
        match average.compare_exchange_weak(
            current,
            updated.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_move_toward_samples() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_search_ms(), 0.0);
        let past = Instant::now() - std::time::Duration::from_millis(100);
        metrics.record_search_duration(past);
        let first = metrics.avg_search_ms();
        assert!(first > 0.0);
        metrics.record_search_duration(past);
        assert!(metrics.avg_search_ms() > first);
    }

    #[test]
    fn prometheus_names_and_types() {
        let metrics = Metrics::new();
        metrics.requests.fetch_add(3, Ordering::Relaxed);
        let text = metrics.render_prometheus(None);
        assert!(text.contains("# TYPE embedder_requests_total counter"));
        assert!(text.contains("embedder_requests_total 3"));
        assert!(text.contains("# TYPE embedder_avg_chat_time_ms gauge"));
        // Every metric line is preceded by HELP and TYPE.
        for line in text.lines().filter(|l| l.starts_with("embedder_")) {
            let name = line.split_whitespace().next().unwrap();
            assert!(text.contains(&format!("# HELP {}", name)));
            assert!(text.contains(&format!("# TYPE {}", name)));
        }
    }

    #[test]
    fn counters_are_independent() {
        let metrics = Metrics::new();
        metrics.searches.fetch_add(1, Ordering::Relaxed);
        metrics.errors.fetch_add(2, Ordering::Relaxed);
        assert_eq!(metrics.searches.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.chats.load(Ordering::Relaxed), 0);
    }
}
