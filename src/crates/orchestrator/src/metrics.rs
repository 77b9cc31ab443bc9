//! Atomics-based metrics registry with Prometheus text exposition
//!
//! Counters and latency histograms for the `/metrics` scrape endpoint. The
//! exporter/collector side is an external collaborator; this module only
//! renders the exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Upper bounds (milliseconds) of the latency histogram buckets
const LATENCY_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 10_000];

#[derive(Default)]
struct Histogram {
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn observe(&self, ms: u64) {
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if ms <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

/// Process-wide metrics registry
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, Arc<AtomicU64>>,
    latencies: DashMap<String, Arc<Histogram>>,
}

impl Metrics {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a named counter by 1
    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a named counter by `delta`
    pub fn add(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of a counter (0 when never touched)
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a request latency for `route`
    pub fn observe_latency(&self, route: &str, ms: u64) {
        self.latencies
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(ms);
    }

    /// Render the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }

        let mut routes: Vec<String> = self.latencies.iter().map(|e| e.key().clone()).collect();
        routes.sort();
        if !routes.is_empty() {
            out.push_str("# TYPE http_request_duration_ms histogram\n");
        }
        for route in routes {
            if let Some(hist) = self.latencies.get(&route) {
                for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                    out.push_str(&format!(
                        "http_request_duration_ms_bucket{{route=\"{route}\",le=\"{bound}\"}} {}\n",
                        hist.buckets[i].load(Ordering::Relaxed)
                    ));
                }
                let count = hist.count.load(Ordering::Relaxed);
                out.push_str(&format!(
                    "http_request_duration_ms_bucket{{route=\"{route}\",le=\"+Inf\"}} {count}\n"
                ));
                out.push_str(&format!(
                    "http_request_duration_ms_sum{{route=\"{route}\"}} {}\n",
                    hist.sum_ms.load(Ordering::Relaxed)
                ));
                out.push_str(&format!(
                    "http_request_duration_ms_count{{route=\"{route}\"}} {count}\n"
                ));
            }
        }
        out
    }
}
