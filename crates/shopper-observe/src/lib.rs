//! Structured observability for the GPU session shopper control plane.
//!
//! Provides:
//! - [`Counter`] / [`Gauge`] / [`Histogram`] — atomic metric primitives
//! - [`Metrics`] — the concrete set this control plane tracks (§6.4)
//! - [`MetricsExporter`] — Prometheus text format export
//!
//! Durable audit history lives in `shopper-audit`, not here — this crate
//! only tracks the counters/gauges/histograms operators scrape.

#![forbid(unsafe_code)]

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// ─────────────────────────────────────────────────────────────
// Atomic Counter
// ─────────────────────────────────────────────────────────────

/// A thread-safe, monotonically increasing u64 counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Atomic Gauge
// ─────────────────────────────────────────────────────────────

/// A thread-safe i64 gauge — unlike [`Counter`], it can move in either
/// direction (e.g. `sessions_active` as sessions start and stop).
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Histogram
// ─────────────────────────────────────────────────────────────

/// Bucket boundaries (seconds) for `provisioning_duration_seconds`: the
/// last finite bucket (1024s, ~17 min) covers the documented worst case.
pub const PROVISIONING_DURATION_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0];

/// A fixed-bucket exponential histogram with Prometheus cumulative-bucket
/// semantics: `buckets[i]` counts every observation `<= bounds[i]`, and the
/// final bucket (`+Inf`) counts everything.
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum: Mutex<f64>,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self { bounds, buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(), sum: Mutex::new(0.0), count: AtomicU64::new(0) }
    }

    pub fn observe(&self, value: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        // +Inf bucket always counts the observation.
        self.buckets[self.bounds.len()].fetch_add(1, Ordering::Relaxed);
        *self.sum.lock() += value;
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        *self.sum.lock()
    }

    fn bucket_counts(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self.bounds.iter().enumerate().map(|(i, bound)| (bound.to_string(), self.buckets[i].load(Ordering::Relaxed))).collect();
        out.push(("+Inf".to_string(), self.buckets[self.bounds.len()].load(Ordering::Relaxed)));
        out
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(PROVISIONING_DURATION_BUCKETS)
    }
}

// ─────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────

/// The counters, per-provider gauges, and histogram this control plane
/// exposes (§6.4).
#[derive(Default)]
pub struct Metrics {
    pub provision_errors_total: Counter,
    pub hard_max_enforced_total: Counter,
    pub session_expired_total: Counter,
    pub orphans_detected_total: Counter,
    pub orphans_destroyed_total: Counter,
    pub ghosts_detected_total: Counter,
    pub ghosts_fixed_total: Counter,
    pub stuck_sessions_failed_total: Counter,
    pub destroy_failures_total: Counter,
    pub reconciliation_mismatches_total: Counter,
    pub provisioning_duration_seconds: Histogram,
    sessions_active: RwLock<HashMap<String, Gauge>>,
    circuit_breaker_state: RwLock<HashMap<String, Gauge>>,
    sessions_created_total: RwLock<HashMap<String, Counter>>,
    sessions_destroyed_total: RwLock<HashMap<String, Counter>>,
    provider_api_calls_total: RwLock<HashMap<(String, String, String), Counter>>,
    provider_api_errors_total: RwLock<HashMap<(String, String), Counter>>,
    provider_api_response_time_seconds: RwLock<HashMap<(String, String), Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `provider`'s active-session gauge by `delta` (+1 on create,
    /// -1 on terminal transition).
    pub fn adjust_sessions_active(&self, provider: &str, delta: i64) {
        let gauges = self.sessions_active.read();
        if let Some(gauge) = gauges.get(provider) {
            if delta >= 0 {
                gauge.inc();
            } else {
                gauge.dec();
            }
            return;
        }
        drop(gauges);
        let mut gauges = self.sessions_active.write();
        let gauge = gauges.entry(provider.to_string()).or_default();
        gauge.set(delta);
    }

    pub fn set_sessions_active(&self, provider: &str, value: i64) {
        let mut gauges = self.sessions_active.write();
        gauges.entry(provider.to_string()).or_default().set(value);
    }

    /// Encodes [`shopper_provision` circuit state] numerically: closed=0,
    /// half_open=1, open=2.
    pub fn set_circuit_breaker_state(&self, provider: &str, value: i64) {
        let mut gauges = self.circuit_breaker_state.write();
        gauges.entry(provider.to_string()).or_default().set(value);
    }

    fn sessions_active_snapshot(&self) -> Vec<(String, i64)> {
        self.sessions_active.read().iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    fn circuit_breaker_state_snapshot(&self) -> Vec<(String, i64)> {
        self.circuit_breaker_state.read().iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    pub fn record_session_created(&self, provider: &str) {
        self.sessions_created_total.write().entry(provider.to_string()).or_default().inc();
    }

    pub fn record_session_destroyed(&self, provider: &str) {
        self.sessions_destroyed_total.write().entry(provider.to_string()).or_default().inc();
    }

    fn sessions_created_snapshot(&self) -> Vec<(String, u64)> {
        self.sessions_created_total.read().iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    fn sessions_destroyed_snapshot(&self) -> Vec<(String, u64)> {
        self.sessions_destroyed_total.read().iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    /// Records one provider API call outcome (§6.4). `status` is one of
    /// `success`, `error`, `circuit_open`.
    pub fn record_provider_api_call(&self, provider: &str, operation: &str, status: &str) {
        self.provider_api_calls_total.write().entry((provider.to_string(), operation.to_string(), status.to_string())).or_default().inc();
    }

    pub fn record_provider_api_error(&self, provider: &str, operation: &str) {
        self.provider_api_errors_total.write().entry((provider.to_string(), operation.to_string())).or_default().inc();
    }

    pub fn observe_provider_api_response_time(&self, provider: &str, operation: &str, seconds: f64) {
        self.provider_api_response_time_seconds
            .write()
            .entry((provider.to_string(), operation.to_string()))
            .or_insert_with(|| Histogram::new(PROVISIONING_DURATION_BUCKETS))
            .observe(seconds);
    }

    fn provider_api_calls_snapshot(&self) -> Vec<((String, String, String), u64)> {
        self.provider_api_calls_total.read().iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }

    fn provider_api_errors_snapshot(&self) -> Vec<((String, String), u64)> {
        self.provider_api_errors_total.read().iter().map(|(k, v)| (k.clone(), v.get())).collect()
    }
}

// ─────────────────────────────────────────────────────────────
// Metrics Exporter (Prometheus text format)
// ─────────────────────────────────────────────────────────────

pub struct MetricsExporter {
    metrics: std::sync::Arc<Metrics>,
    /// Label prefix added to all metric names.
    prefix: String,
}

impl MetricsExporter {
    pub fn new(metrics: std::sync::Arc<Metrics>) -> Self {
        Self { metrics, prefix: "shopper".to_string() }
    }

    pub fn with_prefix(metrics: std::sync::Arc<Metrics>, prefix: impl Into<String>) -> Self {
        Self { metrics, prefix: prefix.into() }
    }

    pub fn render(&self) -> String {
        let m = &self.metrics;
        let p = &self.prefix;
        let mut out = String::new();

        self.write_counter(&mut out, p, "provision_errors_total", "Total provisioning failures", m.provision_errors_total.get());
        self.write_counter(&mut out, p, "hard_max_enforced_total", "Total sessions destroyed for exceeding hard max duration", m.hard_max_enforced_total.get());
        self.write_counter(&mut out, p, "session_expired_total", "Total sessions destroyed for reservation expiry", m.session_expired_total.get());
        self.write_counter(&mut out, p, "orphans_detected_total", "Total orphaned running sessions detected", m.orphans_detected_total.get());
        self.write_counter(&mut out, p, "orphans_destroyed_total", "Total orphaned sessions destroyed by the reconciler", m.orphans_destroyed_total.get());
        self.write_counter(&mut out, p, "ghosts_detected_total", "Total provider instances with no matching session", m.ghosts_detected_total.get());
        self.write_counter(&mut out, p, "ghosts_fixed_total", "Total ghost instances destroyed", m.ghosts_fixed_total.get());
        self.write_counter(&mut out, p, "stuck_sessions_failed_total", "Total sessions failed for a stuck transitional state", m.stuck_sessions_failed_total.get());
        self.write_counter(&mut out, p, "destroy_failures_total", "Total destroy_instance calls that returned a hard failure", m.destroy_failures_total.get());
        self.write_counter(&mut out, p, "reconciliation_mismatches_total", "Total orphans plus ghosts found across all reconciliation passes", m.reconciliation_mismatches_total.get());

        self.write_counter_vec1(&mut out, p, "sessions_created_total", "Total sessions created", "provider", m.sessions_created_snapshot());
        self.write_counter_vec1(&mut out, p, "sessions_destroyed_total", "Total sessions destroyed", "provider", m.sessions_destroyed_snapshot());
        self.write_counter_vec2(&mut out, p, "provider_api_errors_total", "Total provider adapter call failures", ("provider", "operation"), m.provider_api_errors_snapshot());
        self.write_counter_vec3(
            &mut out,
            p,
            "provider_api_calls_total",
            "Total provider adapter calls made",
            ("provider", "operation", "status"),
            m.provider_api_calls_snapshot(),
        );

        self.write_gauge_vec(&mut out, p, "sessions_active", "Active sessions per provider", "provider", m.sessions_active_snapshot());
        self.write_gauge_vec(&mut out, p, "provider_circuit_breaker_state", "Circuit breaker state per provider (0=closed,1=half_open,2=open)", "provider", m.circuit_breaker_state_snapshot());

        self.write_histogram(&mut out, p, "provisioning_duration_seconds", "Time from create_instance call to running status", &m.provisioning_duration_seconds);
        for ((provider, operation), histogram) in m.provider_api_response_time_seconds.read().iter() {
            out.push_str(&format!("# HELP {p}_provider_api_response_time_seconds Provider API call latency\n"));
            out.push_str(&format!("# TYPE {p}_provider_api_response_time_seconds histogram\n"));
            for (bound, count) in histogram.bucket_counts() {
                out.push_str(&format!("{p}_provider_api_response_time_seconds_bucket{{provider=\"{provider}\",operation=\"{operation}\",le=\"{bound}\"}} {count}\n"));
            }
            out.push_str(&format!("{p}_provider_api_response_time_seconds_sum{{provider=\"{provider}\",operation=\"{operation}\"}} {}\n", histogram.sum()));
            out.push_str(&format!("{p}_provider_api_response_time_seconds_count{{provider=\"{provider}\",operation=\"{operation}\"}} {}\n\n", histogram.count()));
        }

        out
    }

    fn write_counter(&self, out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        out.push_str(&format!("{prefix}_{name} {value}\n\n"));
    }

    fn write_gauge_vec(&self, out: &mut String, prefix: &str, name: &str, help: &str, label: &str, values: Vec<(String, i64)>) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} gauge\n"));
        for (label_value, value) in values {
            out.push_str(&format!("{prefix}_{name}{{{label}=\"{label_value}\"}} {value}\n"));
        }
        out.push('\n');
    }

    fn write_counter_vec1(&self, out: &mut String, prefix: &str, name: &str, help: &str, label: &str, values: Vec<(String, u64)>) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        for (label_value, value) in values {
            out.push_str(&format!("{prefix}_{name}{{{label}=\"{label_value}\"}} {value}\n"));
        }
        out.push('\n');
    }

    fn write_counter_vec2(&self, out: &mut String, prefix: &str, name: &str, help: &str, labels: (&str, &str), values: Vec<((String, String), u64)>) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        for ((a, b), value) in values {
            out.push_str(&format!("{prefix}_{name}{{{}=\"{a}\",{}=\"{b}\"}} {value}\n", labels.0, labels.1));
        }
        out.push('\n');
    }

    fn write_counter_vec3(&self, out: &mut String, prefix: &str, name: &str, help: &str, labels: (&str, &str, &str), values: Vec<((String, String, String), u64)>) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        for ((a, b, c), value) in values {
            out.push_str(&format!("{prefix}_{name}{{{}=\"{a}\",{}=\"{b}\",{}=\"{c}\"}} {value}\n", labels.0, labels.1, labels.2));
        }
        out.push('\n');
    }

    fn write_histogram(&self, out: &mut String, prefix: &str, name: &str, help: &str, histogram: &Histogram) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} histogram\n"));
        for (bound, count) in histogram.bucket_counts() {
            out.push_str(&format!("{prefix}_{name}_bucket{{le=\"{bound}\"}} {count}\n"));
        }
        out.push_str(&format!("{prefix}_{name}_sum {}\n", histogram.sum()));
        out.push_str(&format!("{prefix}_{name}_count {}\n\n", histogram.count()));
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_increments() {
        let c = Counter::default();
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_gauge_inc_dec_set() {
        let g = Gauge::default();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.set(-3);
        assert_eq!(g.get(), -3);
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let h = Histogram::new(&[1.0, 2.0, 4.0]);
        h.observe(0.5);
        h.observe(3.0);
        let counts = h.bucket_counts();
        assert_eq!(counts, vec![("1".to_string(), 1), ("2".to_string(), 1), ("4".to_string(), 2), ("+Inf".to_string(), 2)]);
        assert_eq!(h.count(), 2);
        assert!((h.sum() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_exporter_prometheus_format() {
        let metrics = Arc::new(Metrics::new());
        metrics.record_session_created("tensordock");
        metrics.record_session_created("tensordock");
        metrics.provision_errors_total.inc();
        metrics.set_sessions_active("tensordock", 2);
        metrics.set_circuit_breaker_state("tensordock", 0);
        metrics.provisioning_duration_seconds.observe(45.0);
        metrics.record_provider_api_call("tensordock", "create_instance", "success");
        metrics.record_provider_api_error("tensordock", "create_instance");
        metrics.observe_provider_api_response_time("tensordock", "create_instance", 1.5);

        let exporter = MetricsExporter::new(metrics);
        let output = exporter.render();

        assert!(output.contains("# HELP shopper_sessions_created_total"));
        assert!(output.contains("# TYPE shopper_sessions_created_total counter"));
        assert!(output.contains(r#"shopper_sessions_created_total{provider="tensordock"} 2"#));
        assert!(output.contains(r#"shopper_sessions_active{provider="tensordock"} 2"#));
        assert!(output.contains("# TYPE shopper_provisioning_duration_seconds histogram"));
        assert!(output.contains("shopper_provisioning_duration_seconds_bucket{le=\"64\"} 1"));
        assert!(output.contains("shopper_provisioning_duration_seconds_sum 45"));
        assert!(output.contains("shopper_provisioning_duration_seconds_count 1"));
        assert!(output.contains(r#"shopper_provider_api_calls_total{provider="tensordock",operation="create_instance",status="success"} 1"#));
        assert!(output.contains(r#"shopper_provider_api_errors_total{provider="tensordock",operation="create_instance"} 1"#));
        assert!(output.contains(r#"shopper_provider_api_response_time_seconds_count{provider="tensordock",operation="create_instance"} 1"#));
    }

    #[test]
    fn test_metrics_exporter_custom_prefix() {
        let metrics = Arc::new(Metrics::new());
        let exporter = MetricsExporter::with_prefix(metrics, "myapp");
        let output = exporter.render();
        assert!(output.contains("myapp_sessions_created_total"));
        assert!(!output.contains("shopper_sessions_created_total"));
    }
}
