use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

/// Counter, labelled by `subtype`.
pub const AGENT_STARTS_TOTAL: &str = "agent_starts_total";
/// Counter, labelled by `operation` (error, hil, completed, updated_request, feedback).
pub const AGENT_RESUMES_TOTAL: &str = "agent_resumes_total";
/// Counter, labelled by `outcome` (ok, failed).
pub const AGENT_EXECUTIONS_SETTLED_TOTAL: &str = "agent_executions_settled_total";
/// Gauge of executions currently claimed in the registry.
pub const AGENT_EXECUTIONS_RUNNING: &str = "agent_executions_running";
/// Histogram of loop cycle wall time.
pub const AGENT_ITERATION_SECONDS: &str = "agent_iteration_seconds";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Bucketed distribution of observed values.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum stored as bits
        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Iteration durations range from a stubbed engine (sub-millisecond) to a
/// slow model call (minutes).
fn iteration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing members of one counter family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",key2="value2"}`, or nothing when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms behind `RwLock`-guarded maps with atomic
/// values, so the hot path only takes a read lock.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

// A panic while holding one of these locks cannot leave a map half-written
// in a way that matters for metrics, so poisoning is ignored.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// Collector with the agent runtime's histograms and gauges registered,
    /// so they show up in an export before the first observation.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        write(&collector.histograms).insert(
            AGENT_ITERATION_SECONDS.to_string(),
            Histogram::new(iteration_buckets()),
        );
        write(&collector.gauges).insert(AGENT_EXECUTIONS_RUNNING.to_string(), AtomicI64::new(0));
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.with_gauge(name, |g| g.store(value, Ordering::Relaxed));
    }

    /// Add `delta` (which may be negative) to a gauge.
    pub fn add_gauge(&self, name: &str, delta: i64) {
        self.with_gauge(name, |g| {
            g.fetch_add(delta, Ordering::Relaxed);
        });
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        read(&self.gauges)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn with_gauge(&self, name: &str, f: impl FnOnce(&AtomicI64)) {
        if let Some(g) = read(&self.gauges).get(name) {
            f(g);
            return;
        }
        let mut map = write(&self.gauges);
        f(map
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0)));
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with iteration buckets if needed.
    pub fn record_histogram(&self, name: &str, value: f64) {
        if let Some(h) = read(&self.histograms).get(name) {
            h.observe(value);
            return;
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(iteration_buckets()))
            .observe(value);
    }

    /// `(count, sum)` of a histogram, zero when it does not exist.
    pub fn histogram_stats(&self, name: &str) -> (u64, f64) {
        read(&self.histograms)
            .get(name)
            .map(|h| (h.get_count(), h.get_sum()))
            .unwrap_or((0, 0.0))
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&str> = grouped.keys().copied().collect();
            names.sort_unstable();
            for name in names {
                out.push_str(&format!("# TYPE {name} counter\n"));
                let mut entries = grouped[name].clone();
                entries.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
                for (labels, value) in entries {
                    out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
                }
            }
        }

        {
            let map = read(&self.gauges);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {name} gauge\n{name} {val}\n"));
            }
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                for (i, boundary) in h.buckets.iter().enumerate() {
                    out.push_str(&format!(
                        "{name}_bucket{{le=\"{boundary}\"}} {}\n",
                        h.counts[i].load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.get_count()));
                out.push_str(&format!("{name}_sum {}\n", h.get_sum()));
                out.push_str(&format!("{name}_count {}\n", h.get_count()));
            }
        }

        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let counters: serde_json::Map<String, serde_json::Value> = read(&self.counters)
            .iter()
            .map(|((name, labels), val)| {
                (
                    format!("{name}{}", labels.prometheus_str()),
                    serde_json::json!(val.load(Ordering::Relaxed)),
                )
            })
            .collect();

        let gauges: serde_json::Map<String, serde_json::Value> = read(&self.gauges)
            .iter()
            .map(|(name, val)| (name.clone(), serde_json::json!(val.load(Ordering::Relaxed))))
            .collect();

        let histograms: serde_json::Map<String, serde_json::Value> = read(&self.histograms)
            .iter()
            .map(|(name, h)| {
                let buckets: Vec<serde_json::Value> = h
                    .buckets
                    .iter()
                    .zip(&h.counts)
                    .map(|(le, count)| {
                        serde_json::json!({ "le": le, "count": count.load(Ordering::Relaxed) })
                    })
                    .collect();
                (
                    name.clone(),
                    serde_json::json!({
                        "buckets": buckets,
                        "sum": h.get_sum(),
                        "count": h.get_count(),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}
