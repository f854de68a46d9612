//! Prometheus metrics for a memring client

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Metrics owned by one client
pub struct Metrics {
    pub registry: Registry,

    // Command counters, labelled by command name
    pub commands: IntCounterVec,
    pub command_errors: IntCounterVec,

    // Hit/miss counters
    pub get_hits: IntCounter,
    pub get_misses: IntCounter,

    // Health counters
    pub issues: IntCounter,
    pub failures: IntCounter,
    pub reconnects: IntCounter,
    pub reconnects_failed: IntCounter,
    pub removals: IntCounter,

    // Connection metrics
    pub connections_opened: IntCounter,
    pub connections_discarded: IntCounter,
    pub connections_evicted: IntCounter,
    pub idle_connections: IntGauge,

    // Bytes counters
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,

    // Latency histograms
    pub cmd_latency: HistogramVec,
    pub acquire_latency: Histogram,
}

const LATENCY_BUCKETS: [f64; 12] = [
    0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("memring_commands_total", "Total commands by name"),
            &["command"],
        )
        .unwrap();
        let command_errors = IntCounterVec::new(
            Opts::new(
                "memring_command_errors_total",
                "Commands that surfaced an error to the caller",
            ),
            &["command"],
        )
        .unwrap();

        let get_hits = IntCounter::new("memring_get_hits_total", "Total GET hits").unwrap();
        let get_misses = IntCounter::new("memring_get_misses_total", "Total GET misses").unwrap();

        let issues = IntCounter::new("memring_issues_total", "Failed server operations").unwrap();
        let failures =
            IntCounter::new("memring_failures_total", "Servers marked dead").unwrap();
        let reconnects =
            IntCounter::new("memring_reconnects_total", "Successful reconnection probes").unwrap();
        let reconnects_failed = IntCounter::new(
            "memring_reconnects_failed_total",
            "Failed reconnection probes",
        )
        .unwrap();
        let removals =
            IntCounter::new("memring_removals_total", "Servers permanently removed").unwrap();

        let connections_opened = IntCounter::new(
            "memring_connections_opened_total",
            "Connections opened to servers",
        )
        .unwrap();
        let connections_discarded = IntCounter::new(
            "memring_connections_discarded_total",
            "Connections dropped after an error, timeout or cancellation",
        )
        .unwrap();
        let connections_evicted = IntCounter::new(
            "memring_connections_evicted_total",
            "Idle connections closed by the evictor",
        )
        .unwrap();
        let idle_connections =
            IntGauge::new("memring_idle_connections", "Connections waiting in pools").unwrap();

        let bytes_read = IntCounter::new("memring_bytes_read_total", "Total bytes read").unwrap();
        let bytes_written =
            IntCounter::new("memring_bytes_written_total", "Total bytes written").unwrap();

        let cmd_latency = HistogramVec::new(
            HistogramOpts::new("memring_cmd_latency_seconds", "Command latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["command"],
        )
        .unwrap();
        let acquire_latency = Histogram::with_opts(
            HistogramOpts::new(
                "memring_acquire_latency_seconds",
                "Time spent waiting for a pooled connection",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(commands.clone())).unwrap();
        registry.register(Box::new(command_errors.clone())).unwrap();
        registry.register(Box::new(get_hits.clone())).unwrap();
        registry.register(Box::new(get_misses.clone())).unwrap();
        registry.register(Box::new(issues.clone())).unwrap();
        registry.register(Box::new(failures.clone())).unwrap();
        registry.register(Box::new(reconnects.clone())).unwrap();
        registry
            .register(Box::new(reconnects_failed.clone()))
            .unwrap();
        registry.register(Box::new(removals.clone())).unwrap();
        registry
            .register(Box::new(connections_opened.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_discarded.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_evicted.clone()))
            .unwrap();
        registry
            .register(Box::new(idle_connections.clone()))
            .unwrap();
        registry.register(Box::new(bytes_read.clone())).unwrap();
        registry.register(Box::new(bytes_written.clone())).unwrap();
        registry.register(Box::new(cmd_latency.clone())).unwrap();
        registry
            .register(Box::new(acquire_latency.clone()))
            .unwrap();

        Self {
            registry,
            commands,
            command_errors,
            get_hits,
            get_misses,
            issues,
            failures,
            reconnects,
            reconnects_failed,
            removals,
            connections_opened,
            connections_discarded,
            connections_evicted,
            idle_connections,
            bytes_read,
            bytes_written,
            cmd_latency,
            acquire_latency,
        }
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
