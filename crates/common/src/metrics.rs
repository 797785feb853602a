use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_out: CounterVec,
    operator_batches_out: CounterVec,
    exchange_messages_received: CounterVec,
    exchange_rows_sent: CounterVec,
    coordinator_queries: CounterVec,
    coordinator_drive_seconds: HistogramVec,
    coordinator_alive_workers: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_operator_output(&self, query_id: &str, operator: &str, rows: u64) {
        let labels = [query_id, operator];
        self.inner
            .operator_rows_out
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&labels)
            .inc();
    }

    /// `kind` is one of `data`, `eos`, `eoi`, `control`, `query`.
    pub fn inc_exchange_messages_received(&self, kind: &str) {
        self.inner
            .exchange_messages_received
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_exchange_rows_sent(&self, exchange_id: &str, rows: u64) {
        self.inner
            .exchange_rows_sent
            .with_label_values(&[exchange_id])
            .inc_by(rows as f64);
    }

    /// `event` is one of `dispatched`, `started`, `completed`, `failed`.
    pub fn inc_coordinator_query_event(&self, event: &str) {
        self.inner
            .coordinator_queries
            .with_label_values(&[event])
            .inc();
    }

    pub fn observe_drive_seconds(&self, mode: &str, secs: f64) {
        self.inner
            .coordinator_drive_seconds
            .with_label_values(&[mode])
            .observe(secs.max(0.0));
    }

    pub fn set_alive_workers(&self, alive: usize) {
        self.inner.coordinator_alive_workers.set(alive as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_out = counter_vec(
            &registry,
            "strand_operator_rows_out_total",
            "Output rows produced per operator",
            &["query_id", "operator"],
        );
        let operator_batches_out = counter_vec(
            &registry,
            "strand_operator_batches_out_total",
            "Output batches produced per operator",
            &["query_id", "operator"],
        );
        let exchange_messages_received = counter_vec(
            &registry,
            "strand_exchange_messages_received_total",
            "Inbound messages observed by the dispatcher",
            &["kind"],
        );
        let exchange_rows_sent = counter_vec(
            &registry,
            "strand_exchange_rows_sent_total",
            "Rows encoded and sent by producers",
            &["exchange_id"],
        );
        let coordinator_queries = counter_vec(
            &registry,
            "strand_coordinator_query_events_total",
            "Query lifecycle events observed by the coordinator",
            &["event"],
        );
        let coordinator_drive_seconds = histogram_vec(
            &registry,
            "strand_coordinator_drive_seconds",
            "Time spent driving the local plan fragment",
            &["mode"],
        );
        let coordinator_alive_workers = gauge(
            &registry,
            "strand_coordinator_alive_workers",
            "Workers that have announced liveness",
        );

        Self {
            registry,
            operator_rows_out,
            operator_batches_out,
            exchange_messages_received,
            exchange_rows_sent,
            coordinator_queries,
            coordinator_drive_seconds,
            coordinator_alive_workers,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
