use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub static PROMETHEUS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static PAYMENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "collections_payments_total",
            "Payment attempts by payment method family and outcome",
        ),
        &["family", "outcome"],
    ))
});

pub static PAYMENT_AMOUNT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "collections_payment_amount_total",
            "Amount charged by currency (in smallest unit)",
        ),
        &["currency"],
    ))
});

pub static COMPENSATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "collections_compensations_total",
            "Compensating actions by step and result",
        ),
        &["step", "result"],
    ))
});

pub static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "collections_webhook_events_total",
            "Gateway webhook events by type and outcome",
        ),
        &["event", "outcome"],
    ))
});

pub static STORE_CONFLICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "collections_store_conflicts_total",
            "Optimistic transaction conflicts on the invoice store",
        ),
        &["result"],
    ))
});

pub static PAYMENT_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register(HistogramVec::new(
        HistogramOpts::new(
            "collections_payment_duration_seconds",
            "Wall time of a payment execution",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["family"],
    ))
});

fn register<M>(metric: prometheus::Result<M>) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    let metric = metric.expect("Failed to create collections metric");
    PROMETHEUS_REGISTRY
        .register(Box::new(metric.clone()))
        .expect("Failed to register collections metric");
    metric
}

/// Render all collections metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_payment(family: &str, outcome: &str) {
    PAYMENTS_TOTAL.with_label_values(&[family, outcome]).inc();
}

pub fn record_amount(currency: &str, amount: i64) {
    if amount > 0 {
        PAYMENT_AMOUNT_TOTAL
            .with_label_values(&[currency])
            .inc_by(amount as u64);
    }
}

pub fn record_compensation(step: &str, result: &str) {
    COMPENSATIONS_TOTAL.with_label_values(&[step, result]).inc();
}

pub fn record_webhook(event: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL.with_label_values(&[event, outcome]).inc();
}

pub fn record_store_conflict(result: &str) {
    STORE_CONFLICTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn observe_payment_duration(family: &str, seconds: f64) {
    PAYMENT_DURATION_SECONDS
        .with_label_values(&[family])
        .observe(seconds);
}
