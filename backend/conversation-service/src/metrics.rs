use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, TextEncoder};
use std::time::Instant;

static MESSAGES_APPENDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "conversation_service_messages_appended_total",
            "Ledger entries appended, by message kind",
        ),
        &["kind"],
    )
    .expect("failed to create conversation_service_messages_appended_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register conversation_service_messages_appended_total");
    counter
});

static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "conversation_service_events_published_total",
            "Realtime events published, by event type",
        ),
        &["event_type"],
    )
    .expect("failed to create conversation_service_events_published_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register conversation_service_events_published_total");
    counter
});

static FANOUT_DELIVERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "conversation_service_fanout_deliveries_total",
        "Frames handed to connected sessions",
    )
    .expect("failed to create conversation_service_fanout_deliveries_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register conversation_service_fanout_deliveries_total");
    counter
});

static LOCK_CONFLICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "conversation_service_lock_conflicts_total",
            "Serialization point contention, by outcome (retried|surfaced)",
        ),
        &["outcome"],
    )
    .expect("failed to create conversation_service_lock_conflicts_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register conversation_service_lock_conflicts_total");
    counter
});

static OPERATION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "conversation_service_operation_duration_seconds",
            "Orchestrator operation latencies",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["operation", "status"],
    )
    .expect("failed to create conversation_service_operation_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register conversation_service_operation_duration_seconds");
    histogram
});

pub fn record_message_appended(kind: &str) {
    MESSAGES_APPENDED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_event_published(event_type: &str) {
    EVENTS_PUBLISHED_TOTAL.with_label_values(&[event_type]).inc();
}

pub fn record_deliveries(count: usize) {
    FANOUT_DELIVERIES_TOTAL.inc_by(count as u64);
}

pub fn record_conflict(retried: bool) {
    let outcome = if retried { "retried" } else { "surfaced" };
    LOCK_CONFLICTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Times one orchestrator operation; observe with the outcome when done.
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn observe<T, E>(self, result: &Result<T, E>) {
        let status = if result.is_ok() { "ok" } else { "error" };
        OPERATION_DURATION_SECONDS
            .with_label_values(&[self.operation, status])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
