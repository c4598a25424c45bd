use actix_web::{http::header::CONTENT_TYPE, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register<C: prometheus::core::Collector + Clone + 'static>(name: &str, collector: C) -> C {
    if let Err(e) = prometheus::default_registry().register(Box::new(collector.clone())) {
        tracing::warn!(metric = name, error = %e, "metric registration failed");
    }
    collector
}

pub static WS_SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "messaging_ws_sessions_active",
        "WebSocket sessions currently joined to a conversation",
    )
    .expect("failed to create messaging_ws_sessions_active");
    register("messaging_ws_sessions_active", gauge)
});

pub static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "messaging_events_total",
            "Client events handled by the message router",
        ),
        &["event", "outcome"],
    )
    .expect("failed to create messaging_events_total");
    register("messaging_events_total", counter)
});

pub static FANOUT_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "messaging_fanout_evictions_total",
        "Subscribers dropped from a broadcast group because their queue was full",
    )
    .expect("failed to create messaging_fanout_evictions_total");
    register("messaging_fanout_evictions_total", counter)
});

pub fn record_event(event: &str, outcome: &str) {
    EVENTS_TOTAL.with_label_values(&[event, outcome]).inc();
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, encoder.format_type()))
        .body(buffer)
}
