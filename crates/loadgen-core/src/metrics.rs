//! Process-wide metrics registry.
//!
//! All series carry the `loadgen_` prefix. Alongside the labeled request
//! counter there is a labelless aggregate (`loadgen_requests_total_all`);
//! the exposition sorts families by name, so scrapers that take the last
//! `loadgen_requests_total*` sample always see the aggregate.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    registry
        .register(Box::new(REQUESTS_TOTAL.clone()))
        .expect("register requests_total");
    registry
        .register(Box::new(REQUESTS_TOTAL_ALL.clone()))
        .expect("register requests_total_all");
    registry
        .register(Box::new(REQUEST_DURATION.clone()))
        .expect("register request_duration_seconds");
    registry
        .register(Box::new(ACTIVE_USERS.clone()))
        .expect("register active_users");
    registry
        .register(Box::new(WEBSOCKET_CONNECTIONS.clone()))
        .expect("register websocket_connections");
    registry
});

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("loadgen_requests_total", "Total number of requests made"),
        &["service", "method", "status"],
    )
    .expect("requests_total opts")
});

static REQUESTS_TOTAL_ALL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "loadgen_requests_total_all",
        "Total number of requests made, across all labels",
    )
    .expect("requests_total_all opts")
});

pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "loadgen_request_duration_seconds",
            "Request duration in seconds",
        ),
        &["service", "method"],
    )
    .expect("request_duration opts")
});

pub static ACTIVE_USERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("loadgen_active_users", "Number of active simulated users")
        .expect("active_users opts")
});

pub static WEBSOCKET_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "loadgen_websocket_connections",
        "Number of active WebSocket connections",
    )
    .expect("websocket_connections opts")
});

/// Account for one outbound call.
pub fn observe_request(service: &str, method: &str, status: &str) {
    REQUESTS_TOTAL
        .with_label_values(&[service, method, status])
        .inc();
    REQUESTS_TOTAL_ALL.inc();
}

/// Render the registry in the text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn exposition_matches_scraper_patterns() {
        observe_request("user", "login", "200");
        observe_request("posts", "create_post", "error");
        ACTIVE_USERS.inc();
        WEBSOCKET_CONNECTIONS.inc();
        REQUEST_DURATION
            .with_label_values(&["user", "login"])
            .observe(0.05);

        let text = render();

        let re_active = Regex::new(r"loadgen_active_users\s+(\d+)").unwrap();
        let re_ws = Regex::new(r"loadgen_websocket_connections\s+(\d+)").unwrap();
        let re_req = Regex::new(r"loadgen_requests_total(?:.*?)\s+(\d+)").unwrap();

        assert!(re_active.is_match(&text), "no active_users line in: {text}");
        assert!(re_ws.is_match(&text), "no websocket_connections line");
        let matches: Vec<_> = re_req.captures_iter(&text).collect();
        assert!(matches.len() >= 3, "expected labeled and aggregate lines");

        ACTIVE_USERS.dec();
        WEBSOCKET_CONNECTIONS.dec();
    }

    #[test]
    fn aggregate_series_renders_after_labeled_series() {
        observe_request("chat", "send_message", "200");
        let text = render();
        let labeled = text
            .lines()
            .position(|l| l.starts_with("loadgen_requests_total{"))
            .expect("labeled series present");
        let aggregate = text
            .lines()
            .position(|l| l.starts_with("loadgen_requests_total_all "))
            .expect("aggregate series present");
        assert!(
            aggregate > labeled,
            "aggregate must come last so last-match scrapes are deterministic"
        );
    }

    #[test]
    fn aggregate_tracks_labeled_increments() {
        let text_before = render();
        let before = parse_aggregate(&text_before);
        observe_request("profile", "get_profile", "200");
        observe_request("profile", "update_profile", "500");
        let text_after = render();
        let after = parse_aggregate(&text_after);
        assert!(after >= before + 2);
    }

    fn parse_aggregate(text: &str) -> u64 {
        text.lines()
            .find(|l| l.starts_with("loadgen_requests_total_all "))
            .and_then(|l| l.split_whitespace().last())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}
