//! Broker metrics definitions.
//!
//! Instruments are prefixed `fanout.broker.*` and track topic ownership,
//! active delivery sessions, and redirects alongside the usual connection
//! and request counters, the quantities that matter for a topic-partitioned
//! broker node.

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Broker metrics for monitoring a single node.
///
/// All metrics are prefixed with `fanout.broker.*` for easy filtering.
pub struct BrokerMetrics {
    /// Number of currently open client connections.
    pub connections_active: Gauge<i64>,
    /// Total connections accepted (cumulative).
    pub connections_total: Counter<u64>,
    /// Total requests dispatched by operation.
    pub requests_total: Counter<u64>,
    /// Request handling duration in seconds.
    pub request_duration: Histogram<f64>,
    /// Number of topics this node currently owns.
    pub owned_topics: Gauge<i64>,
    /// Number of active delivery sessions across all owned topics.
    pub delivery_sessions_active: Gauge<i64>,
    /// Total messages appended via PUBLISH.
    pub publish_total: Counter<u64>,
    /// Total NotResponsibleForTopic redirects issued.
    pub redirects_total: Counter<u64>,
    /// Total errors encountered, by error type.
    pub errors_total: Counter<u64>,
}

impl BrokerMetrics {
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connections_active: meter
                .i64_gauge("fanout.broker.connections.active")
                .with_description("Number of active client connections")
                .build(),
            connections_total: meter
                .u64_counter("fanout.broker.connections.total")
                .with_description("Total number of connections accepted")
                .build(),
            requests_total: meter
                .u64_counter("fanout.broker.requests.total")
                .with_description("Total number of requests dispatched")
                .build(),
            request_duration: meter
                .f64_histogram("fanout.broker.request.duration")
                .with_description("Request handling duration in seconds")
                .build(),
            owned_topics: meter
                .i64_gauge("fanout.broker.topics.owned")
                .with_description("Number of topics owned by this node")
                .build(),
            delivery_sessions_active: meter
                .i64_gauge("fanout.broker.delivery_sessions.active")
                .with_description("Number of active delivery sessions")
                .build(),
            publish_total: meter
                .u64_counter("fanout.broker.publish.total")
                .with_description("Total number of messages published")
                .build(),
            redirects_total: meter
                .u64_counter("fanout.broker.redirects.total")
                .with_description("Total number of NotResponsibleForTopic redirects issued")
                .build(),
            errors_total: meter
                .u64_counter("fanout.broker.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn record_connection(&self, active: i64) {
        self.connections_active.record(active, &[]);
        self.connections_total.add(1, &[]);
    }

    pub fn record_disconnection(&self, active: i64) {
        self.connections_active.record(active, &[]);
    }

    pub fn record_request(&self, operation: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    pub fn update_owned_topics(&self, count: i64) {
        self.owned_topics.record(count, &[]);
    }

    pub fn update_delivery_sessions(&self, count: i64) {
        self.delivery_sessions_active.record(count, &[]);
    }

    pub fn record_publish(&self, topic: &str) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.publish_total.add(1, attributes);
    }

    pub fn record_redirect(&self, topic: &str) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.redirects_total.add(1, attributes);
    }

    pub fn record_error(&self, error_type: &str) {
        let attributes = &[KeyValue::new("error_type", error_type.to_string())];
        self.errors_total.add(1, attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_can_be_created_and_recorded_without_panicking() {
        let metrics = BrokerMetrics::new("test-broker");

        metrics.record_connection(1);
        metrics.record_request("publish", "success", 0.01);
        metrics.update_owned_topics(3);
        metrics.update_delivery_sessions(5);
        metrics.record_publish("topic-a");
        metrics.record_redirect("topic-b");
        metrics.record_error("not_responsible_for_topic");
        metrics.record_disconnection(0);
    }
}
