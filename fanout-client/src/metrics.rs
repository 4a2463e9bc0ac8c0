//! Client metrics definitions.
//!
//! Mirrors the broker's `BrokerMetrics` shape: a gauge for connection state,
//! counters for requests/errors/reconnection attempts, a histogram for
//! request latency. Instruments are prefixed `fanout.client.*`.

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Client metrics for monitoring one client's request and connection
/// activity across all of its sessions.
pub struct ClientMetrics {
    /// 0=connecting, 1=await_ack, 2=active, 3=reconnecting, 4=failed, 5=closed
    pub connection_state: Gauge<i64>,
    pub requests_total: Counter<u64>,
    pub request_duration: Histogram<f64>,
    pub errors_total: Counter<u64>,
    pub reconnection_attempts: Counter<u64>,
    pub reconnection_success: Counter<u64>,
    pub redirects_total: Counter<u64>,
    pub deliveries_received: Counter<u64>,
}

impl ClientMetrics {
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("fanout.client.connection.state")
                .with_description(
                    "Connection state (0=connecting, 1=await_ack, 2=active, 3=reconnecting, 4=failed, 5=closed)",
                )
                .build(),
            requests_total: meter
                .u64_counter("fanout.client.requests.total")
                .with_description("Total number of requests sent")
                .build(),
            request_duration: meter
                .f64_histogram("fanout.client.request.duration")
                .with_description("Request duration in seconds")
                .build(),
            errors_total: meter
                .u64_counter("fanout.client.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
            reconnection_attempts: meter
                .u64_counter("fanout.client.reconnection.attempts")
                .with_description("Total number of reconnection attempts")
                .build(),
            reconnection_success: meter
                .u64_counter("fanout.client.reconnection.success")
                .with_description("Total number of successful reconnections")
                .build(),
            redirects_total: meter
                .u64_counter("fanout.client.redirects.total")
                .with_description("Total number of NOT_RESPONSIBLE_FOR_TOPIC redirects followed")
                .build(),
            deliveries_received: meter
                .u64_counter("fanout.client.deliveries.received")
                .with_description("Total number of delivered messages received")
                .build(),
        }
    }

    pub fn update_connection_state(&self, state: i64) {
        self.connection_state.record(state, &[]);
    }

    pub fn record_request(&self, operation: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    pub fn record_error(&self, error_type: &str) {
        let attributes = &[KeyValue::new("error_type", error_type.to_string())];
        self.errors_total.add(1, attributes);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.add(1, &[]);
    }

    pub fn record_reconnection_success(&self) {
        self.reconnection_success.add(1, &[]);
    }

    pub fn record_redirect(&self) {
        self.redirects_total.add(1, &[]);
    }

    pub fn record_delivery(&self) {
        self.deliveries_received.add(1, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_can_be_created_and_recorded_without_panicking() {
        let metrics = ClientMetrics::new("test-client");

        metrics.update_connection_state(2);
        metrics.record_request("subscribe", "success", 0.05);
        metrics.record_error("timeout");
        metrics.record_reconnection_attempt();
        metrics.record_reconnection_success();
        metrics.record_redirect();
        metrics.record_delivery();
    }
}
