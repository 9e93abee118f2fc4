//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for:
//! - Subscription delivery (events handled, handler failures, lag)
//! - Checkpoint commits
//! - Gateway produce calls
//!
//! Metrics go through the `metrics` facade. A host picks the exporter; the
//! bundled [`MetricsServer`] installs the Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Later, serve `server.render()` from the host's HTTP stack.
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Events handled, by subscription, handler and outcome.
pub const EVENTS_HANDLED: &str = "conveyor_events_handled_total";
/// Failed handler calls, by subscription and handler.
pub const HANDLER_FAILURES: &str = "conveyor_handler_failures_total";
/// Handler call latency.
pub const HANDLER_DURATION: &str = "conveyor_handler_duration_seconds";
/// Checkpoint writes, by subscription and whether forced.
pub const CHECKPOINT_COMMITS: &str = "conveyor_checkpoint_commits_total";
/// Seconds between an event being appended and being handled.
pub const SUBSCRIPTION_LAG: &str = "conveyor_subscription_lag";
/// Messages produced by gateways, by destination.
pub const GATEWAY_PRODUCED: &str = "conveyor_gateway_produced_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder.
///
/// Installs the global recorder and renders the Prometheus text format.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// `addr` is where the host will expose [`render`](Self::render).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. An
    /// already-installed recorder (common in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        describe_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
///
/// Safe to call more than once.
pub fn describe_metrics() {
    describe_counter!(EVENTS_HANDLED, "Total number of events handled by subscription handlers");
    describe_counter!(HANDLER_FAILURES, "Total number of failed handler calls");
    describe_histogram!(HANDLER_DURATION, "Time taken by a handler to handle one event");
    describe_counter!(CHECKPOINT_COMMITS, "Total number of checkpoint writes");
    describe_gauge!(
        SUBSCRIPTION_LAG,
        "Seconds between an event being appended and being handled"
    );
    describe_counter!(GATEWAY_PRODUCED, "Total number of messages produced by gateways");
}

/// Subscription metrics recorder.
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    /// Record a completed handler call.
    pub fn record_handled(subscription: &str, handler: &str, status: &'static str, duration: Duration) {
        counter!(
            EVENTS_HANDLED,
            "subscription" => subscription.to_string(),
            "handler" => handler.to_string(),
            "status" => status
        )
        .increment(1);
        histogram!(
            HANDLER_DURATION,
            "subscription" => subscription.to_string(),
            "handler" => handler.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed handler call.
    pub fn record_failure(subscription: &str, handler: &str) {
        counter!(
            HANDLER_FAILURES,
            "subscription" => subscription.to_string(),
            "handler" => handler.to_string()
        )
        .increment(1);
    }

    /// Record a checkpoint write.
    pub fn record_commit(subscription: &str, forced: bool) {
        counter!(
            CHECKPOINT_COMMITS,
            "subscription" => subscription.to_string(),
            "forced" => if forced { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record how far behind the log the subscription is.
    pub fn record_lag(subscription: &str, lag: Duration) {
        gauge!(SUBSCRIPTION_LAG, "subscription" => subscription.to_string()).set(lag.as_secs_f64());
    }
}

/// Gateway metrics recorder.
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Record messages produced to a destination.
    pub fn record_produced(destination: &str, count: usize) {
        counter!(GATEWAY_PRODUCED, "destination" => destination.to_string())
            .increment(u64::try_from(count).unwrap_or(u64::MAX));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        SubscriptionMetrics::record_handled("orders", "projection", "handled", Duration::from_millis(3));
        SubscriptionMetrics::record_commit("orders", true);
        GatewayMetrics::record_produced("integration", 2);

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains(EVENTS_HANDLED));
            assert!(rendered.contains(CHECKPOINT_COMMITS));
            assert!(rendered.contains(GATEWAY_PRODUCED));
        }
    }
}
