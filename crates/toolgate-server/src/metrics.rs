//! Prometheus metrics for the gateway.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// Terminal status: "succeeded", "failed", "timed-out", "cancelled".
    pub status: String,
}

/// Label set for tool-call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ToolCallLabels {
    /// "success" or the error kind ("rate-limited", "circuit-open", …).
    pub outcome: String,
}

/// Prometheus metrics for the gateway.
pub struct GatewayMetrics {
    /// Total executions by terminal status.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
    /// Total tool calls by outcome.
    pub tool_calls_total: Family<ToolCallLabels, Counter>,
    /// In-flight downstream calls (bridged from the admission gate).
    pub downstream_in_flight: Gauge<i64, AtomicI64>,
    /// Calls waiting for admission.
    pub queue_depth: Gauge<i64, AtomicI64>,
}

impl GatewayMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "toolgate_executions_total",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0].into_iter(),
                )
            });
        registry.register(
            "toolgate_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        let tool_calls_total = Family::default();
        registry.register(
            "toolgate_tool_calls_total",
            "Total brokered tool calls by outcome",
            tool_calls_total.clone(),
        );

        let downstream_in_flight = Gauge::default();
        registry.register(
            "toolgate_downstream_in_flight",
            "Current in-flight downstream calls",
            downstream_in_flight.clone(),
        );

        let queue_depth = Gauge::default();
        registry.register(
            "toolgate_queue_depth",
            "Calls waiting for downstream admission",
            queue_depth.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            tool_calls_total,
            downstream_in_flight,
            queue_depth,
        }
    }

    /// Record one finished execution.
    pub fn record_execution(&self, status: &str, duration_secs: f64) {
        let labels = ExecutionLabels {
            status: status.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record one tool-call outcome.
    pub fn record_tool_call(&self, outcome: &str) {
        self.tool_calls_total
            .get_or_create(&ToolCallLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}
