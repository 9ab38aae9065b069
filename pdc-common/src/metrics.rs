//! Deployment health and business metrics snapshot.
//!
//! A snapshot is always fetched fresh from the metrics provider and never
//! persisted by the control loop; stale data must not drive stage
//! advancement or trigger evaluation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latency and resource utilization metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// 95th percentile request latency in milliseconds.
    #[serde(default)]
    pub latency_p95_ms: f64,
    /// 99th percentile request latency in milliseconds.
    #[serde(default)]
    pub latency_p99_ms: f64,
    /// CPU utilization fraction (0.0-1.0).
    #[serde(default)]
    pub cpu_utilization: f64,
    /// Memory utilization fraction (0.0-1.0).
    #[serde(default)]
    pub memory_utilization: f64,
}

/// Business-level metrics observed for the deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessMetrics {
    /// Conversion rate in percent.
    #[serde(default)]
    pub conversion_rate: f64,
    /// User satisfaction score (1.0-5.0).
    #[serde(default)]
    pub user_satisfaction: f64,
}

/// Point-in-time snapshot of a deployment's health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    /// Error rate in percent of requests.
    pub error_rate: f64,
    /// Mean response time in milliseconds.
    pub response_time_ms: f64,
    /// Requests per second.
    pub throughput: f64,
    /// Availability in percent.
    pub availability: f64,
    #[serde(default)]
    pub performance: PerformanceMetrics,
    #[serde(default)]
    pub business: BusinessMetrics,
    /// Open map of deployment-specific metrics.
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

/// Metric names resolvable in trigger conditions and verification checks,
/// in addition to whatever the snapshot's custom map carries.
pub const KNOWN_METRICS: &[&str] = &[
    "error_rate",
    "response_time",
    "throughput",
    "availability",
    "latency_p95",
    "latency_p99",
    "cpu_utilization",
    "memory_utilization",
    "conversion_rate",
    "user_satisfaction",
];

impl DeploymentMetrics {
    /// Resolve a metric by name. Custom metrics shadow nothing: the fixed
    /// vocabulary is consulted first.
    pub fn metric_value(&self, name: &str) -> Option<f64> {
        match name {
            "error_rate" => Some(self.error_rate),
            "response_time" | "response_time_ms" => Some(self.response_time_ms),
            "throughput" => Some(self.throughput),
            "availability" => Some(self.availability),
            "latency_p95" => Some(self.performance.latency_p95_ms),
            "latency_p99" => Some(self.performance.latency_p99_ms),
            "cpu_utilization" => Some(self.performance.cpu_utilization),
            "memory_utilization" => Some(self.performance.memory_utilization),
            "conversion_rate" => Some(self.business.conversion_rate),
            "user_satisfaction" => Some(self.business.user_satisfaction),
            other => self.custom.get(other).copied(),
        }
    }

    /// A snapshot that passes the default success criteria; handy as a
    /// baseline in simulations and tests.
    pub fn nominal() -> Self {
        Self {
            error_rate: 0.5,
            response_time_ms: 180.0,
            throughput: 1200.0,
            availability: 99.95,
            performance: PerformanceMetrics {
                latency_p95_ms: 240.0,
                latency_p99_ms: 410.0,
                cpu_utilization: 0.42,
                memory_utilization: 0.55,
            },
            business: BusinessMetrics {
                conversion_rate: 3.2,
                user_satisfaction: 4.4,
            },
            custom: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_value_resolves_fixed_vocabulary() {
        let metrics = DeploymentMetrics::nominal();
        for name in KNOWN_METRICS {
            assert!(
                metrics.metric_value(name).is_some(),
                "{name} should resolve"
            );
        }
        assert_eq!(metrics.metric_value("error_rate"), Some(0.5));
        assert_eq!(metrics.metric_value("response_time"), Some(180.0));
    }

    #[test]
    fn metric_value_falls_back_to_custom_map() {
        let mut metrics = DeploymentMetrics::nominal();
        metrics.custom.insert("queue_depth".to_string(), 17.0);
        assert_eq!(metrics.metric_value("queue_depth"), Some(17.0));
        assert_eq!(metrics.metric_value("nonexistent"), None);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let metrics = DeploymentMetrics::nominal();
        let json = serde_json::to_string(&metrics).unwrap();
        let back: DeploymentMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metrics);
    }
}
