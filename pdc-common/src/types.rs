//! Common types used across PDC components.

use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment under progressive delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique key of a feature flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagKey(pub String);

impl FlagKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlagKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a progressive rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Rollout is progressing through its stage ladder.
    Active,
    /// Rollout is halted and waits for an operator to resume or revert.
    Paused,
    /// All stages passed; exposure is pinned at 100%.
    Completed,
    /// Exposure was forced back to 0% (trigger trip or manual revert).
    Reverted,
    /// Rollout failed and cannot make further progress.
    Failed,
}

impl RolloutStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Reverted | Self::Failed)
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Reverted => write!(f, "reverted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a rollback execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of a single step inside a rollback execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Kind of rollback trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Condition string names a known metric; direction is inferred.
    MetricThreshold,
    /// Error rate compared directly against the threshold.
    ErrorRate,
    /// Response time compared directly against the threshold.
    ResponseTime,
    /// Restricted boolean expression over the metric vocabulary.
    Custom,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetricThreshold => write!(f, "metric_threshold"),
            Self::ErrorRate => write!(f, "error_rate"),
            Self::ResponseTime => write!(f, "response_time"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Rollback trigger configuration, attached to a deployment.
///
/// Runtime violation tracking lives in the daemon; this is the declarative
/// part an operator submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTrigger {
    /// Trigger name, unique per deployment.
    pub name: String,
    /// Condition kind.
    pub kind: TriggerKind,
    /// Condition string. Required for `metric_threshold` and `custom`.
    #[serde(default)]
    pub condition: Option<String>,
    /// Threshold compared against the observed metric.
    #[serde(default)]
    pub threshold: f64,
    /// Minutes the condition must hold continuously before tripping.
    #[serde(default = "default_trigger_duration")]
    pub duration_minutes: u64,
    /// Disabled triggers are attached but never polled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_trigger_duration() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_status_terminality() {
        assert!(!RolloutStatus::Active.is_terminal());
        assert!(!RolloutStatus::Paused.is_terminal());
        assert!(RolloutStatus::Completed.is_terminal());
        assert!(RolloutStatus::Reverted.is_terminal());
        assert!(RolloutStatus::Failed.is_terminal());
    }

    #[test]
    fn trigger_deserializes_with_defaults() {
        let trigger: RollbackTrigger =
            serde_json::from_str(r#"{"name":"errors","kind":"error_rate","threshold":2.0}"#)
                .unwrap();
        assert_eq!(trigger.duration_minutes, 5);
        assert!(trigger.enabled);
        assert!(trigger.condition.is_none());
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&RolloutStatus::Paused).unwrap(),
            r#""paused""#
        );
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::InProgress).unwrap(),
            r#""in_progress""#
        );
        assert_eq!(
            serde_json::to_string(&TriggerKind::MetricThreshold).unwrap(),
            r#""metric_threshold""#
        );
    }
}
