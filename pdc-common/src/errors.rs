//! Error taxonomy for the control loop.
//!
//! Retry policy is encoded in the variants: transient action failures and
//! timeouts are retried (per step, then per execution), cooldown violations
//! and configuration errors are surfaced without retry, exhaustion is
//! terminal and requires a human. Missing metrics are inconclusive — the
//! evaluation cycle that hit them is skipped, never counted as pass or fail.

use crate::expr::ExprError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// A rollback step or named action failed; retried within budget.
    #[error("action '{action}' failed: {message}")]
    TransientActionFailure { action: String, message: String },

    /// An external call exceeded its timeout; treated as a failure and retried.
    #[error("action '{action}' timed out after {}", humantime::format_duration(*timeout))]
    Timeout { action: String, timeout: Duration },

    /// A rollback was requested inside the cooldown window of a prior one.
    #[error("rollback for '{deployment}' rejected: cooldown active for another {remaining_secs}s")]
    CooldownViolation {
        deployment: String,
        remaining_secs: u64,
    },

    /// Another rollback execution is already in flight for the deployment.
    #[error("rollback already in flight for '{deployment}'")]
    RollbackInFlight { deployment: String },

    /// Outer retry budget spent; terminal, requires human intervention.
    #[error("rollback for '{deployment}' exhausted after {attempts} attempts")]
    Exhausted { deployment: String, attempts: u32 },

    /// Unknown strategy, trigger shape, or otherwise invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The metrics provider could not produce a snapshot.
    #[error("metrics unavailable for '{deployment}': {message}")]
    MetricsUnavailable {
        deployment: String,
        message: String,
    },

    /// No flag registered under the given key.
    #[error("unknown flag '{0}'")]
    UnknownFlag(String),

    /// No rollout exists for the given flag.
    #[error("unknown rollout '{0}'")]
    UnknownRollout(String),

    /// State persistence failed.
    #[error("state store error: {0}")]
    Store(String),

    /// A condition expression failed to parse or evaluate.
    #[error(transparent)]
    Expr(#[from] ExprError),
}

impl ControlError {
    /// Whether the error is eligible for the bounded retry loops.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientActionFailure { .. } | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        let transient = ControlError::TransientActionFailure {
            action: "restart".into(),
            message: "exit 1".into(),
        };
        let timeout = ControlError::Timeout {
            action: "restart".into(),
            timeout: Duration::from_secs(30),
        };
        let cooldown = ControlError::CooldownViolation {
            deployment: "api".into(),
            remaining_secs: 90,
        };
        assert!(transient.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!cooldown.is_retryable());
        assert!(!ControlError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn timeout_message_is_human_readable() {
        let err = ControlError::Timeout {
            action: "shift_traffic".into(),
            timeout: Duration::from_secs(90),
        };
        assert_eq!(
            err.to_string(),
            "action 'shift_traffic' timed out after 1m 30s"
        );
    }
}
