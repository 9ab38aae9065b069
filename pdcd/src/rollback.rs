//! Rollback execution.
//!
//! A rollback runs one of three strategies as an ordered step sequence:
//! *immediate* (the configured steps, once), *gradual* (a fixed traffic
//! ladder with a dwell between rungs), or *blue-green* (switch, validate,
//! decommission). Each step has a timeout and a bounded retry budget; a
//! failed execution is retried as a whole up to the automation budget with
//! a renamed reason, then declared exhausted — a terminal condition that
//! requires a human. Completed executions are archived, never deleted.

use crate::providers::{ActionExecutor, MetricsProvider, TrafficActuator};
use crate::store::{ROLLBACKS_DOC, StateStore};
use chrono::{DateTime, Utc};
use pdc_common::config::{
    AutomationConfig, StepConfig, StrategyConfig, StrategyKind, VerificationConfig,
    VerificationKind,
};
use pdc_common::{ControlError, DeploymentId, EventBus, EventKind, ExecutionStatus, StepStatus, expr};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Traffic ladder for the gradual strategy, strictly ordered, never skipped.
pub const GRADUAL_RUNGS: [f64; 4] = [75.0, 50.0, 25.0, 0.0];

const RUNG_TIMEOUT_SECS: u64 = 60;
const RUNG_RETRIES: u32 = 2;

/// One step inside a rollback execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub index: usize,
    pub name: String,
    /// Action identifier; `traffic:<pct>` routes to the traffic actuator.
    pub action: String,
    pub status: StepStatus,
    pub attempts: u32,
    /// `retries + 1`; `attempts` never exceeds this.
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub error: Option<String>,
}

/// One rollback execution, archived after completion for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackExecution {
    pub id: String,
    pub deployment_id: DeploymentId,
    pub reason: String,
    pub strategy: StrategyKind,
    pub status: ExecutionStatus,
    pub steps: Vec<StepExecution>,
    /// Outer attempt counter (1-based once running).
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Executes rollbacks against the traffic and action collaborators.
pub struct RollbackExecutor<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor> {
    metrics: Arc<M>,
    traffic: Arc<T>,
    actions: Arc<A>,
    strategy: StrategyConfig,
    automation: AutomationConfig,
    verification: VerificationConfig,
    bus: EventBus,
    store: StateStore,
    history: Arc<RwLock<Vec<RollbackExecution>>>,
    last_completed: Arc<RwLock<HashMap<DeploymentId, DateTime<Utc>>>>,
    in_flight: Arc<RwLock<HashSet<DeploymentId>>>,
}

impl<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor> RollbackExecutor<M, T, A> {
    /// Create the executor, reloading archived history. The cooldown clock
    /// is rebuilt from the archive so a restart cannot bypass it.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        metrics: Arc<M>,
        traffic: Arc<T>,
        actions: Arc<A>,
        strategy: StrategyConfig,
        automation: AutomationConfig,
        verification: VerificationConfig,
        bus: EventBus,
        store: StateStore,
    ) -> Result<Self, ControlError> {
        let history: Vec<RollbackExecution> = store.load(ROLLBACKS_DOC)?.unwrap_or_default();
        let mut last_completed: HashMap<DeploymentId, DateTime<Utc>> = HashMap::new();
        for execution in &history {
            if execution.status == ExecutionStatus::Completed {
                if let Some(at) = execution.completed_at {
                    let entry = last_completed
                        .entry(execution.deployment_id.clone())
                        .or_insert(at);
                    if at > *entry {
                        *entry = at;
                    }
                }
            }
        }
        Ok(Self {
            metrics,
            traffic,
            actions,
            strategy,
            automation,
            verification,
            bus,
            store,
            history: Arc::new(RwLock::new(history)),
            last_completed: Arc::new(RwLock::new(last_completed)),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Run a rollback for a deployment.
    pub async fn execute(
        &self,
        deployment: &DeploymentId,
        reason: &str,
    ) -> Result<RollbackExecution, ControlError> {
        if let Some(completed_at) = self.last_completed.read().await.get(deployment).copied() {
            let cooldown = chrono::Duration::seconds(self.automation.cooldown().as_secs() as i64);
            let elapsed = Utc::now() - completed_at;
            if elapsed < cooldown {
                let remaining = (cooldown - elapsed).num_seconds().max(0) as u64;
                return Err(ControlError::CooldownViolation {
                    deployment: deployment.to_string(),
                    remaining_secs: remaining,
                });
            }
        }

        {
            let mut in_flight = self.in_flight.write().await;
            if !in_flight.insert(deployment.clone()) {
                return Err(ControlError::RollbackInFlight {
                    deployment: deployment.to_string(),
                });
            }
        }
        let result = self.run(deployment, reason).await;
        self.in_flight.write().await.remove(deployment);
        result
    }

    async fn run(
        &self,
        deployment: &DeploymentId,
        base_reason: &str,
    ) -> Result<RollbackExecution, ControlError> {
        let max_attempts = self.automation.max_attempts.max(1);
        let mut execution = RollbackExecution {
            id: uuid::Uuid::new_v4().to_string(),
            deployment_id: deployment.clone(),
            reason: base_reason.to_string(),
            strategy: self.strategy.kind,
            status: ExecutionStatus::InProgress,
            steps: self.plan_steps(),
            attempt: 0,
            max_attempts,
            started_at: Utc::now(),
            completed_at: None,
        };
        info!(
            "Rollback {} for {} starting: strategy={}, reason={}",
            execution.id, deployment, execution.strategy, base_reason
        );

        loop {
            execution.attempt += 1;
            if execution.attempt > 1 {
                execution.reason = format!("{base_reason}_retry_{}", execution.attempt - 1);
                execution.steps = self.plan_steps();
            }

            match self.run_attempt(deployment, &mut execution).await {
                Ok(()) => {
                    execution.status = ExecutionStatus::Completed;
                    execution.completed_at = Some(Utc::now());
                    self.last_completed
                        .write()
                        .await
                        .insert(deployment.clone(), Utc::now());
                    self.archive(execution.clone()).await;
                    self.bus.emit(
                        EventKind::RollbackCompleted,
                        deployment.as_str(),
                        json!({
                            "execution_id": execution.id,
                            "strategy": execution.strategy.to_string(),
                            "attempts": execution.attempt,
                        }),
                    );
                    info!(
                        "Rollback {} for {} completed on attempt {}",
                        execution.id, deployment, execution.attempt
                    );
                    return Ok(execution);
                }
                Err(err) => {
                    warn!(
                        "Rollback {} for {} attempt {}/{} failed: {}",
                        execution.id, deployment, execution.attempt, max_attempts, err
                    );
                    self.bus.emit(
                        EventKind::RollbackFailed,
                        deployment.as_str(),
                        json!({
                            "execution_id": execution.id,
                            "attempt": execution.attempt,
                            "error": err.to_string(),
                        }),
                    );
                    if execution.attempt >= max_attempts {
                        execution.status = ExecutionStatus::Failed;
                        execution.completed_at = Some(Utc::now());
                        self.archive(execution.clone()).await;
                        self.bus.emit(
                            EventKind::RollbackExhausted,
                            deployment.as_str(),
                            json!({
                                "execution_id": execution.id,
                                "attempts": execution.attempt,
                            }),
                        );
                        return Err(ControlError::Exhausted {
                            deployment: deployment.to_string(),
                            attempts: execution.attempt,
                        });
                    }
                    tokio::time::sleep(self.automation.retry_delay()).await;
                }
            }
        }
    }

    /// Plan the step list for the configured strategy.
    fn plan_steps(&self) -> Vec<StepExecution> {
        let configs: Vec<StepConfig> = match self.strategy.kind {
            StrategyKind::Immediate => self.strategy.steps.clone(),
            StrategyKind::Gradual => GRADUAL_RUNGS
                .iter()
                .map(|pct| StepConfig {
                    name: format!("reduce_traffic_to_{pct}"),
                    action: format!("traffic:{pct}"),
                    timeout_secs: RUNG_TIMEOUT_SECS,
                    retries: RUNG_RETRIES,
                })
                .collect(),
            StrategyKind::BlueGreen => ["switch_traffic_to_previous", "validate_traffic_switch", "decommission_failed_version"]
                .iter()
                .map(|action| StepConfig {
                    name: action.to_string(),
                    action: action.to_string(),
                    timeout_secs: RUNG_TIMEOUT_SECS,
                    retries: RUNG_RETRIES,
                })
                .collect(),
        };
        configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| StepExecution {
                index,
                name: config.name,
                action: config.action,
                status: StepStatus::Pending,
                attempts: 0,
                max_attempts: config.retries + 1,
                timeout_secs: config.timeout_secs,
                error: None,
            })
            .collect()
    }

    async fn run_attempt(
        &self,
        deployment: &DeploymentId,
        execution: &mut RollbackExecution,
    ) -> Result<(), ControlError> {
        let gradual = execution.strategy == StrategyKind::Gradual;
        let count = execution.steps.len();
        for i in 0..count {
            self.run_step(deployment, &mut execution.steps[i]).await?;
            if gradual && i + 1 < count {
                tokio::time::sleep(self.strategy.rung_interval()).await;
            }
        }
        if self.verification.enabled {
            self.verify(deployment).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        deployment: &DeploymentId,
        step: &mut StepExecution,
    ) -> Result<(), ControlError> {
        step.status = StepStatus::Running;
        let timeout = Duration::from_secs(step.timeout_secs);
        let mut last_error = None;
        for attempt in 1..=step.max_attempts {
            step.attempts = attempt;
            match self.dispatch(deployment, &step.action, timeout).await {
                Ok(()) => {
                    step.status = StepStatus::Completed;
                    step.error = None;
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "Step '{}' attempt {}/{} failed: {}",
                        step.name, attempt, step.max_attempts, err
                    );
                    step.error = Some(err.to_string());
                    last_error = Some(err);
                    if attempt < step.max_attempts {
                        tokio::time::sleep(self.strategy.step_retry_delay()).await;
                    }
                }
            }
        }
        step.status = StepStatus::Failed;
        Err(last_error.unwrap_or_else(|| ControlError::TransientActionFailure {
            action: step.action.clone(),
            message: "step failed with an empty retry budget".to_string(),
        }))
    }

    /// Route a step action: `traffic:<pct>` goes to the traffic actuator,
    /// anything else to the action executor.
    async fn dispatch(
        &self,
        deployment: &DeploymentId,
        action: &str,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        if let Some(raw) = action.strip_prefix("traffic:") {
            let percentage: f64 = raw.parse().map_err(|_| {
                ControlError::Configuration(format!("invalid traffic action '{action}'"))
            })?;
            return match tokio::time::timeout(
                timeout,
                self.traffic.shift_traffic(deployment, percentage),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ControlError::Timeout {
                    action: action.to_string(),
                    timeout,
                }),
            };
        }
        self.actions.run_action(action, timeout).await
    }

    /// Post-rollback verification; any failure feeds the outer retry.
    async fn verify(&self, deployment: &DeploymentId) -> Result<(), ControlError> {
        for check in &self.verification.checks {
            match check.kind {
                VerificationKind::HealthCheck => {
                    let action = check
                        .action
                        .clone()
                        .unwrap_or_else(|| "health_check".to_string());
                    self.actions.run_action(&action, check.timeout()).await?;
                }
                VerificationKind::MetricValidation | VerificationKind::Custom => {
                    let condition = check.condition.as_deref().ok_or_else(|| {
                        ControlError::Configuration(format!(
                            "verification check '{}' has no condition",
                            check.name
                        ))
                    })?;
                    let snapshot = match tokio::time::timeout(
                        check.timeout(),
                        self.metrics.fetch_metrics(deployment),
                    )
                    .await
                    {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(ControlError::Timeout {
                                action: format!("verification:{}", check.name),
                                timeout: check.timeout(),
                            });
                        }
                    };
                    if !expr::evaluate_condition(condition, &snapshot)? {
                        return Err(ControlError::TransientActionFailure {
                            action: format!("verification:{}", check.name),
                            message: format!("condition '{condition}' not satisfied"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn archive(&self, execution: RollbackExecution) {
        let snapshot = {
            let mut history = self.history.write().await;
            history.push(execution);
            history.clone()
        };
        self.store.save_best_effort(ROLLBACKS_DOC, &snapshot).await;
    }

    /// Archived executions for a deployment, oldest first.
    pub async fn history(&self, deployment: &DeploymentId) -> Vec<RollbackExecution> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.deployment_id == *deployment)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        SimulatedActionExecutor, SimulatedMetricsProvider, SimulatedTrafficActuator,
    };
    use pdc_common::config::VerificationCheck;
    use pdc_common::{DeploymentMetrics, EventBus};

    struct Harness {
        executor: RollbackExecutor<
            SimulatedMetricsProvider,
            SimulatedTrafficActuator,
            SimulatedActionExecutor,
        >,
        actions: SimulatedActionExecutor,
        traffic: SimulatedTrafficActuator,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    fn harness(strategy: StrategyKind, verification: VerificationConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let bus = EventBus::default();
        let actions = SimulatedActionExecutor::new();
        let traffic = SimulatedTrafficActuator::new();
        let metrics = SimulatedMetricsProvider::fixed(DeploymentMetrics::nominal());

        let strategy_config = StrategyConfig {
            kind: strategy,
            step_retry_delay_secs: 0,
            rung_interval_secs: 0,
            ..StrategyConfig::default()
        };
        let automation = AutomationConfig {
            retry_delay_secs: 0,
            ..AutomationConfig::default()
        };
        let executor = RollbackExecutor::open(
            Arc::new(metrics),
            Arc::new(traffic.clone()),
            Arc::new(actions.clone()),
            strategy_config,
            automation,
            verification,
            bus.clone(),
            store,
        )
        .unwrap();
        Harness {
            executor,
            actions,
            traffic,
            bus,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn immediate_strategy_runs_configured_steps_in_order() {
        let h = harness(StrategyKind::Immediate, VerificationConfig::default());
        let deployment = DeploymentId::new("api");
        let execution = h.executor.execute(&deployment, "manual_test").await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.attempt, 1);
        // Default immediate steps: halt traffic (actuator), restore release.
        assert_eq!(h.traffic.calls().await, vec![(deployment.clone(), 0.0)]);
        assert_eq!(h.actions.executed().await, vec!["restore_stable_release"]);
        assert!(execution.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn gradual_strategy_walks_the_ladder_in_order() {
        let h = harness(StrategyKind::Gradual, VerificationConfig::default());
        let deployment = DeploymentId::new("api");
        let execution = h.executor.execute(&deployment, "trigger_errors").await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let percentages: Vec<f64> = h.traffic.calls().await.iter().map(|(_, p)| *p).collect();
        assert_eq!(percentages, vec![75.0, 50.0, 25.0, 0.0]);
    }

    #[tokio::test]
    async fn blue_green_strategy_runs_its_three_steps() {
        let h = harness(StrategyKind::BlueGreen, VerificationConfig::default());
        let execution = h
            .executor
            .execute(&DeploymentId::new("api"), "manual")
            .await
            .unwrap();
        assert_eq!(execution.steps.len(), 3);
        assert_eq!(
            h.actions.executed().await,
            vec![
                "switch_traffic_to_previous",
                "validate_traffic_switch",
                "decommission_failed_version"
            ]
        );
    }

    #[tokio::test]
    async fn step_retry_budget_is_bounded_and_exhaustion_is_terminal() {
        let h = harness(StrategyKind::Gradual, VerificationConfig::default());
        h.traffic.set_failing(true);
        let mut rx = h.bus.subscribe();
        let deployment = DeploymentId::new("api");

        let err = h
            .executor
            .execute(&deployment, "trigger_errors")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Exhausted { attempts: 3, .. }));

        let history = h.executor.history(&deployment).await;
        assert_eq!(history.len(), 1);
        let execution = &history[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.attempt, 3);
        // Final attempt's renamed reason.
        assert_eq!(execution.reason, "trigger_errors_retry_2");
        // First rung: retries = 2 means at most 3 attempts, then failure.
        let first = &execution.steps[0];
        assert_eq!(first.status, StepStatus::Failed);
        assert_eq!(first.attempts, first.max_attempts);
        assert_eq!(first.attempts, RUNG_RETRIES + 1);

        let mut failed = 0;
        let mut exhausted = 0;
        while let Ok(event) = rx.try_recv() {
            match event.kind {
                EventKind::RollbackFailed => failed += 1,
                EventKind::RollbackExhausted => exhausted += 1,
                _ => {}
            }
        }
        assert_eq!(failed, 3);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn cooldown_blocks_back_to_back_rollbacks() {
        let h = harness(StrategyKind::Immediate, VerificationConfig::default());
        let deployment = DeploymentId::new("api");
        h.executor.execute(&deployment, "first").await.unwrap();

        let err = h.executor.execute(&deployment, "second").await.unwrap_err();
        assert!(matches!(err, ControlError::CooldownViolation { .. }));
        assert!(!err.is_retryable());
        // Only the first execution is archived.
        assert_eq!(h.executor.history(&deployment).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_verification_feeds_the_outer_retry() {
        let verification = VerificationConfig {
            enabled: true,
            checks: vec![VerificationCheck {
                name: "error_rate_recovered".to_string(),
                kind: VerificationKind::MetricValidation,
                action: None,
                // nominal() has error_rate 0.5, so this never passes.
                condition: Some("${error_rate} < 0.1".to_string()),
                timeout_secs: 5,
            }],
        };
        let h = harness(StrategyKind::Immediate, verification);
        let deployment = DeploymentId::new("api");

        let err = h.executor.execute(&deployment, "manual").await.unwrap_err();
        assert!(matches!(err, ControlError::Exhausted { attempts: 3, .. }));
        // Steps themselves succeeded every attempt; verification failed.
        let history = h.executor.history(&deployment).await;
        assert!(history[0].steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn passing_verification_completes_the_execution() {
        let verification = VerificationConfig {
            enabled: true,
            checks: vec![VerificationCheck {
                name: "healthy_again".to_string(),
                kind: VerificationKind::Custom,
                action: None,
                condition: Some("${error_rate} < 2 && ${availability} > 99".to_string()),
                timeout_secs: 5,
            }],
        };
        let h = harness(StrategyKind::Immediate, verification);
        let execution = h
            .executor
            .execute(&DeploymentId::new("api"), "manual")
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }
}
