//! Rollback trigger monitoring.
//!
//! Each trigger attached to a deployment polls the metrics provider on a
//! short fixed cadence (independent of the rollout's stage interval — this
//! is the safety loop) and accumulates sustained-violation time before
//! tripping. A trigger trips at most once per attachment; reset rearms it.
//!
//! Debounce: the first violating poll records the window start; the window
//! is cleared the moment a poll comes back clean, so violation time never
//! accumulates across gaps.

use crate::controller::ControlCommand;
use crate::providers::MetricsProvider;
use crate::scheduler::{RepeatingTask, TaskControl};
use crate::store::{StateStore, TRIGGERS_DOC};
use chrono::{DateTime, Utc};
use pdc_common::config::AutomationConfig;
use pdc_common::{
    ControlError, DeploymentId, DeploymentMetrics, EventBus, EventKind, RollbackTrigger,
    TriggerKind, expr,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};

/// Runtime violation-tracking state for one attached trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerState {
    pub trigger: RollbackTrigger,
    pub deployment_id: DeploymentId,
    pub first_violation: Option<DateTime<Utc>>,
    pub violation_count: u32,
    pub triggered: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

impl TriggerState {
    fn new(deployment_id: DeploymentId, trigger: RollbackTrigger) -> Self {
        Self {
            trigger,
            deployment_id,
            first_violation: None,
            violation_count: 0,
            triggered: false,
            last_checked: None,
        }
    }

    fn reset(&mut self) {
        self.first_violation = None;
        self.violation_count = 0;
        self.triggered = false;
    }
}

/// Result of folding one poll into the debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Observation {
    /// Sustained-violation window satisfied; the trigger just tripped.
    Tripped,
    /// Violating, but the window has not elapsed yet.
    Pending,
    /// Condition resolved before tripping; window cleared.
    Cleared,
    /// No violation and no open window.
    Quiet,
    /// Already tripped this attachment; cannot re-trip until reset.
    AlreadyTriggered,
}

/// Fold one poll result into the trigger's debounce window.
pub(crate) fn observe(state: &mut TriggerState, violating: bool, now: DateTime<Utc>) -> Observation {
    state.last_checked = Some(now);
    if state.triggered {
        return Observation::AlreadyTriggered;
    }
    if !violating {
        let had_window = state.first_violation.is_some();
        state.first_violation = None;
        state.violation_count = 0;
        return if had_window {
            Observation::Cleared
        } else {
            Observation::Quiet
        };
    }

    match state.first_violation {
        None => {
            state.first_violation = Some(now);
            state.violation_count = 1;
            Observation::Pending
        }
        Some(first) => {
            state.violation_count += 1;
            let required = chrono::Duration::minutes(state.trigger.duration_minutes as i64);
            if now - first >= required {
                state.triggered = true;
                Observation::Tripped
            } else {
                Observation::Pending
            }
        }
    }
}

/// Evaluate whether a trigger's condition is violated by a snapshot.
pub(crate) fn condition_violated(
    trigger: &RollbackTrigger,
    metrics: &DeploymentMetrics,
) -> Result<bool, ControlError> {
    match trigger.kind {
        TriggerKind::ErrorRate => Ok(metrics.error_rate > trigger.threshold),
        TriggerKind::ResponseTime => Ok(metrics.response_time_ms > trigger.threshold),
        TriggerKind::MetricThreshold => {
            let condition = trigger.condition.as_deref().ok_or_else(|| {
                ControlError::Configuration(format!(
                    "trigger '{}' has no condition string",
                    trigger.name
                ))
            })?;
            // The condition names one known metric; direction is implied by
            // the metric's polarity.
            if condition.contains("error_rate") {
                Ok(metrics.error_rate > trigger.threshold)
            } else if condition.contains("response_time") {
                Ok(metrics.response_time_ms > trigger.threshold)
            } else if condition.contains("availability") {
                Ok(metrics.availability < trigger.threshold)
            } else if condition.contains("throughput") {
                Ok(metrics.throughput < trigger.threshold)
            } else {
                Err(ControlError::Configuration(format!(
                    "trigger '{}' condition '{}' names no known metric",
                    trigger.name, condition
                )))
            }
        }
        TriggerKind::Custom => {
            let condition = trigger.condition.as_deref().ok_or_else(|| {
                ControlError::Configuration(format!(
                    "trigger '{}' has no condition expression",
                    trigger.name
                ))
            })?;
            Ok(expr::evaluate_condition(condition, metrics)?)
        }
    }
}

type TriggerId = (DeploymentId, String);

/// Watches every attached trigger and fires rollback commands on trip.
pub struct TriggerMonitor<M: MetricsProvider> {
    states: Arc<RwLock<HashMap<TriggerId, TriggerState>>>,
    tasks: Arc<Mutex<HashMap<TriggerId, RepeatingTask>>>,
    metrics: Arc<M>,
    bus: EventBus,
    commands: mpsc::UnboundedSender<ControlCommand>,
    automation: AutomationConfig,
    store: StateStore,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl<M: MetricsProvider> Clone for TriggerMonitor<M> {
    fn clone(&self) -> Self {
        Self {
            states: self.states.clone(),
            tasks: self.tasks.clone(),
            metrics: self.metrics.clone(),
            bus: self.bus.clone(),
            commands: self.commands.clone(),
            automation: self.automation.clone(),
            store: self.store.clone(),
            poll_interval: self.poll_interval,
            call_timeout: self.call_timeout,
        }
    }
}

impl<M: MetricsProvider> TriggerMonitor<M> {
    /// Create the monitor, reloading persisted trigger states. Polling for
    /// a reloaded trigger restarts on attach, not automatically: whoever
    /// re-registers the deployment decides whether the safety loop runs.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        metrics: Arc<M>,
        bus: EventBus,
        commands: mpsc::UnboundedSender<ControlCommand>,
        automation: AutomationConfig,
        store: StateStore,
        poll_interval: Duration,
        call_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let states: HashMap<TriggerId, TriggerState> = store
            .load::<Vec<TriggerState>>(TRIGGERS_DOC)?
            .unwrap_or_default()
            .into_iter()
            .map(|s| ((s.deployment_id.clone(), s.trigger.name.clone()), s))
            .collect();
        Ok(Self {
            states: Arc::new(RwLock::new(states)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            bus,
            commands,
            automation,
            store,
            poll_interval: poll_interval.max(Duration::from_secs(1)),
            call_timeout,
        })
    }

    /// Attach a trigger to a deployment and begin polling. Re-attaching the
    /// same trigger name rebinds it with fresh violation state.
    pub async fn attach(
        &self,
        deployment: DeploymentId,
        trigger: RollbackTrigger,
    ) -> Result<(), ControlError> {
        if matches!(trigger.kind, TriggerKind::MetricThreshold | TriggerKind::Custom)
            && trigger.condition.is_none()
        {
            return Err(ControlError::Configuration(format!(
                "trigger '{}' of kind {} requires a condition",
                trigger.name, trigger.kind
            )));
        }

        let id: TriggerId = (deployment.clone(), trigger.name.clone());
        let enabled = trigger.enabled;
        self.states
            .write()
            .await
            .insert(id.clone(), TriggerState::new(deployment.clone(), trigger));
        self.persist().await;

        if enabled {
            self.spawn_poller(id);
        } else {
            info!(
                "Trigger '{}' attached to {} disabled; not polling",
                id.1, deployment
            );
        }
        Ok(())
    }

    fn spawn_poller(&self, id: TriggerId) {
        let monitor = self.clone();
        let poll_id = id.clone();
        let task = RepeatingTask::spawn(
            format!("trigger:{}:{}", id.0, id.1),
            self.poll_interval,
            move || {
                let monitor = monitor.clone();
                let id = poll_id.clone();
                async move { monitor.poll(&id).await }
            },
        );
        self.tasks.lock().expect("task registry").insert(id, task);
    }

    /// One poll cycle for one trigger.
    pub(crate) async fn poll(&self, id: &TriggerId) -> TaskControl {
        // Re-check attachment inside the callback: a poll racing detach is
        // a no-op.
        {
            let states = self.states.read().await;
            if !states.contains_key(id) {
                return TaskControl::Stop;
            }
        }

        let snapshot = match tokio::time::timeout(
            self.call_timeout,
            self.metrics.fetch_metrics(&id.0),
        )
        .await
        {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(err)) => {
                // Inconclusive: the violation window is left untouched.
                warn!("Trigger {}:{} skipping poll: {}", id.0, id.1, err);
                return TaskControl::Continue;
            }
            Err(_) => {
                warn!(
                    "Trigger {}:{} skipping poll: metrics fetch timed out",
                    id.0, id.1
                );
                return TaskControl::Continue;
            }
        };

        let (observation, trigger) = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(id) else {
                return TaskControl::Stop;
            };
            let violating = match condition_violated(&state.trigger, &snapshot) {
                Ok(v) => v,
                Err(err) => {
                    // Bad condition configuration cannot heal on its own;
                    // log loudly and keep the trigger idle.
                    error!("Trigger {}:{} condition error: {}", id.0, id.1, err);
                    return TaskControl::Continue;
                }
            };
            (
                observe(state, violating, Utc::now()),
                state.trigger.clone(),
            )
        };

        match observation {
            Observation::Tripped => {
                self.persist().await;
                info!(
                    "Trigger '{}' tripped for {} (threshold {}, sustained {}m)",
                    trigger.name, id.0, trigger.threshold, trigger.duration_minutes
                );
                self.bus.emit(
                    EventKind::TriggerActivated,
                    id.0.as_str(),
                    json!({
                        "trigger": trigger.name,
                        "kind": trigger.kind.to_string(),
                        "threshold": trigger.threshold,
                    }),
                );
                if self.automation.enabled && !self.automation.approval_required {
                    let command = ControlCommand::Rollback {
                        deployment: id.0.clone(),
                        reason: format!("trigger_{}", trigger.name),
                    };
                    if self.commands.send(command).is_err() {
                        error!("Control channel closed; rollback for {} not dispatched", id.0);
                    }
                } else {
                    self.bus.emit(
                        EventKind::ManualInterventionRequired,
                        id.0.as_str(),
                        json!({ "trigger": trigger.name }),
                    );
                }
                TaskControl::Continue
            }
            Observation::Pending | Observation::Cleared => {
                self.persist().await;
                TaskControl::Continue
            }
            Observation::Quiet | Observation::AlreadyTriggered => TaskControl::Continue,
        }
    }

    /// Clear violation state for every trigger of a deployment so the same
    /// definitions can guard a fresh rollout. Idempotent.
    pub async fn reset(&self, deployment: &DeploymentId) {
        let mut changed = false;
        {
            let mut states = self.states.write().await;
            for state in states.values_mut() {
                if state.deployment_id == *deployment
                    && (state.triggered
                        || state.first_violation.is_some()
                        || state.violation_count > 0)
                {
                    state.reset();
                    changed = true;
                }
            }
        }
        if changed {
            self.persist().await;
            info!("Triggers for {} reset", deployment);
        }
    }

    /// Stop polling and drop all trigger state for a deployment.
    pub async fn detach(&self, deployment: &DeploymentId) {
        {
            let mut tasks = self.tasks.lock().expect("task registry");
            tasks.retain(|(dep, _), task| {
                if dep == deployment {
                    task.cancel();
                    false
                } else {
                    true
                }
            });
        }
        let mut states = self.states.write().await;
        states.retain(|(dep, _), _| dep != deployment);
        drop(states);
        self.persist().await;
    }

    /// Trigger states for a deployment, for the status API.
    pub async fn status(&self, deployment: &DeploymentId) -> Vec<TriggerState> {
        let states = self.states.read().await;
        let mut result: Vec<TriggerState> = states
            .values()
            .filter(|s| s.deployment_id == *deployment)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.trigger.name.cmp(&b.trigger.name));
        result
    }

    async fn persist(&self) {
        let snapshot: Vec<TriggerState> = self.states.read().await.values().cloned().collect();
        self.store.save_best_effort(TRIGGERS_DOC, &snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_rate_trigger(duration_minutes: u64) -> RollbackTrigger {
        RollbackTrigger {
            name: "high_error_rate".to_string(),
            kind: TriggerKind::ErrorRate,
            condition: None,
            threshold: 2.0,
            duration_minutes,
            enabled: true,
        }
    }

    fn state_with(duration_minutes: u64) -> TriggerState {
        TriggerState::new(DeploymentId::new("api"), error_rate_trigger(duration_minutes))
    }

    #[test]
    fn violations_below_the_window_do_not_trip() {
        // Three violating 30s polls cover 90s, well under 5 minutes.
        let mut state = state_with(5);
        let start = Utc::now();
        for i in 0..3 {
            let now = start + chrono::Duration::seconds(30 * i);
            let obs = observe(&mut state, true, now);
            assert_eq!(obs, Observation::Pending);
        }
        assert_eq!(state.violation_count, 3);
        assert!(!state.triggered);
    }

    #[test]
    fn sustained_violation_trips_exactly_once() {
        let mut state = state_with(5);
        let start = Utc::now();
        let mut trips = 0;
        for i in 0..13 {
            let now = start + chrono::Duration::seconds(30 * i);
            if observe(&mut state, true, now) == Observation::Tripped {
                trips += 1;
            }
        }
        // 12 polls after the first span 6 minutes; one trip, then armed-off.
        assert_eq!(trips, 1);
        assert!(state.triggered);
        assert_eq!(
            observe(&mut state, true, start + chrono::Duration::minutes(10)),
            Observation::AlreadyTriggered
        );
    }

    #[test]
    fn window_clears_on_a_clean_poll() {
        let mut state = state_with(5);
        let start = Utc::now();
        observe(&mut state, true, start);
        observe(&mut state, true, start + chrono::Duration::minutes(4));
        // Condition resolves just before the window elapses.
        assert_eq!(
            observe(&mut state, false, start + chrono::Duration::minutes(4) + chrono::Duration::seconds(30)),
            Observation::Cleared
        );
        assert_eq!(state.violation_count, 0);
        assert!(state.first_violation.is_none());

        // Violation returns: the window starts over, no carry-over.
        assert_eq!(
            observe(&mut state, true, start + chrono::Duration::minutes(6)),
            Observation::Pending
        );
        assert!(!state.triggered);
    }

    #[test]
    fn boundary_is_inclusive_at_exactly_the_window() {
        let mut state = state_with(5);
        let start = Utc::now();
        observe(&mut state, true, start);
        assert_eq!(
            observe(&mut state, true, start + chrono::Duration::minutes(5)),
            Observation::Tripped
        );
    }

    #[test]
    fn direct_threshold_conditions() {
        let mut metrics = DeploymentMetrics::nominal();
        metrics.error_rate = 3.0;
        assert!(condition_violated(&error_rate_trigger(5), &metrics).unwrap());
        metrics.error_rate = 1.0;
        assert!(!condition_violated(&error_rate_trigger(5), &metrics).unwrap());

        let rt = RollbackTrigger {
            name: "slow".to_string(),
            kind: TriggerKind::ResponseTime,
            condition: None,
            threshold: 500.0,
            duration_minutes: 5,
            enabled: true,
        };
        metrics.response_time_ms = 900.0;
        assert!(condition_violated(&rt, &metrics).unwrap());
    }

    #[test]
    fn metric_threshold_direction_depends_on_the_metric() {
        let mut metrics = DeploymentMetrics::nominal();
        metrics.availability = 98.0;
        metrics.throughput = 50.0;

        let availability = RollbackTrigger {
            name: "low_availability".to_string(),
            kind: TriggerKind::MetricThreshold,
            condition: Some("availability below limit".to_string()),
            threshold: 99.0,
            duration_minutes: 5,
            enabled: true,
        };
        // Availability violates below the threshold.
        assert!(condition_violated(&availability, &metrics).unwrap());

        let throughput = RollbackTrigger {
            name: "low_throughput".to_string(),
            kind: TriggerKind::MetricThreshold,
            condition: Some("throughput".to_string()),
            threshold: 100.0,
            duration_minutes: 5,
            enabled: true,
        };
        assert!(condition_violated(&throughput, &metrics).unwrap());

        let unknown = RollbackTrigger {
            name: "mystery".to_string(),
            kind: TriggerKind::MetricThreshold,
            condition: Some("warp_core_pressure".to_string()),
            threshold: 1.0,
            duration_minutes: 5,
            enabled: true,
        };
        assert!(matches!(
            condition_violated(&unknown, &metrics),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn custom_conditions_use_the_restricted_evaluator() {
        let mut metrics = DeploymentMetrics::nominal();
        metrics.error_rate = 3.0;
        metrics.availability = 99.0;

        let custom = RollbackTrigger {
            name: "compound".to_string(),
            kind: TriggerKind::Custom,
            condition: Some("${error_rate} > 2 && ${availability} < 99.5".to_string()),
            threshold: 0.0,
            duration_minutes: 5,
            enabled: true,
        };
        assert!(condition_violated(&custom, &metrics).unwrap());

        metrics.error_rate = 0.1;
        assert!(!condition_violated(&custom, &metrics).unwrap());
    }

    #[test]
    fn reset_rearms_a_tripped_state() {
        let mut state = state_with(5);
        let start = Utc::now();
        observe(&mut state, true, start);
        observe(&mut state, true, start + chrono::Duration::minutes(6));
        assert!(state.triggered);

        state.reset();
        assert!(!state.triggered);
        assert_eq!(state.violation_count, 0);

        // Reset again: still a clean slate, nothing to observe.
        state.reset();
        assert!(!state.triggered);
    }
}
