//! Progressive rollout engine.
//!
//! One rollout per flag: a ladder of percentage stages, each gated by
//! success criteria evaluated against a fresh metrics snapshot on a
//! repeating timer. Criteria failure pauses the rollout — progression never
//! auto-retries; an operator (or the rollback path) resumes or reverts.
//!
//! State machine: `active -> active` (stage passed, loop), `active ->
//! paused` (criteria failed, deadline hit, or operator request), `active ->
//! completed` (ladder exhausted, terminal), `active|paused -> reverted`
//! (terminal, external). `paused -> active` only via explicit resume.

use crate::flags::FlagStore;
use crate::providers::MetricsProvider;
use crate::scheduler::{RepeatingTask, TaskControl};
use crate::store::{ROLLOUTS_DOC, StateStore};
use chrono::{DateTime, Utc};
use pdc_common::config::SuccessCriteria;
use pdc_common::{
    ControlError, DeploymentId, DeploymentMetrics, EventBus, EventKind, FlagKey, RolloutStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Fixed increment ladder stages are derived from.
pub const STAGE_LADDER: [f64; 6] = [5.0, 10.0, 25.0, 50.0, 75.0, 100.0];

/// Pause reason when a stage's success criteria fail.
pub const REASON_CRITERIA_NOT_MET: &str = "stage_criteria_not_met";
/// Pause reason when the rollout outlives its maximum duration.
pub const REASON_MAX_DURATION: &str = "max_duration_exceeded";

/// One stage of a progressive rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutStage {
    /// Exposure percentage reached when this stage passes.
    pub target_percentage: f64,
    /// Dwell before the stage is evaluated.
    pub duration_secs: u64,
    pub criteria: SuccessCriteria,
}

/// Runtime state of one rollout, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutState {
    pub flag_key: FlagKey,
    pub deployment_id: DeploymentId,
    pub current_percentage: f64,
    pub stages: Vec<RolloutStage>,
    pub current_stage: usize,
    pub status: RolloutStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub max_duration_secs: u64,
    /// Snapshot from the most recent evaluation, for status queries.
    pub last_metrics: Option<DeploymentMetrics>,
}

/// Build the stage list for a rollout starting at `initial`: the fixed
/// ladder filtered to percentages above the initial value.
pub fn stage_ladder(
    initial: f64,
    stage_interval: Duration,
    criteria: &SuccessCriteria,
) -> Vec<RolloutStage> {
    STAGE_LADDER
        .iter()
        .filter(|target| **target > initial)
        .map(|target| RolloutStage {
            target_percentage: *target,
            duration_secs: stage_interval.as_secs(),
            criteria: criteria.clone(),
        })
        .collect()
}

/// Outcome of one timer tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TickOutcome {
    /// Stage passed; exposure advanced to the stage target.
    Advanced { to: f64 },
    /// Final stage passed; rollout complete at 100%.
    Completed,
    /// Criteria failed or deadline hit; rollout paused.
    Paused { reason: &'static str },
    /// Status was no longer active; the tick is a no-op.
    Skipped,
}

/// Pure stage-evaluation step; the async tick applies its outcome.
pub(crate) fn apply_tick(
    state: &mut RolloutState,
    metrics: &DeploymentMetrics,
    now: DateTime<Utc>,
) -> TickOutcome {
    if state.status != RolloutStatus::Active {
        return TickOutcome::Skipped;
    }
    state.last_metrics = Some(metrics.clone());
    state.updated_at = now;

    let deadline = chrono::Duration::seconds(state.max_duration_secs as i64);
    if now - state.started_at >= deadline {
        state.status = RolloutStatus::Paused;
        return TickOutcome::Paused {
            reason: REASON_MAX_DURATION,
        };
    }

    let Some(stage) = state.stages.get(state.current_stage).cloned() else {
        // Empty ladder: the rollout started at or above 100%.
        state.status = RolloutStatus::Completed;
        state.current_percentage = 100.0;
        return TickOutcome::Completed;
    };

    if !stage.criteria.satisfied_by(metrics) {
        state.status = RolloutStatus::Paused;
        return TickOutcome::Paused {
            reason: REASON_CRITERIA_NOT_MET,
        };
    }

    state.current_percentage = stage.target_percentage;
    state.current_stage += 1;
    if state.current_stage >= state.stages.len() {
        state.status = RolloutStatus::Completed;
        state.current_percentage = 100.0;
        TickOutcome::Completed
    } else {
        TickOutcome::Advanced {
            to: stage.target_percentage,
        }
    }
}

/// Drives every active rollout.
pub struct RolloutEngine<M: MetricsProvider> {
    flags: FlagStore,
    states: Arc<RwLock<HashMap<FlagKey, RolloutState>>>,
    tasks: Arc<Mutex<HashMap<FlagKey, RepeatingTask>>>,
    metrics: Arc<M>,
    bus: EventBus,
    store: StateStore,
    call_timeout: Duration,
}

impl<M: MetricsProvider> Clone for RolloutEngine<M> {
    fn clone(&self) -> Self {
        Self {
            flags: self.flags.clone(),
            states: self.states.clone(),
            tasks: self.tasks.clone(),
            metrics: self.metrics.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<M: MetricsProvider> RolloutEngine<M> {
    /// Create the engine, loading persisted rollouts. Rollouts that were
    /// active at shutdown resume paused: after a restart the controller has
    /// no violation history, so it waits for an operator.
    pub fn open(
        flags: FlagStore,
        metrics: Arc<M>,
        bus: EventBus,
        store: StateStore,
        call_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let mut states: HashMap<FlagKey, RolloutState> =
            store.load(ROLLOUTS_DOC)?.unwrap_or_default();
        for state in states.values_mut() {
            if state.status == RolloutStatus::Active {
                info!(
                    "Rollout {} was active at shutdown; resuming paused",
                    state.flag_key
                );
                state.status = RolloutStatus::Paused;
            }
        }
        Ok(Self {
            flags,
            states: Arc::new(RwLock::new(states)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            bus,
            store,
            call_timeout,
        })
    }

    /// Start a progressive rollout for a flag.
    ///
    /// The flag must already exist with a weighted fallthrough at the
    /// initial percentage; this installs the stage ladder and the timer.
    pub async fn create_rollout(
        &self,
        flag_key: FlagKey,
        deployment_id: DeploymentId,
        initial_percentage: f64,
        stage_interval: Duration,
        max_duration: Duration,
        criteria: &SuccessCriteria,
    ) -> Result<RolloutState, ControlError> {
        if stage_interval.is_zero() {
            return Err(ControlError::Configuration(
                "stage interval must be positive".to_string(),
            ));
        }
        {
            let states = self.states.read().await;
            if let Some(existing) = states.get(&flag_key) {
                if !existing.status.is_terminal() {
                    return Err(ControlError::Configuration(format!(
                        "flag '{flag_key}' already has a {} rollout",
                        existing.status
                    )));
                }
            }
        }

        let now = Utc::now();
        let state = RolloutState {
            flag_key: flag_key.clone(),
            deployment_id,
            current_percentage: initial_percentage,
            stages: stage_ladder(initial_percentage, stage_interval, criteria),
            current_stage: 0,
            status: RolloutStatus::Active,
            started_at: now,
            updated_at: now,
            max_duration_secs: max_duration.as_secs(),
            last_metrics: None,
        };
        self.states
            .write()
            .await
            .insert(flag_key.clone(), state.clone());
        self.persist().await;

        info!(
            "Rollout {} started at {:.1}% with {} stages (interval {})",
            flag_key,
            initial_percentage,
            state.stages.len(),
            humantime::format_duration(stage_interval),
        );
        self.spawn_timer(flag_key, stage_interval);
        Ok(state)
    }

    fn spawn_timer(&self, flag_key: FlagKey, period: Duration) {
        let engine = self.clone();
        let key = flag_key.clone();
        let task = RepeatingTask::spawn(format!("rollout:{flag_key}"), period, move || {
            let engine = engine.clone();
            let key = key.clone();
            async move { engine.tick(&key).await }
        });
        self.tasks.lock().expect("task registry").insert(flag_key, task);
    }

    fn cancel_timer(&self, flag_key: &FlagKey) {
        if let Some(task) = self.tasks.lock().expect("task registry").remove(flag_key) {
            task.cancel();
        }
    }

    /// One evaluation cycle for a rollout. Public within the crate so the
    /// coordination tests can drive ticks directly.
    pub(crate) async fn tick(&self, flag_key: &FlagKey) -> TaskControl {
        let deployment = {
            let states = self.states.read().await;
            match states.get(flag_key) {
                // Status re-checked under the write lock below; this early
                // return handles a timer firing after removal.
                Some(state) if state.status == RolloutStatus::Active => {
                    state.deployment_id.clone()
                }
                _ => return TaskControl::Stop,
            }
        };

        let snapshot = match tokio::time::timeout(
            self.call_timeout,
            self.metrics.fetch_metrics(&deployment),
        )
        .await
        {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(err)) => {
                // Inconclusive: a fetch failure never counts as pass or fail.
                warn!("Rollout {} skipping cycle: {}", flag_key, err);
                return TaskControl::Continue;
            }
            Err(_) => {
                warn!(
                    "Rollout {} skipping cycle: metrics fetch timed out after {:?}",
                    flag_key, self.call_timeout
                );
                return TaskControl::Continue;
            }
        };

        let outcome = {
            let mut states = self.states.write().await;
            match states.get_mut(flag_key) {
                Some(state) => apply_tick(state, &snapshot, Utc::now()),
                None => return TaskControl::Stop,
            }
        };

        match outcome {
            TickOutcome::Advanced { to } => {
                if let Err(err) = self.flags.set_percentage(flag_key, to).await {
                    warn!("Rollout {} failed to update flag weights: {}", flag_key, err);
                }
                self.bus.emit(
                    EventKind::RolloutStageCompleted,
                    flag_key.as_str(),
                    json!({ "percentage": to }),
                );
                self.persist().await;
                TaskControl::Continue
            }
            TickOutcome::Completed => {
                if let Err(err) = self.flags.set_percentage(flag_key, 100.0).await {
                    warn!("Rollout {} failed to update flag weights: {}", flag_key, err);
                }
                self.bus.emit(
                    EventKind::RolloutStageCompleted,
                    flag_key.as_str(),
                    json!({ "percentage": 100.0 }),
                );
                self.bus
                    .emit(EventKind::RolloutCompleted, flag_key.as_str(), json!({}));
                info!("Rollout {} completed", flag_key);
                self.persist().await;
                TaskControl::Stop
            }
            TickOutcome::Paused { reason } => {
                let failures = {
                    let states = self.states.read().await;
                    states
                        .get(flag_key)
                        .and_then(|s| s.last_metrics.as_ref().zip(s.stages.get(s.current_stage)))
                        .map(|(metrics, stage)| stage.criteria.failures(metrics))
                        .unwrap_or_default()
                };
                self.bus.emit(
                    EventKind::RolloutPaused,
                    flag_key.as_str(),
                    json!({ "reason": reason, "failed_criteria": failures }),
                );
                info!("Rollout {} paused: {}", flag_key, reason);
                self.persist().await;
                TaskControl::Stop
            }
            TickOutcome::Skipped => TaskControl::Stop,
        }
    }

    /// Pause an active rollout. Pausing a paused rollout is a no-op.
    pub async fn pause(&self, flag_key: &FlagKey, reason: &str) -> Result<(), ControlError> {
        {
            let mut states = self.states.write().await;
            let state = states
                .get_mut(flag_key)
                .ok_or_else(|| ControlError::UnknownRollout(flag_key.to_string()))?;
            match state.status {
                RolloutStatus::Paused => return Ok(()),
                RolloutStatus::Active => {
                    state.status = RolloutStatus::Paused;
                    state.updated_at = Utc::now();
                }
                status => {
                    return Err(ControlError::Configuration(format!(
                        "rollout '{flag_key}' is {status} and cannot be paused"
                    )));
                }
            }
        }
        self.cancel_timer(flag_key);
        self.persist().await;
        self.bus.emit(
            EventKind::RolloutPaused,
            flag_key.as_str(),
            json!({ "reason": reason }),
        );
        Ok(())
    }

    /// Resume a paused rollout. Resuming an active rollout is a no-op.
    pub async fn resume(&self, flag_key: &FlagKey) -> Result<(), ControlError> {
        let interval = {
            let mut states = self.states.write().await;
            let state = states
                .get_mut(flag_key)
                .ok_or_else(|| ControlError::UnknownRollout(flag_key.to_string()))?;
            match state.status {
                RolloutStatus::Active => return Ok(()),
                RolloutStatus::Paused => {
                    state.status = RolloutStatus::Active;
                    state.updated_at = Utc::now();
                    let secs = state
                        .stages
                        .get(state.current_stage)
                        .map(|s| s.duration_secs)
                        .unwrap_or(60);
                    Duration::from_secs(secs.max(1))
                }
                status => {
                    return Err(ControlError::Configuration(format!(
                        "rollout '{flag_key}' is {status} and cannot be resumed"
                    )));
                }
            }
        };
        self.spawn_timer(flag_key.clone(), interval);
        self.persist().await;
        self.bus
            .emit(EventKind::RolloutResumed, flag_key.as_str(), json!({}));
        Ok(())
    }

    /// Force every rollout tied to the deployment back to 0% exposure.
    pub async fn revert_deployment(&self, deployment: &DeploymentId) -> Vec<FlagKey> {
        let affected: Vec<FlagKey> = {
            let mut states = self.states.write().await;
            states
                .values_mut()
                .filter(|s| s.deployment_id == *deployment && !s.status.is_terminal())
                .map(|state| {
                    state.status = RolloutStatus::Reverted;
                    state.current_percentage = 0.0;
                    state.updated_at = Utc::now();
                    state.flag_key.clone()
                })
                .collect()
        };
        for flag_key in &affected {
            self.cancel_timer(flag_key);
            if let Err(err) = self.flags.set_percentage(flag_key, 0.0).await {
                warn!("Revert of {} failed to update flag weights: {}", flag_key, err);
            }
            self.bus.emit(
                EventKind::RolloutReverted,
                flag_key.as_str(),
                json!({ "deployment_id": deployment.as_str() }),
            );
            info!("Rollout {} reverted", flag_key);
        }
        if !affected.is_empty() {
            self.persist().await;
        }
        affected
    }

    /// Drop a rollout record entirely (flag deletion cleanup).
    pub async fn remove(&self, flag_key: &FlagKey) {
        self.cancel_timer(flag_key);
        let removed = self.states.write().await.remove(flag_key);
        if removed.is_some() {
            self.persist().await;
        }
    }

    pub async fn status(&self, flag_key: &FlagKey) -> Option<RolloutState> {
        self.states.read().await.get(flag_key).cloned()
    }

    pub async fn all(&self) -> Vec<RolloutState> {
        self.states.read().await.values().cloned().collect()
    }

    async fn persist(&self) {
        let snapshot = self.states.read().await.clone();
        self.store.save_best_effort(ROLLOUTS_DOC, &snapshot).await;
    }
}
