//! The coordinating owner of a deployment's delivery state.
//!
//! The controller composes the flag registry, rollout engine, trigger
//! monitor, and rollback executor, and exposes the operator surface the
//! HTTP API maps onto. Cross-component coordination is message passing: a
//! tripped trigger sends a command over the control channel, and the
//! controller's loop — the only writer that spans components — runs the
//! rollback and feeds the result back into rollout revert and trigger
//! reset. No two tasks mutate one deployment's state concurrently.

use crate::flags::FlagStore;
use crate::providers::{ActionExecutor, MetricsProvider, TrafficActuator};
use crate::rollback::{RollbackExecution, RollbackExecutor};
use crate::rollout::{RolloutEngine, RolloutState};
use crate::store::StateStore;
use crate::trigger::{TriggerMonitor, TriggerState};
use pdc_common::config::ControllerConfig;
use pdc_common::{
    ControlError, DeploymentId, EvalContext, EventBus, FeatureFlag, FlagKey, RollbackTrigger,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Commands sent to the controller's coordination loop.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Execute a rollback for a deployment (sent by a tripped trigger).
    Rollback {
        deployment: DeploymentId,
        reason: String,
    },
}

/// Composes the control loop and exposes the operator surface.
pub struct Controller<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor> {
    config: ControllerConfig,
    flags: FlagStore,
    pub(crate) rollouts: RolloutEngine<M>,
    pub(crate) triggers: TriggerMonitor<M>,
    rollback: RollbackExecutor<M, T, A>,
    bus: EventBus,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlCommand>>>,
}

impl<M: MetricsProvider, T: TrafficActuator, A: ActionExecutor> Controller<M, T, A> {
    /// Build the controller, loading any persisted state.
    pub fn open(
        config: ControllerConfig,
        metrics: Arc<M>,
        traffic: Arc<T>,
        actions: Arc<A>,
        bus: EventBus,
        store: StateStore,
    ) -> Result<Arc<Self>, ControlError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let flags = FlagStore::open(store.clone(), bus.clone())?;
        let rollouts = RolloutEngine::open(
            flags.clone(),
            metrics.clone(),
            bus.clone(),
            store.clone(),
            config.providers.call_timeout(),
        )?;
        let triggers = TriggerMonitor::open(
            metrics.clone(),
            bus.clone(),
            commands_tx,
            config.automation.clone(),
            store.clone(),
            config.trigger.poll_interval(),
            config.providers.call_timeout(),
        )?;
        let rollback = RollbackExecutor::open(
            metrics,
            traffic,
            actions,
            config.strategy.clone(),
            config.automation.clone(),
            config.verification.clone(),
            bus.clone(),
            store,
        )?;
        Ok(Arc::new(Self {
            config,
            flags,
            rollouts,
            triggers,
            rollback,
            bus,
            commands_rx: Mutex::new(Some(commands_rx)),
        }))
    }

    /// Spawn the coordination loop. Call once after `open`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let receiver = self
            .commands_rx
            .lock()
            .expect("command receiver")
            .take();
        let Some(mut receiver) = receiver else {
            warn!("Controller loop already started");
            return tokio::spawn(async {});
        };
        let controller = self.clone();
        tokio::spawn(async move {
            info!("Controller coordination loop started");
            while let Some(command) = receiver.recv().await {
                match command {
                    ControlCommand::Rollback { deployment, reason } => {
                        if let Err(err) = controller.trigger_rollback(&deployment, &reason).await {
                            warn!("Automated rollback for {} failed: {}", deployment, err);
                        }
                    }
                }
            }
            info!("Controller coordination loop stopped");
        })
    }

    // ── Operator surface ──────────────────────────────────────────────────

    /// Create a flag with a weighted rollout and start progressing it.
    ///
    /// The deployment defaults to the feature name: a canary release is
    /// normally the deployment of the feature it gates.
    pub async fn create_rollout_flag(
        &self,
        feature_name: &str,
        deployment_id: Option<DeploymentId>,
        initial_percentage: Option<f64>,
        increment_interval_minutes: Option<u64>,
        max_duration_minutes: Option<u64>,
    ) -> Result<FlagKey, ControlError> {
        let flag_key = FlagKey::new(format!("rollout_{feature_name}"));
        let deployment = deployment_id.unwrap_or_else(|| DeploymentId::new(feature_name));
        let initial = initial_percentage.unwrap_or(self.config.rollout.initial_percentage);
        let interval = Duration::from_secs(
            increment_interval_minutes
                .unwrap_or(self.config.rollout.increment_interval_minutes)
                * 60,
        );
        let max_duration = Duration::from_secs(
            max_duration_minutes.unwrap_or(self.config.rollout.max_duration_minutes) * 60,
        );

        self.flags
            .create(FeatureFlag::percentage_rollout(
                flag_key.clone(),
                self.config.daemon.environment.clone(),
                initial,
            ))
            .await?;
        self.rollouts
            .create_rollout(
                flag_key.clone(),
                deployment,
                initial,
                interval,
                max_duration,
                &self.config.rollout.criteria,
            )
            .await?;
        Ok(flag_key)
    }

    /// Evaluate a flag for a user context.
    pub async fn evaluate_flag(
        &self,
        flag_key: &FlagKey,
        context: &EvalContext,
    ) -> Result<Value, ControlError> {
        self.flags.evaluate(flag_key, context).await
    }

    pub async fn pause_rollout(&self, flag_key: &FlagKey) -> Result<(), ControlError> {
        self.rollouts.pause(flag_key, "operator_request").await
    }

    pub async fn resume_rollout(&self, flag_key: &FlagKey) -> Result<(), ControlError> {
        self.rollouts.resume(flag_key).await
    }

    /// Force every rollout of the deployment back to 0% exposure.
    pub async fn revert_rollout(&self, deployment: &DeploymentId) -> Vec<FlagKey> {
        self.rollouts.revert_deployment(deployment).await
    }

    /// Delete a flag and its rollout record (deployment cleanup).
    pub async fn delete_flag(&self, flag_key: &FlagKey) -> Result<(), ControlError> {
        self.rollouts.remove(flag_key).await;
        self.flags.delete(flag_key).await.map(|_| ())
    }

    /// Attach a rollback trigger to a deployment and begin polling.
    pub async fn attach_trigger(
        &self,
        deployment: DeploymentId,
        trigger: RollbackTrigger,
    ) -> Result<(), ControlError> {
        self.triggers.attach(deployment, trigger).await
    }

    /// Stop polling and drop all triggers for a deployment.
    pub async fn detach_triggers(&self, deployment: &DeploymentId) {
        self.triggers.detach(deployment).await;
    }

    /// Execute a rollback now (manual or trigger-driven). On success the
    /// deployment's rollouts are reverted and its triggers reset so the
    /// same definitions can guard the next attempt.
    pub async fn trigger_rollback(
        &self,
        deployment: &DeploymentId,
        reason: &str,
    ) -> Result<RollbackExecution, ControlError> {
        let execution = self.rollback.execute(deployment, reason).await?;
        let reverted = self.rollouts.revert_deployment(deployment).await;
        if !reverted.is_empty() {
            info!(
                "Rollback for {} reverted {} rollout(s)",
                deployment,
                reverted.len()
            );
        }
        self.triggers.reset(deployment).await;
        Ok(execution)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub async fn get_rollout_status(&self, flag_key: &FlagKey) -> Option<RolloutState> {
        self.rollouts.status(flag_key).await
    }

    pub async fn get_all_rollouts(&self) -> Vec<RolloutState> {
        self.rollouts.all().await
    }

    pub async fn get_trigger_status(&self, deployment: &DeploymentId) -> Vec<TriggerState> {
        self.triggers.status(deployment).await
    }

    pub async fn get_rollback_history(
        &self,
        deployment: &DeploymentId,
    ) -> Vec<RollbackExecution> {
        self.rollback.history(deployment).await
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}
