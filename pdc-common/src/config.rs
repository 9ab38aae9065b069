//! Configuration for the controller daemon.
//!
//! Loaded from a TOML file (explicit `--config` path or the platform config
//! directory); every section and field has a serde default so a partial
//! file, or none at all, yields a working configuration.

use crate::errors::ControlError;
use crate::metrics::DeploymentMetrics;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub rollout: RolloutDefaults,
    #[serde(default)]
    pub trigger: TriggerDefaults,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub providers: ProviderConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl ControllerConfig {
    /// Load from an explicit path, or from the platform config dir, or fall
    /// back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ControlError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };
        match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)
                    .map_err(|e| ControlError::Configuration(format!("{}: {e}", p.display())))?;
                toml::from_str(&raw)
                    .map_err(|e| ControlError::Configuration(format!("{}: {e}", p.display())))
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Default config file location (`<config_dir>/pdc/pdc.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "pdc", "pdc")
        .map(|dirs| dirs.config_dir().join("pdc.toml"))
}

/// Default durable-state directory (`<data_local_dir>/pdc`).
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("pdc"))
}

// ── Rollout ────────────────────────────────────────────────────────────────

/// Defaults applied when an operator creates a rollout without overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutDefaults {
    /// Starting exposure percentage.
    #[serde(default = "default_initial_percentage")]
    pub initial_percentage: f64,
    /// Minutes between stage evaluations.
    #[serde(default = "default_increment_interval")]
    pub increment_interval_minutes: u64,
    /// Minutes after which a still-active rollout is paused.
    #[serde(default = "default_max_duration")]
    pub max_duration_minutes: u64,
    /// Success criteria applied to every stage.
    #[serde(default)]
    pub criteria: SuccessCriteria,
}

impl Default for RolloutDefaults {
    fn default() -> Self {
        Self {
            initial_percentage: default_initial_percentage(),
            increment_interval_minutes: default_increment_interval(),
            max_duration_minutes: default_max_duration(),
            criteria: SuccessCriteria::default(),
        }
    }
}

impl RolloutDefaults {
    pub fn increment_interval(&self) -> Duration {
        Duration::from_secs(self.increment_interval_minutes * 60)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_minutes * 60)
    }
}

/// Thresholds a stage must satisfy before exposure advances. All four must
/// pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default = "default_max_response_time")]
    pub max_response_time_ms: f64,
    #[serde(default = "default_min_conversion_rate")]
    pub min_conversion_rate: f64,
    #[serde(default = "default_min_user_satisfaction")]
    pub min_user_satisfaction: f64,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            max_error_rate: default_max_error_rate(),
            max_response_time_ms: default_max_response_time(),
            min_conversion_rate: default_min_conversion_rate(),
            min_user_satisfaction: default_min_user_satisfaction(),
        }
    }
}

impl SuccessCriteria {
    /// Names of the thresholds the snapshot fails, empty when all pass.
    pub fn failures(&self, metrics: &DeploymentMetrics) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if metrics.error_rate > self.max_error_rate {
            failed.push("error_rate");
        }
        if metrics.response_time_ms > self.max_response_time_ms {
            failed.push("response_time");
        }
        if metrics.business.conversion_rate < self.min_conversion_rate {
            failed.push("conversion_rate");
        }
        if metrics.business.user_satisfaction < self.min_user_satisfaction {
            failed.push("user_satisfaction");
        }
        failed
    }

    pub fn satisfied_by(&self, metrics: &DeploymentMetrics) -> bool {
        self.failures(metrics).is_empty()
    }
}

// ── Triggers ───────────────────────────────────────────────────────────────

/// Defaults for rollback-trigger polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefaults {
    /// Seconds between trigger polls. Deliberately faster than the rollout
    /// cadence: this is the safety loop.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Default sustained-violation window in minutes.
    #[serde(default = "default_trigger_duration")]
    pub duration_minutes: u64,
}

impl Default for TriggerDefaults {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            duration_minutes: default_trigger_duration(),
        }
    }
}

impl TriggerDefaults {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ── Automation ─────────────────────────────────────────────────────────────

/// Controls whether a tripped trigger may execute a rollback on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When set, trips emit `manual_intervention_required` instead of
    /// rolling back automatically.
    #[serde(default)]
    pub approval_required: bool,
    /// Outer retry budget for a rollback execution.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minutes a completed rollback blocks another one for the same
    /// deployment.
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: u64,
    /// Seconds between outer rollback attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            approval_required: false,
            max_attempts: default_max_attempts(),
            cooldown_minutes: default_cooldown(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl AutomationConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

// ── Rollback strategy ──────────────────────────────────────────────────────

/// Rollback strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Immediate,
    Gradual,
    BlueGreen,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Gradual => write!(f, "gradual"),
            Self::BlueGreen => write!(f, "blue_green"),
        }
    }
}

/// One configured rollback step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Action identifier passed to the action executor. `traffic:<pct>`
    /// routes to the traffic actuator instead.
    pub action: String,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    /// Per-step retry budget; a step runs at most `retries + 1` times.
    #[serde(default = "default_step_retries")]
    pub retries: u32,
}

impl StepConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Rollback strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_strategy_kind")]
    pub kind: StrategyKind,
    /// Step list for the `immediate` strategy.
    #[serde(default = "default_immediate_steps")]
    pub steps: Vec<StepConfig>,
    /// Seconds between per-step retry attempts.
    #[serde(default = "default_step_retry_delay")]
    pub step_retry_delay_secs: u64,
    /// Seconds between gradual-strategy traffic rungs.
    #[serde(default = "default_rung_interval")]
    pub rung_interval_secs: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: default_strategy_kind(),
            steps: default_immediate_steps(),
            step_retry_delay_secs: default_step_retry_delay(),
            rung_interval_secs: default_rung_interval(),
        }
    }
}

impl StrategyConfig {
    pub fn step_retry_delay(&self) -> Duration {
        Duration::from_secs(self.step_retry_delay_secs)
    }

    pub fn rung_interval(&self) -> Duration {
        Duration::from_secs(self.rung_interval_secs)
    }
}

fn default_immediate_steps() -> Vec<StepConfig> {
    vec![
        StepConfig {
            name: "halt_canary_traffic".to_string(),
            action: "traffic:0".to_string(),
            timeout_secs: default_step_timeout(),
            retries: default_step_retries(),
        },
        StepConfig {
            name: "restore_stable_release".to_string(),
            action: "restore_stable_release".to_string(),
            timeout_secs: default_step_timeout(),
            retries: default_step_retries(),
        },
    ]
}

// ── Post-rollback verification ─────────────────────────────────────────────

/// Kind of post-rollback verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationKind {
    /// Run a named health-check action through the action executor.
    HealthCheck,
    /// Evaluate a condition against a fresh metrics snapshot.
    MetricValidation,
    /// Evaluate an arbitrary restricted condition expression.
    Custom,
}

/// One post-rollback verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub kind: VerificationKind,
    /// Action identifier for `health_check` checks.
    #[serde(default)]
    pub action: Option<String>,
    /// Condition expression for metric/custom checks.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

impl VerificationCheck {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Post-rollback verification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub checks: Vec<VerificationCheck>,
}

// ── Collaborator providers ─────────────────────────────────────────────────

/// Which collaborator backends the daemon wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// In-process simulated collaborators (development, tests).
    Simulated,
    /// HTTP collaborators at the configured endpoints.
    Http,
}

/// Collaborator endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_mode")]
    pub mode: ProviderMode,
    #[serde(default = "default_metrics_url")]
    pub metrics_url: String,
    #[serde(default = "default_traffic_url")]
    pub traffic_url: String,
    #[serde(default = "default_actions_url")]
    pub actions_url: String,
    /// Timeout applied to every collaborator call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mode: default_provider_mode(),
            metrics_url: default_metrics_url(),
            traffic_url: default_traffic_url(),
            actions_url: default_actions_url(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// ── Daemon ─────────────────────────────────────────────────────────────────

/// Daemon listener and persistence locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Environment scope stamped on flags this daemon creates.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Durable-state directory; platform data dir when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// JSONL audit log for lifecycle events.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            environment: default_environment(),
            state_dir: None,
            event_log: None,
        }
    }
}

// ── Defaults ───────────────────────────────────────────────────────────────

fn default_initial_percentage() -> f64 {
    5.0
}

fn default_increment_interval() -> u64 {
    30
}

fn default_max_duration() -> u64 {
    1440
}

fn default_max_error_rate() -> f64 {
    5.0
}

fn default_max_response_time() -> f64 {
    1000.0
}

fn default_min_conversion_rate() -> f64 {
    1.0
}

fn default_min_user_satisfaction() -> f64 {
    3.5
}

fn default_poll_interval() -> u64 {
    30
}

fn default_trigger_duration() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    30
}

fn default_strategy_kind() -> StrategyKind {
    StrategyKind::Immediate
}

fn default_step_timeout() -> u64 {
    60
}

fn default_step_retries() -> u32 {
    2
}

fn default_step_retry_delay() -> u64 {
    5
}

fn default_rung_interval() -> u64 {
    60
}

fn default_check_timeout() -> u64 {
    30
}

fn default_provider_mode() -> ProviderMode {
    ProviderMode::Simulated
}

fn default_metrics_url() -> String {
    "http://127.0.0.1:9380".to_string()
}

fn default_traffic_url() -> String {
    "http://127.0.0.1:9381".to_string()
}

fn default_actions_url() -> String {
    "http://127.0.0.1:9382".to_string()
}

fn default_call_timeout() -> u64 {
    10
}

fn default_http_addr() -> String {
    "127.0.0.1:9363".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.rollout.initial_percentage, 5.0);
        assert_eq!(config.rollout.increment_interval_minutes, 30);
        assert_eq!(config.trigger.poll_interval_secs, 30);
        assert!(config.automation.enabled);
        assert!(!config.automation.approval_required);
        assert_eq!(config.automation.max_attempts, 3);
        assert_eq!(config.automation.cooldown_minutes, 30);
        assert_eq!(config.strategy.kind, StrategyKind::Immediate);
        assert_eq!(config.strategy.steps.len(), 2);
        assert_eq!(config.providers.mode, ProviderMode::Simulated);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let raw = r#"
            [rollout]
            initial_percentage = 10.0

            [automation]
            approval_required = true
            max_attempts = 5

            [strategy]
            kind = "gradual"
        "#;
        let config: ControllerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.rollout.initial_percentage, 10.0);
        assert_eq!(config.rollout.increment_interval_minutes, 30);
        assert!(config.automation.approval_required);
        assert_eq!(config.automation.max_attempts, 5);
        assert_eq!(config.strategy.kind, StrategyKind::Gradual);
        assert!(!config.strategy.steps.is_empty());
    }

    #[test]
    fn criteria_failures_name_each_violated_threshold() {
        let criteria = SuccessCriteria::default();
        let mut metrics = DeploymentMetrics::nominal();
        assert!(criteria.satisfied_by(&metrics));

        metrics.error_rate = 9.0;
        metrics.business.user_satisfaction = 2.0;
        let failed = criteria.failures(&metrics);
        assert_eq!(failed, vec!["error_rate", "user_satisfaction"]);
        assert!(!criteria.satisfied_by(&metrics));
    }

    #[test]
    fn duration_helpers_convert_minutes_and_seconds() {
        let config = ControllerConfig::default();
        assert_eq!(config.rollout.increment_interval(), Duration::from_secs(1800));
        assert_eq!(config.automation.cooldown(), Duration::from_secs(1800));
        assert_eq!(config.trigger.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config =
            ControllerConfig::load(Some(Path::new("/nonexistent/pdc.toml"))).unwrap();
        assert_eq!(config.rollout.initial_percentage, 5.0);
    }
}
