//! Collaborator seams: metrics provider, traffic actuator, action executor.
//!
//! The control loop never talks to infrastructure directly; it goes through
//! these traits. Each has an HTTP backend for real deployments and a
//! simulated backend used in development mode and as the test double.
//! Every call is bounded by a timeout so a hung collaborator cannot stall
//! the loop.

use pdc_common::config::ProviderConfig;
use pdc_common::{ControlError, DeploymentId, DeploymentMetrics};
use rand::RngExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Supplies point-in-time deployment health snapshots. Safe to call
/// frequently; fetches are idempotent.
pub trait MetricsProvider: Send + Sync + 'static {
    fn fetch_metrics(
        &self,
        deployment: &DeploymentId,
    ) -> impl Future<Output = Result<DeploymentMetrics, ControlError>> + Send;
}

/// Shifts routing weight toward a deployment by percentage.
pub trait TrafficActuator: Send + Sync + 'static {
    fn shift_traffic(
        &self,
        deployment: &DeploymentId,
        percentage: f64,
    ) -> impl Future<Output = Result<(), ControlError>> + Send;
}

/// Runs a named rollback action with a timeout. Timeouts are reported
/// distinctly from plain failures.
pub trait ActionExecutor: Send + Sync + 'static {
    fn run_action(
        &self,
        action: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ControlError>> + Send;
}

// ── Simulated backends ─────────────────────────────────────────────────────

/// Metrics provider serving a mutable in-process snapshot, with optional
/// jitter so development-mode rollouts look alive.
#[derive(Clone)]
pub struct SimulatedMetricsProvider {
    current: Arc<RwLock<DeploymentMetrics>>,
    jitter: bool,
}

impl SimulatedMetricsProvider {
    pub fn nominal() -> Self {
        Self {
            current: Arc::new(RwLock::new(DeploymentMetrics::nominal())),
            jitter: true,
        }
    }

    /// Serve exactly the given snapshot until changed; used by tests.
    pub fn fixed(metrics: DeploymentMetrics) -> Self {
        Self {
            current: Arc::new(RwLock::new(metrics)),
            jitter: false,
        }
    }

    pub async fn set(&self, metrics: DeploymentMetrics) {
        *self.current.write().await = metrics;
    }
}

impl MetricsProvider for SimulatedMetricsProvider {
    async fn fetch_metrics(
        &self,
        deployment: &DeploymentId,
    ) -> Result<DeploymentMetrics, ControlError> {
        let mut snapshot = self.current.read().await.clone();
        if self.jitter {
            let mut rng = rand::rng();
            snapshot.error_rate = (snapshot.error_rate * rng.random_range(0.8..1.2)).max(0.0);
            snapshot.response_time_ms *= rng.random_range(0.9..1.1);
            snapshot.throughput *= rng.random_range(0.9..1.1);
        }
        debug!("Simulated metrics for {}: error_rate={:.2}", deployment, snapshot.error_rate);
        Ok(snapshot)
    }
}

/// Records traffic shifts; can be told to fail.
#[derive(Clone, Default)]
pub struct SimulatedTrafficActuator {
    calls: Arc<Mutex<Vec<(DeploymentId, f64)>>>,
    failing: Arc<AtomicBool>,
}

impl SimulatedTrafficActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<(DeploymentId, f64)> {
        self.calls.lock().await.clone()
    }
}

impl TrafficActuator for SimulatedTrafficActuator {
    async fn shift_traffic(
        &self,
        deployment: &DeploymentId,
        percentage: f64,
    ) -> Result<(), ControlError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::TransientActionFailure {
                action: format!("traffic:{percentage}"),
                message: "simulated traffic shift failure".to_string(),
            });
        }
        self.calls.lock().await.push((deployment.clone(), percentage));
        Ok(())
    }
}

/// Records executed actions; individual actions (or all of them) can be
/// made to fail, and an artificial delay provokes timeouts in tests.
#[derive(Clone, Default)]
pub struct SimulatedActionExecutor {
    executed: Arc<Mutex<Vec<String>>>,
    fail_all: Arc<AtomicBool>,
    fail_actions: Arc<RwLock<HashSet<String>>>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl SimulatedActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_all(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub async fn fail_action(&self, action: impl Into<String>) {
        self.fail_actions.write().await.insert(action.into());
    }

    pub async fn clear_failures(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.fail_actions.write().await.clear();
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    pub async fn executed(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }
}

impl ActionExecutor for SimulatedActionExecutor {
    async fn run_action(&self, action: &str, timeout: Duration) -> Result<(), ControlError> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(ControlError::Timeout {
                    action: action.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }
        let failing = self.fail_all.load(Ordering::SeqCst)
            || self.fail_actions.read().await.contains(action);
        if failing {
            return Err(ControlError::TransientActionFailure {
                action: action.to_string(),
                message: "simulated action failure".to_string(),
            });
        }
        self.executed.lock().await.push(action.to_string());
        Ok(())
    }
}

// ── HTTP backends ──────────────────────────────────────────────────────────

/// Fetches snapshots from `GET {base}/deployments/{id}/metrics`.
#[derive(Clone)]
pub struct HttpMetricsProvider {
    base_url: String,
    timeout: Duration,
}

impl HttpMetricsProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

impl MetricsProvider for HttpMetricsProvider {
    async fn fetch_metrics(
        &self,
        deployment: &DeploymentId,
    ) -> Result<DeploymentMetrics, ControlError> {
        let url = format!(
            "{}/deployments/{}/metrics",
            self.base_url.trim_end_matches('/'),
            deployment
        );
        let name = deployment.to_string();
        let request = tokio::task::spawn_blocking(move || -> Result<DeploymentMetrics, String> {
            let mut response = ureq::get(&url).call().map_err(|e| e.to_string())?;
            response
                .body_mut()
                .read_json::<DeploymentMetrics>()
                .map_err(|e| e.to_string())
        });
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(ControlError::Timeout {
                action: format!("fetch_metrics:{name}"),
                timeout: self.timeout,
            }),
            Ok(Err(join_err)) => Err(ControlError::MetricsUnavailable {
                deployment: name,
                message: join_err.to_string(),
            }),
            Ok(Ok(Err(message))) => Err(ControlError::MetricsUnavailable {
                deployment: name,
                message,
            }),
            Ok(Ok(Ok(metrics))) => Ok(metrics),
        }
    }
}

/// Shifts traffic via `POST {base}/deployments/{id}/traffic`.
#[derive(Clone)]
pub struct HttpTrafficActuator {
    base_url: String,
    timeout: Duration,
}

impl HttpTrafficActuator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

impl TrafficActuator for HttpTrafficActuator {
    async fn shift_traffic(
        &self,
        deployment: &DeploymentId,
        percentage: f64,
    ) -> Result<(), ControlError> {
        let url = format!(
            "{}/deployments/{}/traffic",
            self.base_url.trim_end_matches('/'),
            deployment
        );
        let action = format!("traffic:{percentage}");
        let body = serde_json::json!({ "percentage": percentage });
        let request = tokio::task::spawn_blocking(move || -> Result<(), String> {
            ureq::post(&url)
                .send_json(&body)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(ControlError::Timeout {
                action,
                timeout: self.timeout,
            }),
            Ok(Err(join_err)) => Err(ControlError::TransientActionFailure {
                action,
                message: join_err.to_string(),
            }),
            Ok(Ok(Err(message))) => Err(ControlError::TransientActionFailure { action, message }),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}

/// Runs actions via `POST {base}/actions/{name}`.
#[derive(Clone)]
pub struct HttpActionExecutor {
    base_url: String,
}

impl HttpActionExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl ActionExecutor for HttpActionExecutor {
    async fn run_action(&self, action: &str, timeout: Duration) -> Result<(), ControlError> {
        let url = format!("{}/actions/{}", self.base_url.trim_end_matches('/'), action);
        let name = action.to_string();
        let request = tokio::task::spawn_blocking(move || -> Result<(), String> {
            ureq::post(&url)
                .send_json(&serde_json::json!({}))
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        match tokio::time::timeout(timeout, request).await {
            Err(_) => Err(ControlError::Timeout {
                action: name,
                timeout,
            }),
            Ok(Err(join_err)) => Err(ControlError::TransientActionFailure {
                action: name,
                message: join_err.to_string(),
            }),
            Ok(Ok(Err(message))) => Err(ControlError::TransientActionFailure {
                action: name,
                message,
            }),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}

// ── Backend selection ──────────────────────────────────────────────────────

/// Metrics backend chosen at daemon startup.
#[derive(Clone)]
pub enum MetricsBackend {
    Simulated(SimulatedMetricsProvider),
    Http(HttpMetricsProvider),
}

impl MetricsBackend {
    pub fn from_config(config: &ProviderConfig) -> Self {
        match config.mode {
            pdc_common::ProviderMode::Simulated => Self::Simulated(SimulatedMetricsProvider::nominal()),
            pdc_common::ProviderMode::Http => Self::Http(HttpMetricsProvider::new(
                config.metrics_url.clone(),
                config.call_timeout(),
            )),
        }
    }
}

impl MetricsProvider for MetricsBackend {
    async fn fetch_metrics(
        &self,
        deployment: &DeploymentId,
    ) -> Result<DeploymentMetrics, ControlError> {
        match self {
            Self::Simulated(p) => p.fetch_metrics(deployment).await,
            Self::Http(p) => p.fetch_metrics(deployment).await,
        }
    }
}

/// Traffic backend chosen at daemon startup.
#[derive(Clone)]
pub enum TrafficBackend {
    Simulated(SimulatedTrafficActuator),
    Http(HttpTrafficActuator),
}

impl TrafficBackend {
    pub fn from_config(config: &ProviderConfig) -> Self {
        match config.mode {
            pdc_common::ProviderMode::Simulated => Self::Simulated(SimulatedTrafficActuator::new()),
            pdc_common::ProviderMode::Http => Self::Http(HttpTrafficActuator::new(
                config.traffic_url.clone(),
                config.call_timeout(),
            )),
        }
    }
}

impl TrafficActuator for TrafficBackend {
    async fn shift_traffic(
        &self,
        deployment: &DeploymentId,
        percentage: f64,
    ) -> Result<(), ControlError> {
        match self {
            Self::Simulated(p) => p.shift_traffic(deployment, percentage).await,
            Self::Http(p) => p.shift_traffic(deployment, percentage).await,
        }
    }
}

/// Action backend chosen at daemon startup.
#[derive(Clone)]
pub enum ActionBackend {
    Simulated(SimulatedActionExecutor),
    Http(HttpActionExecutor),
}

impl ActionBackend {
    pub fn from_config(config: &ProviderConfig) -> Self {
        match config.mode {
            pdc_common::ProviderMode::Simulated => Self::Simulated(SimulatedActionExecutor::new()),
            pdc_common::ProviderMode::Http => {
                Self::Http(HttpActionExecutor::new(config.actions_url.clone()))
            }
        }
    }
}

impl ActionExecutor for ActionBackend {
    async fn run_action(&self, action: &str, timeout: Duration) -> Result<(), ControlError> {
        match self {
            Self::Simulated(p) => p.run_action(action, timeout).await,
            Self::Http(p) => p.run_action(action, timeout).await,
        }
    }
}
