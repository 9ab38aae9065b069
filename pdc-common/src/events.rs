//! Typed lifecycle event bus.
//!
//! Every state transition in the control loop (stage advance, pause, trigger
//! trip, rollback start/end/exhaustion) is published here. Emission is
//! fire-and-forget over a broadcast channel and never blocks the control
//! loop; consumers that fall behind see a lag error, not backpressure. An
//! optional audit task drains the bus to a JSONL file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_BUFFER: usize = 256;

/// Lifecycle event kinds emitted by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FlagCreated,
    FlagUpdated,
    FlagDeleted,
    RolloutStageCompleted,
    RolloutPaused,
    RolloutResumed,
    RolloutCompleted,
    RolloutReverted,
    TriggerActivated,
    ManualInterventionRequired,
    RollbackCompleted,
    RollbackFailed,
    RollbackExhausted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::FlagCreated => "flag_created",
            Self::FlagUpdated => "flag_updated",
            Self::FlagDeleted => "flag_deleted",
            Self::RolloutStageCompleted => "rollout_stage_completed",
            Self::RolloutPaused => "rollout_paused",
            Self::RolloutResumed => "rollout_resumed",
            Self::RolloutCompleted => "rollout_completed",
            Self::RolloutReverted => "rollout_reverted",
            Self::TriggerActivated => "trigger_activated",
            Self::ManualInterventionRequired => "manual_intervention_required",
            Self::RollbackCompleted => "rollback_completed",
            Self::RollbackFailed => "rollback_failed",
            Self::RollbackExhausted => "rollback_exhausted",
        };
        write!(f, "{name}")
    }
}

/// One lifecycle event. `subject` is the flag key or deployment id the
/// event is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub subject: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ControlEvent {
    pub fn new(kind: EventKind, subject: impl Into<String>, metadata: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            subject: subject.into(),
            metadata,
        }
    }
}

/// Broadcast channel for control-loop events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ControlEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER` to avoid
    /// frequent lag/drop behavior for bursty event streams.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1).max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Never blocks; a send with no subscribers is fine.
    pub fn emit(&self, kind: EventKind, subject: impl Into<String>, metadata: Value) {
        let event = ControlEvent::new(kind, subject, metadata);
        debug!("event {} subject={}", event.kind, event.subject);
        let _ = self.sender.send(event);
    }
}

/// Spawn a task appending every event to a JSONL audit file.
///
/// The writer is decoupled from emitters through the broadcast channel, so
/// slow disks never stall the control loop; lagged events are counted and
/// reported, not waited for.
pub fn spawn_audit_writer(bus: &EventBus, path: PathBuf) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(err) => {
                warn!("Audit log {} unavailable: {}", path.display(), err);
                return;
            }
        };
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Err(err) = file.write_all(line.as_bytes()).await {
                            warn!("Audit log write failed: {}", err);
                        }
                    }
                    Err(err) => warn!("Failed to serialize event: {}", err),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Audit writer lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
