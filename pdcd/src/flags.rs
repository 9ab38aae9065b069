//! In-memory flag registry with durable persistence.
//!
//! The registry is the single owner of flag mutation: the rollout engine
//! adjusts weights through it, the evaluator reads through it, and every
//! mutation is persisted and announced on the event bus.

use crate::store::{FLAGS_DOC, StateStore};
use pdc_common::{ControlError, EvalContext, EventBus, EventKind, FeatureFlag, FlagKey};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Shared flag registry.
#[derive(Clone)]
pub struct FlagStore {
    flags: Arc<RwLock<HashMap<FlagKey, FeatureFlag>>>,
    store: StateStore,
    bus: EventBus,
}

impl FlagStore {
    /// Create a registry, loading any persisted flags.
    pub fn open(store: StateStore, bus: EventBus) -> Result<Self, ControlError> {
        let flags: HashMap<FlagKey, FeatureFlag> =
            store.load(FLAGS_DOC)?.unwrap_or_default();
        if !flags.is_empty() {
            info!("Loaded {} persisted flags", flags.len());
        }
        Ok(Self {
            flags: Arc::new(RwLock::new(flags)),
            store,
            bus,
        })
    }

    /// Register a new flag. Fails if the key is taken.
    pub async fn create(&self, flag: FeatureFlag) -> Result<(), ControlError> {
        let key = flag.key.clone();
        {
            let mut flags = self.flags.write().await;
            if flags.contains_key(&key) {
                return Err(ControlError::Configuration(format!(
                    "flag '{key}' already exists"
                )));
            }
            flags.insert(key.clone(), flag);
        }
        self.persist().await;
        self.bus.emit(EventKind::FlagCreated, key.as_str(), json!({}));
        Ok(())
    }

    /// Evaluate a flag for a context.
    pub async fn evaluate(&self, key: &FlagKey, context: &EvalContext) -> Result<Value, ControlError> {
        let flags = self.flags.read().await;
        let flag = flags
            .get(key)
            .ok_or_else(|| ControlError::UnknownFlag(key.to_string()))?;
        Ok(flag.evaluate(context))
    }

    pub async fn get(&self, key: &FlagKey) -> Option<FeatureFlag> {
        self.flags.read().await.get(key).cloned()
    }

    /// Atomically reshape a flag's rollout weights to a new percentage.
    pub async fn set_percentage(&self, key: &FlagKey, percentage: f64) -> Result<(), ControlError> {
        {
            let mut flags = self.flags.write().await;
            let flag = flags
                .get_mut(key)
                .ok_or_else(|| ControlError::UnknownFlag(key.to_string()))?;
            flag.set_rollout_percentage(percentage);
        }
        self.persist().await;
        self.bus.emit(
            EventKind::FlagUpdated,
            key.as_str(),
            json!({ "rollout_percentage": percentage }),
        );
        Ok(())
    }

    /// Remove a flag (deployment cleanup).
    pub async fn delete(&self, key: &FlagKey) -> Result<FeatureFlag, ControlError> {
        let removed = {
            let mut flags = self.flags.write().await;
            flags
                .remove(key)
                .ok_or_else(|| ControlError::UnknownFlag(key.to_string()))?
        };
        self.persist().await;
        self.bus.emit(EventKind::FlagDeleted, key.as_str(), json!({}));
        Ok(removed)
    }

    pub async fn keys(&self) -> Vec<FlagKey> {
        self.flags.read().await.keys().cloned().collect()
    }

    async fn persist(&self) {
        let snapshot = self.flags.read().await.clone();
        self.store.save_best_effort(FLAGS_DOC, &snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (FlagStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let flags = FlagStore::open(store, EventBus::default()).unwrap();
        (flags, dir)
    }

    #[tokio::test]
    async fn create_evaluate_and_update_percentage() {
        let (flags, _dir) = harness();
        let key = FlagKey::new("rollout_checkout");
        flags
            .create(FeatureFlag::percentage_rollout(key.clone(), "production", 0.0))
            .await
            .unwrap();

        let value = flags
            .evaluate(&key, &EvalContext::for_user("user-1"))
            .await
            .unwrap();
        assert_eq!(value, json!(false));

        flags.set_percentage(&key, 100.0).await.unwrap();
        let value = flags
            .evaluate(&key, &EvalContext::for_user("user-1"))
            .await
            .unwrap();
        assert_eq!(value, json!(true));
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (flags, _dir) = harness();
        let key = FlagKey::new("rollout_checkout");
        let flag = FeatureFlag::percentage_rollout(key.clone(), "production", 5.0);
        flags.create(flag.clone()).await.unwrap();
        assert!(matches!(
            flags.create(flag).await,
            Err(ControlError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn flags_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = FlagKey::new("rollout_search");
        {
            let store = StateStore::open(dir.path()).unwrap();
            let flags = FlagStore::open(store, EventBus::default()).unwrap();
            flags
                .create(FeatureFlag::percentage_rollout(key.clone(), "production", 25.0))
                .await
                .unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        let flags = FlagStore::open(store, EventBus::default()).unwrap();
        let flag = flags.get(&key).await.expect("flag should be persisted");
        assert_eq!(flag.rollout_percentage, 25.0);
    }

    #[tokio::test]
    async fn unknown_flag_errors() {
        let (flags, _dir) = harness();
        let err = flags
            .evaluate(&FlagKey::new("absent"), &EvalContext::for_user("u"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownFlag(_)));
    }
}
