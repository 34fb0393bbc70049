use std::sync::Arc;

use anyhow::{Context, Result};
use pievo_core::{
    model::{ModelState, TrainingOutcome},
    storage::{SecureStore, SecureStoreError},
};
use tracing::{info, instrument};

/// Entry name of the persisted model state.
pub const MODEL_KEY: &str = "ai_model.json";

/// Outcome of opening the repository: a persisted state, or the seed default.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenedState {
    /// Nothing persisted yet; nothing was written either.
    Fresh(ModelState),
    Loaded(ModelState),
}

impl OpenedState {
    pub fn is_fresh(&self) -> bool {
        matches!(self, OpenedState::Fresh(_))
    }

    pub fn state(&self) -> &ModelState {
        match self {
            OpenedState::Fresh(state) | OpenedState::Loaded(state) => state,
        }
    }

    pub fn into_state(self) -> ModelState {
        match self {
            OpenedState::Fresh(state) | OpenedState::Loaded(state) => state,
        }
    }
}

/// Model-state repository backed by a `SecureStore` (encrypted at rest).
pub struct SecureStoreModelRepo<S: SecureStore> {
    store: Arc<S>,
}

impl<S: SecureStore> SecureStoreModelRepo<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Open-or-default. Store errors, decryption failures included, are returned as-is.
    #[instrument(skip(self))]
    pub async fn open(&self) -> Result<OpenedState> {
        match self.store.get(MODEL_KEY).await {
            Ok(bytes) => {
                let mut state: ModelState =
                    serde_json::from_slice(&bytes).context("decode model state")?;
                state.normalize();
                Ok(OpenedState::Loaded(state))
            }
            Err(SecureStoreError::NotFound { .. }) => Ok(OpenedState::Fresh(ModelState::default())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn load(&self) -> Result<ModelState> {
        Ok(self.open().await?.into_state())
    }

    /// Persist the full state, replacing whatever was stored.
    #[instrument(skip_all, fields(version = state.version))]
    pub async fn save(&self, state: &ModelState) -> Result<()> {
        let bytes = serde_json::to_vec(state).context("encode model state")?;
        self.store.put(MODEL_KEY, &bytes).await?;
        Ok(())
    }

    /// Record a data point and persist, evolving the model on threshold.
    #[instrument(skip(self))]
    pub async fn add_training_data(&self, data_point: f64) -> Result<(ModelState, TrainingOutcome)> {
        let mut state = self.load().await?;
        let outcome = state.add_training_data(data_point);
        if let TrainingOutcome::Evolved { version } = outcome {
            info!(version, "model evolved");
        }
        self.save(&state).await?;
        Ok((state, outcome))
    }

    #[instrument(skip(self))]
    pub async fn predict(&self, input: f64) -> Result<f64> {
        Ok(self.load().await?.predict(input))
    }

    /// Replace an existing weight and persist. An unknown key fails with
    /// `InvalidKeyError` and leaves storage untouched.
    #[instrument(skip(self))]
    pub async fn update_weight(&self, key: &str, value: i64) -> Result<ModelState> {
        let mut state = self.load().await?;
        state.update_weight(key, value)?;
        self.save(&state).await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pievo_core::{
        model::{InvalidKeyError, EVOLUTION_THRESHOLD, STABILITY, VOLATILITY},
        storage::InMemorySecureStore,
    };
    use pievo_storage::{
        key_provider::{FileKeyProvider, InMemoryKeyProvider},
        secure_file_store::EncryptedFileStore,
    };
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::*;

    #[tokio::test]
    async fn open_on_empty_store_is_fresh_default() {
        let repo = SecureStoreModelRepo::new(InMemorySecureStore::new());
        let opened = repo.open().await.expect("open");
        assert!(opened.is_fresh());
        assert_eq!(opened.state(), &ModelState::default());
        assert!(repo.store().raw(MODEL_KEY).is_none());
    }

    #[tokio::test]
    async fn save_then_open_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(dir.path(), InMemoryKeyProvider::default());
        let repo = SecureStoreModelRepo::new(store);

        let state = ModelState {
            weights: BTreeMap::from([
                (VOLATILITY.to_string(), -4),
                (STABILITY.to_string(), 120),
                ("liquidity".to_string(), 9),
            ]),
            version: 17,
            pi_accuracy: 36,
            training_count: 3,
            extra: BTreeMap::from([("notes".to_string(), json!({"by": "admin"}))]),
        };
        repo.save(&state).await.expect("save");

        let opened = repo.open().await.expect("open");
        assert!(!opened.is_fresh());
        assert_eq!(opened.into_state(), state);
    }

    #[tokio::test]
    async fn ten_additions_evolve_once() {
        let repo = SecureStoreModelRepo::new(InMemorySecureStore::new());
        for _ in 0..9 {
            let (_, outcome) = repo.add_training_data(50.0).await.expect("add");
            assert!(!outcome.evolved());
        }
        let state = repo.load().await.expect("load");
        assert_eq!(state.training_count, 9);
        assert_eq!(state.version, 1);

        let (state, outcome) = repo.add_training_data(50.0).await.expect("add");
        assert_eq!(outcome, TrainingOutcome::Evolved { version: 2 });
        assert_eq!(state.training_count, 0);
        assert_eq!(repo.load().await.expect("reload"), state);
    }

    #[tokio::test]
    async fn version_after_n_events_is_one_plus_n() {
        let repo = SecureStoreModelRepo::new(InMemorySecureStore::new());
        for _ in 0..3 * EVOLUTION_THRESHOLD {
            let (state, _) = repo.add_training_data(1.0).await.expect("add");
            assert!(state.training_count < EVOLUTION_THRESHOLD);
        }
        assert_eq!(repo.load().await.expect("load").version, 4);
    }

    #[tokio::test]
    async fn unknown_weight_leaves_file_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EncryptedFileStore::new(
            dir.path(),
            FileKeyProvider::new(dir.path().join("ai_key.key")),
        );
        let repo = SecureStoreModelRepo::new(store);
        repo.add_training_data(50.0).await.expect("seed file");

        let path = dir.path().join(MODEL_KEY);
        let before = std::fs::read(&path).expect("read before");

        let err = repo
            .update_weight("unknown_field", 5)
            .await
            .expect_err("unknown key");
        assert!(err.downcast_ref::<InvalidKeyError>().is_some());
        assert_eq!(std::fs::read(&path).expect("read after"), before);
    }

    #[tokio::test]
    async fn update_weight_persists_known_key() {
        let repo = SecureStoreModelRepo::new(InMemorySecureStore::new());
        repo.update_weight(VOLATILITY, 80).await.expect("update");
        assert_eq!(repo.load().await.expect("load").weights[VOLATILITY], 80);
    }

    #[tokio::test]
    async fn predict_does_not_write() {
        let repo = SecureStoreModelRepo::new(InMemorySecureStore::new());
        let prediction = repo.predict(2.0).await.expect("predict");
        assert!((prediction - 1.25).abs() < 1e-12);
        assert!(repo.store().raw(MODEL_KEY).is_none());
    }

    #[tokio::test]
    async fn decryption_failure_is_propagated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = SecureStoreModelRepo::new(EncryptedFileStore::new(
            dir.path(),
            InMemoryKeyProvider::with_key([3; 32]),
        ));
        writer.save(&ModelState::default()).await.expect("save");

        let reader = SecureStoreModelRepo::new(EncryptedFileStore::new(
            dir.path(),
            InMemoryKeyProvider::with_key([4; 32]),
        ));
        let err = reader.open().await.expect_err("key mismatch");
        assert!(matches!(
            err.downcast_ref::<SecureStoreError>(),
            Some(SecureStoreError::Decryption { .. })
        ));
    }

    #[tokio::test]
    async fn open_normalizes_missing_base_weights() {
        let store = InMemorySecureStore::new();
        let payload = json!({
            "weights": {},
            "version": 5,
            "pi_accuracy": 250,
            "training_count": 14
        });
        store
            .put(MODEL_KEY, &serde_json::to_vec(&payload).expect("encode"))
            .await
            .expect("put");

        let state = SecureStoreModelRepo::new(store).load().await.expect("load");
        assert_eq!(state.weights[VOLATILITY], 50);
        assert_eq!(state.weights[STABILITY], 50);
        assert_eq!(state.version, 5);
        assert_eq!(state.pi_accuracy, 50);
        assert_eq!(state.training_count, 4);
    }

    fn extra_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 12, 4, |inner| {
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect()))
        })
    }

    fn valid_state() -> impl Strategy<Value = ModelState> {
        (
            prop::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 0..6),
            any::<i64>(),
            any::<i64>(),
            any::<u64>(),
            0u8..100,
            0..EVOLUTION_THRESHOLD,
            prop::collection::btree_map("x_[a-z]{1,8}", extra_value(), 0..4),
        )
            .prop_map(
                |(mut weights, volatility, stability, version, pi_accuracy, training_count, extra)| {
                    weights.insert(VOLATILITY.to_string(), volatility);
                    weights.insert(STABILITY.to_string(), stability);
                    ModelState {
                        weights,
                        version,
                        pi_accuracy,
                        training_count,
                        extra,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn any_valid_state_survives_save_and_load(state in valid_state()) {
            let dir = tempfile::tempdir().expect("tempdir");
            let repo = SecureStoreModelRepo::new(EncryptedFileStore::new(
                dir.path(),
                FileKeyProvider::new(dir.path().join("ai_key.key")),
            ));
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");

            runtime.block_on(repo.save(&state)).expect("save");
            let opened = runtime.block_on(repo.open()).expect("open");

            prop_assert!(!opened.is_fresh());
            prop_assert_eq!(opened.into_state(), state);
        }
    }
}
