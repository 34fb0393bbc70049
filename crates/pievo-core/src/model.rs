use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Number of training data points that trigger one evolution event.
pub const EVOLUTION_THRESHOLD: u32 = 10;

/// Fixed pi prefix whose digit sum drives `pi_accuracy`.
pub const PI_PREFIX: &str = "3.14159265";

pub const VOLATILITY: &str = "volatility";
pub const STABILITY: &str = "stability";

const DEFAULT_WEIGHT: i64 = 50;
const DEFAULT_VERSION: u64 = 1;
const DEFAULT_PI_ACCURACY: u8 = 50;
const PI_ACCURACY_MODULUS: u8 = 100;

/// Persisted model state.
///
/// Unknown top-level fields are carried in `extra` so they survive a load/save cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelState {
    /// Named integer weights; always holds `volatility` and `stability` once normalized.
    pub weights: BTreeMap<String, i64>,
    /// Bumped once per evolution event, never decremented.
    pub version: u64,
    /// In `[0, 100)`.
    pub pi_accuracy: u8,
    /// In `[0, EVOLUTION_THRESHOLD)`.
    #[serde(default)]
    pub training_count: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            weights: BTreeMap::from([
                (VOLATILITY.to_string(), DEFAULT_WEIGHT),
                (STABILITY.to_string(), DEFAULT_WEIGHT),
            ]),
            version: DEFAULT_VERSION,
            pi_accuracy: DEFAULT_PI_ACCURACY,
            training_count: 0,
            extra: BTreeMap::new(),
        }
    }
}

/// Returned by `update_weight` when the weight does not already exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid key: {key}")]
pub struct InvalidKeyError {
    pub key: String,
}

/// Result of feeding one data point into the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOutcome {
    /// Counter advanced, no evolution yet.
    Accumulated { training_count: u32 },
    /// Threshold reached; the model moved to `version`.
    Evolved { version: u64 },
}

impl TrainingOutcome {
    pub fn evolved(&self) -> bool {
        matches!(self, TrainingOutcome::Evolved { .. })
    }
}

impl ModelState {
    /// Re-establish invariants on a state decoded from disk.
    pub fn normalize(&mut self) {
        for name in [VOLATILITY, STABILITY] {
            self.weights
                .entry(name.to_string())
                .or_insert(DEFAULT_WEIGHT);
        }
        self.training_count %= EVOLUTION_THRESHOLD;
        self.pi_accuracy %= PI_ACCURACY_MODULUS;
    }

    /// Record one training data point, evolving once the threshold is hit.
    pub fn add_training_data(&mut self, data_point: f64) -> TrainingOutcome {
        self.training_count += 1;
        if self.training_count < EVOLUTION_THRESHOLD {
            return TrainingOutcome::Accumulated {
                training_count: self.training_count,
            };
        }

        self.evolve(data_point);
        TrainingOutcome::Evolved {
            version: self.version,
        }
    }

    fn evolve(&mut self, data_point: f64) {
        self.version = self.version.saturating_add(1);

        // `as` truncates toward zero and saturates, NaN becomes 0.
        let volatility = self
            .weights
            .entry(VOLATILITY.to_string())
            .or_insert(DEFAULT_WEIGHT);
        *volatility = volatility.saturating_add((data_point / 10.0) as i64);

        let stability = self
            .weights
            .entry(STABILITY.to_string())
            .or_insert(DEFAULT_WEIGHT);
        *stability = stability.saturating_sub((data_point / 20.0) as i64);

        self.pi_accuracy = pi_accuracy();
        self.training_count = 0;
    }

    /// Linear stability prediction from the current weights.
    pub fn predict(&self, input: f64) -> f64 {
        let volatility = self.weight(VOLATILITY) as f64 / 100.0;
        let stability = self.weight(STABILITY) as f64 / 100.0;
        let pi_factor = f64::from(self.pi_accuracy) / 100.0;

        input * volatility + stability * pi_factor
    }

    /// Overwrite an existing weight. New weight names are rejected.
    pub fn update_weight(&mut self, key: &str, value: i64) -> Result<(), InvalidKeyError> {
        match self.weights.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(InvalidKeyError {
                key: key.to_string(),
            }),
        }
    }

    fn weight(&self, name: &str) -> i64 {
        self.weights.get(name).copied().unwrap_or(DEFAULT_WEIGHT)
    }
}

/// Digit sum of `PI_PREFIX` modulo 100. Independent of any training data.
pub fn pi_accuracy() -> u8 {
    let sum: u32 = PI_PREFIX.chars().filter_map(|c| c.to_digit(10)).sum();
    (sum % u32::from(PI_ACCURACY_MODULUS)) as u8
}
