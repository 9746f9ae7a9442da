//! Configuration builders controlling training and artifact locations.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{IftError, Result};

/// Environment variable overriding the pipeline blob path.
pub const MODEL_PATH_ENV: &str = "MODEL_PATH";
/// Environment variable overriding the metrics sidecar path.
pub const METRICS_PATH_ENV: &str = "METRICS_PATH";
/// Default pipeline blob location, relative to the working directory.
pub const DEFAULT_MODEL_PATH: &str = "models/ift_histo_chimique_tot.model.json";
/// Default sidecar location, relative to the working directory.
pub const DEFAULT_METRICS_PATH: &str = "models/ift_histo_chimique_tot.metrics.json";

/// Treatment applied to numeric columns before the regressor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NumericScaling {
    /// Values are passed through unchanged.
    #[default]
    Passthrough,
    /// Values are centred and scaled with statistics from the training split.
    Standardize,
}

/// Hyperparameters of the tree-ensemble regressor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegressorConfig {
    /// Number of regression trees in the ensemble.
    pub n_trees: usize,
    /// Maximum depth of each tree.
    pub max_depth: u32,
    /// Shrinkage applied to each tree's contribution.
    pub learning_rate: f32,
    /// Minimum number of rows per leaf.
    pub min_leaf_size: usize,
}

impl Default for RegressorConfig {
    fn default() -> Self {
        Self {
            n_trees: 300,
            max_depth: 6,
            learning_rate: 0.1,
            min_leaf_size: 1,
        }
    }
}

/// Configuration for a training run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerConfig {
    /// Fraction of cleaned rows held out for evaluation.
    pub test_fraction: f64,
    /// Seed controlling the train/test shuffle.
    pub seed: u64,
    /// Numeric column treatment.
    pub numeric_scaling: NumericScaling,
    /// Drops exact duplicate rows during cleaning.
    pub drop_duplicates: bool,
    /// Enables per-stage logging through the `log` facade.
    pub show_progress: bool,
    /// Regressor hyperparameters.
    pub regressor: RegressorConfig,
}

impl TrainerConfig {
    /// Returns a builder initialised with [`TrainerConfig::default`].
    #[must_use]
    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::default()
    }

    /// Validates the invariants required for training.
    pub fn validate(&self) -> Result<()> {
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(IftError::InvalidConfig(format!(
                "test_fraction ({}) must lie strictly between 0 and 1",
                self.test_fraction
            )));
        }
        if self.regressor.n_trees == 0 {
            return Err(IftError::InvalidConfig(
                "n_trees must be greater than zero".into(),
            ));
        }
        if self.regressor.max_depth == 0 {
            return Err(IftError::InvalidConfig(
                "max_depth must be greater than zero".into(),
            ));
        }
        if !(self.regressor.learning_rate.is_finite() && self.regressor.learning_rate > 0.0) {
            return Err(IftError::InvalidConfig(
                "learning_rate must be a positive number".into(),
            ));
        }
        if self.regressor.min_leaf_size == 0 {
            return Err(IftError::InvalidConfig(
                "min_leaf_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
            numeric_scaling: NumericScaling::Passthrough,
            drop_duplicates: false,
            show_progress: true,
            regressor: RegressorConfig::default(),
        }
    }
}

/// Builder for [`TrainerConfig`].
#[derive(Debug, Default, Clone)]
pub struct TrainerBuilder {
    cfg: TrainerConfig,
}

impl TrainerBuilder {
    /// Creates a builder with [`TrainerConfig::default`] settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the held-out fraction.
    #[must_use]
    pub fn test_fraction(mut self, value: f64) -> Self {
        self.cfg.test_fraction = value;
        self
    }

    /// Sets the split seed.
    #[must_use]
    pub fn seed(mut self, value: u64) -> Self {
        self.cfg.seed = value;
        self
    }

    /// Selects the numeric column treatment.
    #[must_use]
    pub fn numeric_scaling(mut self, value: NumericScaling) -> Self {
        self.cfg.numeric_scaling = value;
        self
    }

    /// Enables or disables duplicate-row removal.
    #[must_use]
    pub fn drop_duplicates(mut self, enabled: bool) -> Self {
        self.cfg.drop_duplicates = enabled;
        self
    }

    /// Enables or disables per-stage logging.
    #[must_use]
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.cfg.show_progress = enabled;
        self
    }

    /// Sets the number of trees.
    #[must_use]
    pub fn n_trees(mut self, value: usize) -> Self {
        self.cfg.regressor.n_trees = value;
        self
    }

    /// Sets the maximum tree depth.
    #[must_use]
    pub fn max_depth(mut self, value: u32) -> Self {
        self.cfg.regressor.max_depth = value;
        self
    }

    /// Sets the shrinkage factor.
    #[must_use]
    pub fn learning_rate(mut self, value: f32) -> Self {
        self.cfg.regressor.learning_rate = value;
        self
    }

    /// Sets the minimum leaf size.
    #[must_use]
    pub fn min_leaf_size(mut self, value: usize) -> Self {
        self.cfg.regressor.min_leaf_size = value;
        self
    }

    /// Finalises the builder, returning a validated [`TrainerConfig`].
    pub fn build(self) -> Result<TrainerConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Locations of the two co-located artifact files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Serialized pipeline blob.
    pub model: PathBuf,
    /// JSON metrics / metadata sidecar.
    pub metrics: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            model: PathBuf::from(DEFAULT_MODEL_PATH),
            metrics: PathBuf::from(DEFAULT_METRICS_PATH),
        }
    }
}

impl ArtifactPaths {
    /// Creates explicit paths.
    pub fn new(model: impl Into<PathBuf>, metrics: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            metrics: metrics.into(),
        }
    }

    /// Resolves paths from `MODEL_PATH` / `METRICS_PATH`, falling back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve(
            env::var_os(MODEL_PATH_ENV).map(PathBuf::from),
            env::var_os(METRICS_PATH_ENV).map(PathBuf::from),
        )
    }

    /// Applies optional overrides on top of the defaults.
    #[must_use]
    pub fn resolve(model: Option<PathBuf>, metrics: Option<PathBuf>) -> Self {
        let defaults = Self::default();
        Self {
            model: model.unwrap_or(defaults.model),
            metrics: metrics.unwrap_or(defaults.metrics),
        }
    }
}
