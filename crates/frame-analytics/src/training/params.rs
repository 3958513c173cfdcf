//! Boosting hyperparameters with builder pattern.
//!
//! [`BoostingParams`] is built with `bon`; the finishing function validates
//! the values.
//!
//! ```
//! use frame_analytics::training::BoostingParams;
//!
//! let params = BoostingParams::builder().eta(0.2).max_trees(50).build().unwrap();
//! assert_eq!(params.max_trees, 50);
//! ```

use bon::Builder;
use serde::{Deserialize, Serialize};

/// Invalid hyperparameter values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamsError {
    #[error("{field} must be in (0, 1], got {value}")]
    InvalidFraction { field: &'static str, value: f64 },
    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("max_trees must be at least 1")]
    InvalidMaxTrees,
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(derive(Clone, Debug), finish_fn(vis = "", name = __build_internal))]
pub struct BoostingParams {
    /// Learning rate of the first tree. Default: 0.1.
    #[builder(default = 0.1)]
    pub eta: f64,

    /// Factor applied to the learning rate after each tree. Default: 1.
    #[builder(default = 1.0)]
    pub eta_growth_rate_per_tree: f64,

    /// Number of boosting rounds. Default: 20.
    #[builder(default = 20)]
    pub max_trees: usize,

    /// L2 penalty on leaf values. Default: 1.
    #[builder(default = 1.0)]
    pub lambda: f64,

    /// Penalty per additional leaf. Default: 0.
    #[builder(default = 0.0)]
    pub gamma: f64,

    /// Penalty for splitting beyond the soft depth limit. Default: 0.
    #[builder(default = 0.0)]
    pub alpha: f64,

    #[builder(default = 6.0)]
    pub soft_tree_depth_limit: f64,

    #[builder(default = 0.5)]
    pub soft_tree_depth_tolerance: f64,

    /// Fraction of training rows sampled per tree. Default: 1.
    #[builder(default = 1.0)]
    pub downsample_factor: f64,

    /// Fraction of features considered per tree. Default: 1.
    #[builder(default = 1.0)]
    pub feature_bag_fraction: f64,

    /// Stop after this many rounds without validation improvement.
    pub early_stopping_rounds: Option<usize>,

    #[builder(default = 42)]
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self::builder().__build_internal()
    }
}

impl<S: boosting_params_builder::IsComplete> BoostingParamsBuilder<S> {
    /// Build and validate the parameters.
    pub fn build(self) -> Result<BoostingParams, ParamsError> {
        let params = self.__build_internal();
        params.validate()?;
        Ok(params)
    }
}

impl BoostingParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        for (field, value) in [
            ("eta", self.eta),
            ("downsample_factor", self.downsample_factor),
            ("feature_bag_fraction", self.feature_bag_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ParamsError::InvalidFraction { field, value });
            }
        }
        for (field, value) in [
            ("lambda", self.lambda),
            ("gamma", self.gamma),
            ("alpha", self.alpha),
            ("soft_tree_depth_limit", self.soft_tree_depth_limit),
            ("soft_tree_depth_tolerance", self.soft_tree_depth_tolerance),
        ] {
            if !(value >= 0.0) {
                return Err(ParamsError::Negative { field, value });
            }
        }
        if !(self.eta_growth_rate_per_tree > 0.0) {
            return Err(ParamsError::Invalid(format!(
                "eta_growth_rate_per_tree must be positive, got {}",
                self.eta_growth_rate_per_tree
            )));
        }
        if self.max_trees == 0 {
            return Err(ParamsError::InvalidMaxTrees);
        }
        Ok(())
    }

    /// Deepest level a tree may reach.
    pub fn max_depth(&self) -> usize {
        ((self.soft_tree_depth_limit + 2.0 * self.soft_tree_depth_tolerance).ceil() as usize).max(1)
    }

    /// Gain penalty for splitting a node at `depth`.
    pub fn depth_penalty(&self, depth: usize) -> f64 {
        let excess = (depth as f64 + 1.0 - self.soft_tree_depth_limit).max(0.0);
        if excess == 0.0 || self.alpha == 0.0 {
            return 0.0;
        }
        let tolerance = self.soft_tree_depth_tolerance.max(0.01);
        self.alpha * (excess / tolerance).powi(2)
    }

    /// Learning rate of tree `index` (0 based).
    pub fn eta_for_tree(&self, index: usize) -> f64 {
        self.eta * self.eta_growth_rate_per_tree.powi(index as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let params = BoostingParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.max_trees, 20);
        assert_eq!(params.max_depth(), 7);
        assert_eq!(BoostingParams::builder().build().unwrap(), params);
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(
            BoostingParams::builder().eta(0.0).build(),
            Err(ParamsError::InvalidFraction { field: "eta", value: 0.0 })
        );
        assert_eq!(
            BoostingParams::builder().lambda(-1.0).build(),
            Err(ParamsError::Negative { field: "lambda", value: -1.0 })
        );
        assert_eq!(
            BoostingParams::builder().max_trees(0).build(),
            Err(ParamsError::InvalidMaxTrees)
        );
        assert!(BoostingParams::builder().feature_bag_fraction(1.5).build().is_err());
    }

    #[test]
    fn depth_penalty_and_eta_schedule() {
        let params = BoostingParams::builder()
            .alpha(1.0)
            .soft_tree_depth_limit(2.0)
            .soft_tree_depth_tolerance(1.0)
            .eta(0.5)
            .eta_growth_rate_per_tree(2.0)
            .build()
            .unwrap();
        assert_eq!(params.depth_penalty(0), 0.0);
        assert_eq!(params.depth_penalty(1), 0.0);
        assert_eq!(params.depth_penalty(2), 1.0);
        assert_eq!(params.depth_penalty(3), 4.0);
        assert_eq!(params.eta_for_tree(2), 2.0);
    }
}
