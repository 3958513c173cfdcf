//! Loss functions for boosting.
//!
//! Each loss works on raw scores (one per output) and produces first and
//! second order derivatives for one row at a time.

use serde::{Deserialize, Serialize};

const MIN_HESSIAN: f64 = 1e-6;
const MIN_PROBABILITY: f64 = 1e-7;

/// Loss function of a boosted tree model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossType {
    /// Squared error.
    Mse,
    /// Squared error of `ln(1 + y)`; predictions are `exp(raw)`.
    Msle,
    /// Smooth approximation of absolute error beyond `delta`.
    PseudoHuber { delta: f64 },
    /// Log loss on the positive class logit.
    BinomialLogistic,
    /// Softmax cross entropy over `n_classes` logits.
    MultinomialLogistic { n_classes: usize },
}

impl LossType {
    pub fn name(&self) -> &'static str {
        match self {
            LossType::Mse => "mse",
            LossType::Msle => "msle",
            LossType::PseudoHuber { .. } => "pseudo_huber",
            LossType::BinomialLogistic => "binomial_logistic",
            LossType::MultinomialLogistic { .. } => "multinomial_logistic",
        }
    }

    pub fn n_outputs(&self) -> usize {
        match self {
            LossType::MultinomialLogistic { n_classes } => *n_classes,
            _ => 1,
        }
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, LossType::BinomialLogistic | LossType::MultinomialLogistic { .. })
    }

    /// Write the gradient and hessian of the loss at `raw` for `target`.
    pub fn gradients(&self, raw: &[f64], target: f64, grad: &mut [f64], hess: &mut [f64]) {
        match *self {
            LossType::Mse => {
                grad[0] = raw[0] - target;
                hess[0] = 1.0;
            }
            LossType::Msle => {
                let p = sigmoid(raw[0]);
                let d = softplus(raw[0]) - target.max(0.0).ln_1p();
                grad[0] = d * p;
                hess[0] = (p * p).max(MIN_HESSIAN);
            }
            LossType::PseudoHuber { delta } => {
                let d = raw[0] - target;
                let scale = 1.0 + (d / delta).powi(2);
                let root = scale.sqrt();
                grad[0] = d / root;
                hess[0] = (1.0 / (scale * root)).max(MIN_HESSIAN);
            }
            LossType::BinomialLogistic => {
                let p = sigmoid(raw[0]);
                grad[0] = p - target;
                hess[0] = (p * (1.0 - p)).max(MIN_HESSIAN);
            }
            LossType::MultinomialLogistic { .. } => {
                let probabilities = softmax(raw);
                let class = target as usize;
                for (k, p) in probabilities.into_iter().enumerate() {
                    grad[k] = p - if k == class { 1.0 } else { 0.0 };
                    hess[k] = (p * (1.0 - p)).max(MIN_HESSIAN);
                }
            }
        }
    }

    /// Loss of one row.
    pub fn loss(&self, raw: &[f64], target: f64) -> f64 {
        match *self {
            LossType::Mse => (raw[0] - target).powi(2),
            LossType::Msle => (softplus(raw[0]) - target.max(0.0).ln_1p()).powi(2),
            LossType::PseudoHuber { delta } => {
                let d = raw[0] - target;
                delta * delta * ((1.0 + (d / delta).powi(2)).sqrt() - 1.0)
            }
            LossType::BinomialLogistic => {
                let p = sigmoid(raw[0]).clamp(MIN_PROBABILITY, 1.0 - MIN_PROBABILITY);
                -(target * p.ln() + (1.0 - target) * (1.0 - p).ln())
            }
            LossType::MultinomialLogistic { .. } => {
                let probabilities = softmax(raw);
                let p = probabilities.get(target as usize).copied().unwrap_or(0.0);
                -p.max(MIN_PROBABILITY).ln()
            }
        }
    }

    /// Best constant raw score for `targets`.
    pub fn base_score(&self, targets: &[f64]) -> Vec<f64> {
        if targets.is_empty() {
            return vec![0.0; self.n_outputs()];
        }
        let n = targets.len() as f64;
        match *self {
            LossType::Mse | LossType::PseudoHuber { .. } => vec![targets.iter().sum::<f64>() / n],
            LossType::Msle => {
                let mean_log = targets.iter().map(|y| y.max(0.0).ln_1p()).sum::<f64>() / n;
                vec![mean_log.exp_m1().max(MIN_PROBABILITY).ln()]
            }
            LossType::BinomialLogistic => {
                let p = (targets.iter().sum::<f64>() / n).clamp(MIN_PROBABILITY, 1.0 - MIN_PROBABILITY);
                vec![(p / (1.0 - p)).ln()]
            }
            LossType::MultinomialLogistic { n_classes } => {
                let mut counts = vec![0.0; n_classes];
                for &y in targets {
                    if let Some(count) = counts.get_mut(y as usize) {
                        *count += 1.0;
                    }
                }
                counts
                    .into_iter()
                    .map(|count| (count / n).max(MIN_PROBABILITY).ln())
                    .collect()
            }
        }
    }

    /// Map raw scores to predictions: values for regression, class
    /// probabilities for classification.
    pub fn transform(&self, raw: &[f64]) -> Vec<f64> {
        match self {
            LossType::Mse | LossType::PseudoHuber { .. } => raw.to_vec(),
            LossType::Msle => vec![raw[0].exp()],
            LossType::BinomialLogistic => {
                let p = sigmoid(raw[0]);
                vec![1.0 - p, p]
            }
            LossType::MultinomialLogistic { .. } => softmax(raw),
        }
    }
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
fn softplus(x: f64) -> f64 {
    if x > 30.0 { x } else { x.exp().ln_1p() }
}

pub fn softmax(raw: &[f64]) -> Vec<f64> {
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = raw.iter().map(|x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
