//! Gradient boosting of regression trees over an encoded feature matrix.
//!
//! Trees are grown depth first with exact greedy split search. Each split
//! tries sending missing values either way and keeps the better direction.

use std::time::{Duration, Instant};

use ndarray::ArrayView2;
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::objectives::LossType;
use super::params::BoostingParams;
use crate::repr::{Forest, Node, Split, Tree};
use crate::utils::Parallelism;

const MIN_CHILD_HESSIAN: f64 = 1e-3;

/// Rows and targets to train on.
#[derive(Debug, Clone, Copy)]
pub struct TrainingData<'a> {
    /// Encoded features of every frame row.
    pub features: ArrayView2<'a, f32>,
    /// Target of every frame row, NaN when missing.
    pub targets: &'a [f64],
    pub train_rows: &'a [usize],
    pub validation_rows: &'a [usize],
}

/// Losses after one boosting round.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub train_loss: f64,
    pub validation_loss: Option<f64>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub forest: Forest,
    pub train_loss: f64,
    pub validation_loss: Option<f64>,
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct BoostedTreeTrainer {
    loss: LossType,
    params: BoostingParams,
}

impl BoostedTreeTrainer {
    pub fn new(loss: LossType, params: BoostingParams) -> Self {
        Self { loss, params }
    }

    pub fn loss(&self) -> LossType {
        self.loss
    }

    pub fn params(&self) -> &BoostingParams {
        &self.params
    }

    /// Train a forest, continuing from `initial` when given.
    ///
    /// A fresh forest starts with a single leaf tree holding the base score.
    /// `on_iteration` is called after every boosting round.
    pub fn train(
        &self,
        data: &TrainingData<'_>,
        initial: Option<Forest>,
        rng: &mut StdRng,
        parallelism: Parallelism,
        mut on_iteration: impl FnMut(&IterationReport),
    ) -> TrainingOutcome {
        let k = self.loss.n_outputs();
        let n_rows = data.features.nrows();
        let n_features = data.features.ncols();

        let mut forest = match initial {
            Some(forest) => forest,
            None => {
                let targets: Vec<f64> = data.train_rows.iter().map(|&r| data.targets[r]).collect();
                let mut forest = Forest::new(k);
                forest.push_tree(Tree::constant(
                    self.loss.base_score(&targets),
                    data.train_rows.len() as u64,
                ));
                forest
            }
        };
        let trees_before = forest.n_trees();

        let mut raw = vec![0.0; n_rows * k];
        for &row in data.train_rows.iter().chain(data.validation_rows) {
            let features = data.features.row(row).to_vec();
            raw[row * k..(row + 1) * k].copy_from_slice(&forest.predict_raw(&features));
        }

        let mut train_loss = self.mean_loss(data.train_rows, data.targets, &raw);
        let mut validation_loss = self.validation_loss(data, &raw);
        let mut best = (validation_loss.unwrap_or(f64::INFINITY), forest.n_trees());
        let mut grad = vec![0.0; n_rows * k];
        let mut hess = vec![0.0; n_rows * k];
        let mut iterations = 0;

        for iteration in 0..self.params.max_trees {
            let started = Instant::now();
            for &row in data.train_rows {
                let range = row * k..(row + 1) * k;
                self.loss.gradients(
                    &raw[range.clone()],
                    data.targets[row],
                    &mut grad[range.clone()],
                    &mut hess[range],
                );
            }

            let rows = self.sample_rows(data.train_rows, rng);
            let bag = self.feature_bag(n_features, rng);
            let grower = TreeGrower {
                features: data.features.view(),
                grad: &grad,
                hess: &hess,
                k,
                params: &self.params,
                bag: &bag,
                eta: self.params.eta_for_tree(iteration),
                parallelism,
            };
            let mut nodes = Vec::new();
            grower.grow(rows, 0, &mut nodes);
            let tree = Tree::new(nodes);

            for &row in data.train_rows.iter().chain(data.validation_rows) {
                let features = data.features.row(row).to_vec();
                tree.predict_into(&features, &mut raw[row * k..(row + 1) * k]);
            }
            forest.push_tree(tree);
            iterations += 1;

            train_loss = self.mean_loss(data.train_rows, data.targets, &raw);
            validation_loss = self.validation_loss(data, &raw);
            on_iteration(&IterationReport {
                iteration,
                train_loss,
                validation_loss,
                elapsed: started.elapsed(),
            });

            if let (Some(rounds), Some(loss)) = (self.params.early_stopping_rounds, validation_loss) {
                if loss < best.0 {
                    best = (loss, forest.n_trees());
                } else if forest.n_trees() - best.1 >= rounds {
                    tracing::debug!(iteration, best_trees = best.1, "stopping early");
                    forest.truncate(best.1.max(trees_before));
                    validation_loss = Some(best.0);
                    break;
                }
            }
        }

        TrainingOutcome {
            forest,
            train_loss,
            validation_loss,
            iterations,
        }
    }

    fn mean_loss(&self, rows: &[usize], targets: &[f64], raw: &[f64]) -> f64 {
        if rows.is_empty() {
            return 0.0;
        }
        let k = self.loss.n_outputs();
        let total: f64 = rows
            .iter()
            .map(|&row| self.loss.loss(&raw[row * k..(row + 1) * k], targets[row]))
            .sum();
        total / rows.len() as f64
    }

    fn validation_loss(&self, data: &TrainingData<'_>, raw: &[f64]) -> Option<f64> {
        (!data.validation_rows.is_empty())
            .then(|| self.mean_loss(data.validation_rows, data.targets, raw))
    }

    fn sample_rows(&self, train_rows: &[usize], rng: &mut StdRng) -> Vec<usize> {
        if self.params.downsample_factor >= 1.0 {
            return train_rows.to_vec();
        }
        let sample: Vec<usize> = train_rows
            .iter()
            .copied()
            .filter(|_| rng.random::<f64>() < self.params.downsample_factor)
            .collect();
        if sample.len() < 2 { train_rows.to_vec() } else { sample }
    }

    fn feature_bag(&self, n_features: usize, rng: &mut StdRng) -> Vec<usize> {
        let mut features: Vec<usize> = (0..n_features).collect();
        if self.params.feature_bag_fraction < 1.0 && n_features > 1 {
            let size = ((self.params.feature_bag_fraction * n_features as f64).ceil() as usize).max(1);
            features.shuffle(rng);
            features.truncate(size);
            features.sort_unstable();
        }
        features
    }
}

// =============================================================================
// Tree Growing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct SplitCandidate {
    feature: usize,
    threshold: f32,
    default_left: bool,
    gain: f64,
}

struct TreeGrower<'a> {
    features: ArrayView2<'a, f32>,
    grad: &'a [f64],
    hess: &'a [f64],
    k: usize,
    params: &'a BoostingParams,
    bag: &'a [usize],
    eta: f64,
    parallelism: Parallelism,
}

impl TreeGrower<'_> {
    /// Grow the subtree for `rows`, appending nodes in pre-order. Returns
    /// the index of the subtree root.
    fn grow(&self, rows: Vec<usize>, depth: usize, nodes: &mut Vec<Node>) -> usize {
        let (g, h) = self.sums(&rows);
        let value = g
            .iter()
            .zip(&h)
            .map(|(g, h)| -g / (h + self.params.lambda) * self.eta)
            .collect();
        let index = nodes.len();
        nodes.push(Node::leaf(value, rows.len() as u64));

        if depth >= self.params.max_depth() || rows.len() < 2 {
            return index;
        }
        let Some(best) = self.find_best_split(&rows, &g, &h, depth) else {
            return index;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = rows.into_iter().partition(|&row| {
            let value = self.features[[row, best.feature]];
            if value.is_nan() { best.default_left } else { value < best.threshold }
        });
        if left.is_empty() || right.is_empty() {
            return index;
        }
        let left_index = self.grow(left, depth + 1, nodes);
        let right_index = self.grow(right, depth + 1, nodes);
        nodes[index].split = Some(Split {
            feature: best.feature,
            threshold: best.threshold,
            default_left: best.default_left,
            gain: best.gain,
            left: left_index,
            right: right_index,
        });
        index
    }

    fn sums(&self, rows: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let mut g = vec![0.0; self.k];
        let mut h = vec![0.0; self.k];
        for &row in rows {
            self.add_row(row, &mut g, &mut h);
        }
        (g, h)
    }

    #[inline]
    fn add_row(&self, row: usize, g: &mut [f64], h: &mut [f64]) {
        for j in 0..self.k {
            g[j] += self.grad[row * self.k + j];
            h[j] += self.hess[row * self.k + j];
        }
    }

    fn score(&self, g: &[f64], h: &[f64]) -> f64 {
        g.iter().zip(h).map(|(g, h)| g * g / (h + self.params.lambda)).sum()
    }

    fn find_best_split(&self, rows: &[usize], g: &[f64], h: &[f64], depth: usize) -> Option<SplitCandidate> {
        let penalty = self.params.gamma + self.params.depth_penalty(depth);
        let parent = self.score(g, h);
        let candidates = self.parallelism.maybe_par_map(self.bag.to_vec(), |feature| {
            self.best_split_for_feature(feature, rows, g, h, parent, penalty)
        });
        candidates
            .into_iter()
            .flatten()
            .fold(None, |best: Option<SplitCandidate>, candidate| match best {
                Some(best) if best.gain >= candidate.gain => Some(best),
                _ => Some(candidate),
            })
    }

    fn best_split_for_feature(
        &self,
        feature: usize,
        rows: &[usize],
        g: &[f64],
        h: &[f64],
        parent: f64,
        penalty: f64,
    ) -> Option<SplitCandidate> {
        let mut present: Vec<(f32, usize)> = rows
            .iter()
            .filter_map(|&row| {
                let value = self.features[[row, feature]];
                (!value.is_nan()).then_some((value, row))
            })
            .collect();
        if present.len() < 2 {
            return None;
        }
        present.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (g_present, h_present) = self.sums(&present.iter().map(|&(_, r)| r).collect::<Vec<_>>());
        let g_missing: Vec<f64> = g.iter().zip(&g_present).map(|(a, b)| a - b).collect();
        let h_missing: Vec<f64> = h.iter().zip(&h_present).map(|(a, b)| a - b).collect();
        let has_missing = present.len() < rows.len();

        let mut best: Option<SplitCandidate> = None;
        let mut g_left = vec![0.0; self.k];
        let mut h_left = vec![0.0; self.k];
        let mut g_l = vec![0.0; self.k];
        let mut h_l = vec![0.0; self.k];
        let mut g_r = vec![0.0; self.k];
        let mut h_r = vec![0.0; self.k];

        for i in 0..present.len() - 1 {
            self.add_row(present[i].1, &mut g_left, &mut h_left);
            let (lower, upper) = (present[i].0, present[i + 1].0);
            if lower == upper {
                continue;
            }
            let directions: &[bool] = if has_missing { &[true, false] } else { &[true] };
            for &default_left in directions {
                for j in 0..self.k {
                    let (gm, hm) = if default_left { (g_missing[j], h_missing[j]) } else { (0.0, 0.0) };
                    g_l[j] = g_left[j] + gm;
                    h_l[j] = h_left[j] + hm;
                    g_r[j] = g[j] - g_l[j];
                    h_r[j] = h[j] - h_l[j];
                }
                if h_l.iter().sum::<f64>() < MIN_CHILD_HESSIAN || h_r.iter().sum::<f64>() < MIN_CHILD_HESSIAN {
                    continue;
                }
                let gain = 0.5 * (self.score(&g_l, &h_l) + self.score(&g_r, &h_r) - parent) - penalty;
                if gain > 0.0 && best.is_none_or(|b| gain > b.gain) {
                    let mid = lower + (upper - lower) / 2.0;
                    let threshold = if mid > lower { mid } else { upper };
                    best = Some(SplitCandidate { feature, threshold, default_left, gain });
                }
            }
        }
        best
    }
}
