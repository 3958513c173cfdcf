//! Per-analysis statistics reported alongside progress and memory.

use serde::Serialize;

/// Statistics of the running analysis, written under `analysis_stats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AnalysisStats {
    #[default]
    None,
    Outliers(OutliersStats),
    Training(TrainingStats),
}

impl AnalysisStats {
    /// Key of the stats document, `None` if nothing has been recorded.
    pub fn document_name(&self) -> Option<&'static str> {
        match self {
            AnalysisStats::None => None,
            AnalysisStats::Outliers(_) => Some("outlier_detection_stats"),
            AnalysisStats::Training(stats) => Some(match stats.kind {
                TrainingKind::Regression => "regression_stats",
                TrainingKind::Classification => "classification_stats",
            }),
        }
    }
}

// =============================================================================
// Outlier Detection
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutliersStats {
    pub parameters: OutlierParametersRecord,
    pub timing_stats: TimingStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutlierParametersRecord {
    pub n_neighbors: usize,
    pub methods: Vec<String>,
    pub compute_feature_influence: bool,
    pub feature_influence_threshold: f64,
    pub outlier_fraction: f64,
    pub standardization_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingStats {
    /// Milliseconds since the analysis started.
    pub elapsed_time: u64,
    /// Milliseconds spent in the last iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_time: Option<u64>,
}

// =============================================================================
// Boosted Tree Training
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingKind {
    #[default]
    Regression,
    Classification,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingStats {
    #[serde(skip)]
    pub kind: TrainingKind,
    pub iteration: usize,
    pub hyperparameters: HyperparametersRecord,
    pub validation_loss: ValidationLoss,
    pub timing_stats: TimingStats,
}

/// Hyperparameters in effect for the current iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HyperparametersRecord {
    pub alpha: f64,
    pub lambda: f64,
    pub gamma: f64,
    pub eta: f64,
    pub eta_growth_rate_per_tree: f64,
    pub soft_tree_depth_limit: f64,
    pub soft_tree_depth_tolerance: f64,
    pub downsample_factor: f64,
    pub feature_bag_fraction: f64,
    pub max_trees: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_assignment_objective: Option<String>,
    pub max_optimization_rounds_per_hyperparameter: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationLoss {
    pub loss_type: String,
    pub fold_values: Vec<FoldLoss>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FoldLoss {
    pub fold: usize,
    pub values: Vec<f64>,
}

impl TrainingStats {
    pub fn new(kind: TrainingKind, loss_type: impl Into<String>) -> Self {
        Self {
            kind,
            validation_loss: ValidationLoss {
                loss_type: loss_type.into(),
                fold_values: Vec::new(),
            },
            ..Self::default()
        }
    }

    /// Record the loss of `fold` after the current iteration.
    pub fn add_fold_loss(&mut self, fold: usize, loss: f64) {
        match self
            .validation_loss
            .fold_values
            .iter_mut()
            .find(|f| f.fold == fold)
        {
            Some(entry) => entry.values.push(loss),
            None => self.validation_loss.fold_values.push(FoldLoss {
                fold,
                values: vec![loss],
            }),
        }
    }
}
