//! Encoding of input columns into numeric model features.
//!
//! Numeric columns pass through. Categorical columns are expanded into
//! one-hot indicators for their frequent categories, a frequency feature
//! and, when the target allows it, a target mean feature.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::repr::ModelVisitor;

/// Categories rarer than this never get an indicator feature.
pub const MIN_ONE_HOT_FREQUENCY: f64 = 0.01;
/// Largest number of indicator features per column.
pub const MAX_ONE_HOT_CATEGORIES: usize = 10;

/// One model feature and how it is derived from its input column.
///
/// Per category maps are indexed by category id; `None` marks categories
/// absent from the training rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncodedFeature {
    Identity { column: usize },
    OneHot { column: usize, category: usize },
    Frequency { column: usize, frequencies: Vec<Option<f64>> },
    TargetMean { column: usize, means: Vec<Option<f64>>, fallback: f64 },
}

impl EncodedFeature {
    pub fn column(&self) -> usize {
        match self {
            EncodedFeature::Identity { column }
            | EncodedFeature::OneHot { column, .. }
            | EncodedFeature::Frequency { column, .. }
            | EncodedFeature::TargetMean { column, .. } => *column,
        }
    }

    fn encode(&self, row: ArrayView1<'_, f32>) -> f32 {
        let value = row[self.column()];
        let category = (!value.is_nan()).then_some(value as usize);
        match self {
            EncodedFeature::Identity { .. } => value,
            EncodedFeature::OneHot { category: hot, .. } => {
                if category == Some(*hot) { 1.0 } else { 0.0 }
            }
            EncodedFeature::Frequency { frequencies, .. } => category
                .and_then(|c| frequencies.get(c).copied().flatten())
                .unwrap_or(0.0) as f32,
            EncodedFeature::TargetMean { means, fallback, .. } => category
                .and_then(|c| means.get(c).copied().flatten())
                .unwrap_or(*fallback) as f32,
        }
    }
}

/// Which encodings to fit.
#[derive(Debug, Clone)]
pub struct EncoderSettings<'a> {
    /// Input columns to encode, in order.
    pub columns: &'a [usize],
    pub categorical: &'a [bool],
    /// Number of categories of each column.
    pub category_counts: &'a [usize],
    pub target_mean: bool,
}

/// Fitted encodings of all feature columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    features: Vec<EncodedFeature>,
}

impl CategoryEncoder {
    pub fn new(features: Vec<EncodedFeature>) -> Self {
        Self { features }
    }

    /// Fit encodings on `training_rows` of `values`.
    ///
    /// `targets[i]` is the target of `training_rows[i]`.
    pub fn fit(
        values: ArrayView2<'_, f32>,
        training_rows: &[usize],
        targets: &[f64],
        settings: &EncoderSettings<'_>,
    ) -> Self {
        let mut features = Vec::new();
        let n = training_rows.len().max(1) as f64;
        let target_mean = targets.iter().sum::<f64>() / targets.len().max(1) as f64;

        for &column in settings.columns {
            if !settings.categorical.get(column).copied().unwrap_or(false) {
                features.push(EncodedFeature::Identity { column });
                continue;
            }

            let n_categories = settings.category_counts.get(column).copied().unwrap_or(0);
            let mut counts = vec![0usize; n_categories];
            let mut sums = vec![0.0; n_categories];
            for (&row, &target) in training_rows.iter().zip(targets) {
                let value = values[[row, column]];
                if value.is_nan() {
                    continue;
                }
                let category = value as usize;
                if category < n_categories {
                    counts[category] += 1;
                    sums[category] += target;
                }
            }

            let mut frequent: Vec<usize> = (0..n_categories)
                .filter(|&c| counts[c] > 0 && counts[c] as f64 / n >= MIN_ONE_HOT_FREQUENCY)
                .collect();
            frequent.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));
            frequent.truncate(MAX_ONE_HOT_CATEGORIES);
            frequent.sort_unstable();
            features.extend(
                frequent
                    .into_iter()
                    .map(|category| EncodedFeature::OneHot { column, category }),
            );

            features.push(EncodedFeature::Frequency {
                column,
                frequencies: counts
                    .iter()
                    .map(|&count| (count > 0).then(|| count as f64 / n))
                    .collect(),
            });

            if settings.target_mean {
                features.push(EncodedFeature::TargetMean {
                    column,
                    means: counts
                        .iter()
                        .zip(&sums)
                        .map(|(&count, &sum)| (count > 0).then(|| sum / count as f64))
                        .collect(),
                    fallback: target_mean,
                });
            }
        }

        Self { features }
    }

    pub fn features(&self) -> &[EncodedFeature] {
        &self.features
    }

    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    /// Input column of each encoded feature.
    pub fn feature_columns(&self) -> Vec<usize> {
        self.features.iter().map(EncodedFeature::column).collect()
    }

    pub fn encode_row(&self, row: ArrayView1<'_, f32>) -> Vec<f32> {
        self.features.iter().map(|f| f.encode(row)).collect()
    }

    /// Encode every row of `values`.
    pub fn encode(&self, values: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut encoded = Array2::zeros((values.nrows(), self.features.len()));
        for (row, mut out) in values.rows().into_iter().zip(encoded.rows_mut()) {
            for (feature, cell) in self.features.iter().zip(out.iter_mut()) {
                *cell = feature.encode(row);
            }
        }
        encoded
    }

    /// Replay the encodings into `visitor`.
    pub fn accept(&self, visitor: &mut dyn ModelVisitor) {
        let dense = |map: &[Option<f64>]| -> Vec<f64> {
            map.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
        };
        for feature in &self.features {
            match feature {
                EncodedFeature::Identity { column } => visitor.add_identity_encoding(*column),
                EncodedFeature::OneHot { column, category } => {
                    visitor.add_one_hot_encoding(*column, *category)
                }
                EncodedFeature::Frequency { column, frequencies } => {
                    visitor.add_frequency_encoding(*column, &dense(frequencies))
                }
                EncodedFeature::TargetMean { column, means, fallback } => {
                    visitor.add_target_mean_encoding(*column, &dense(means), *fallback)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn fit(target_mean: bool) -> CategoryEncoder {
        // Column 1 is categorical with 3 categories; category 2 never
        // appears in the training rows.
        let values = array![
            [1.0, 0.0, 5.0],
            [2.0, 0.0, 6.0],
            [3.0, 1.0, 7.0],
            [4.0, 2.0, 8.0],
        ];
        CategoryEncoder::fit(
            values.view(),
            &[0, 1, 2],
            &[1.0, 3.0, 5.0],
            &EncoderSettings {
                columns: &[0, 1],
                categorical: &[false, true, false],
                category_counts: &[0, 3, 0],
                target_mean,
            },
        )
    }

    #[test]
    fn categorical_columns_get_all_encodings() {
        let encoder = fit(true);
        let features = encoder.features();
        assert_eq!(features[0], EncodedFeature::Identity { column: 0 });
        assert_eq!(features[1], EncodedFeature::OneHot { column: 1, category: 0 });
        assert_eq!(features[2], EncodedFeature::OneHot { column: 1, category: 1 });
        let EncodedFeature::Frequency { frequencies, .. } = &features[3] else {
            panic!("expected frequency");
        };
        assert_eq!(frequencies, &vec![Some(2.0 / 3.0), Some(1.0 / 3.0), None]);
        let EncodedFeature::TargetMean { means, fallback, .. } = &features[4] else {
            panic!("expected target mean");
        };
        assert_eq!(means, &vec![Some(2.0), Some(5.0), None]);
        assert_eq!(*fallback, 3.0);
        assert_eq!(encoder.feature_columns(), vec![0, 1, 1, 1, 1]);
    }

    #[test]
    fn target_mean_is_optional() {
        assert_eq!(fit(false).n_features(), 4);
    }

    #[test]
    fn encodes_rows() {
        let encoder = fit(true);
        let row = array![4.0, 2.0, 8.0];
        assert_eq!(encoder.encode_row(row.view()), vec![4.0, 0.0, 0.0, 0.0, 3.0]);
        let row = array![f32::NAN, 1.0, 0.0];
        let encoded = encoder.encode_row(row.view());
        assert!(encoded[0].is_nan());
        assert_eq!(&encoded[1..3], &[0.0, 1.0]);
        assert!((encoded[3] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(encoded[4], 5.0);
    }
}
