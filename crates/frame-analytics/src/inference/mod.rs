//! Portable inference model definitions.
//!
//! A trained model is replayed into an [`InferenceModelBuilder`] through the
//! [`ModelVisitor`](crate::repr::ModelVisitor) callbacks. The resulting
//! [`InferenceModelDefinition`] renders as JSON, as a compressed stream and
//! as a [`ModelSizeInfo`] summary.

mod builder;
mod definition;
pub mod encoding;
mod metadata;
mod size_info;
mod summarization;

pub use builder::{
    Classification, ClassificationModelBuilder, InferenceModelBuilder, ModelTask, Regression,
    RegressionModelBuilder,
};
pub use definition::{
    AggregateOutput, DecisionType, Ensemble, InferenceModelDefinition, NodeKind, TargetType,
    TrainedModel, Tree, TreeNode,
};
pub use encoding::{Encoding, FrequencyEncoding, OneHotEncoding, TargetMeanEncoding};
pub use metadata::{
    HyperparameterImportance, HyperparameterValue, InferenceModelMetadata, PredictionFieldType,
};
pub use size_info::{EncodingSize, EnsembleSize, ModelSizeInfo, TrainedModelSize, TreeSize};
pub use summarization::DataSummarization;
