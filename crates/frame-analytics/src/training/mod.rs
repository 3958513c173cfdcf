//! Boosted tree training: losses, parameters, input encoding and the
//! tree growing loop.

mod encoder;
mod importance;
mod model;
mod objectives;
mod params;
mod trainer;

pub use encoder::{CategoryEncoder, EncodedFeature, EncoderSettings};
pub use importance::{PathAttribution, path_attribution};
pub use model::BoostedTreeModel;
pub use objectives::{LossType, sigmoid, softmax};
pub use params::{BoostingParams, BoostingParamsBuilder, ParamsError};
pub use trainer::{BoostedTreeTrainer, IterationReport, TrainingData, TrainingOutcome};
