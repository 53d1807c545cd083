extern crate plotters;

pub mod config;
pub mod core;
pub mod dnn;
pub mod error;
pub mod estimator;
pub mod export;
pub mod features;
pub mod head;
pub mod metrics;
pub mod model_fn;
pub mod models;
pub mod prelude;
pub mod summary;
pub mod utils;
pub mod variables;

// Re-export types
pub use crate::config::RunConfig;
pub use crate::core::{Activation, OptimizerSpec, OptimizerType};
pub use crate::dnn::{dnn_model_fn, DnnParams};
pub use crate::error::{NNError, Result};
pub use crate::estimator::{ArrayInput, Batch, Estimator, InputFn, LossHistory, StopAtStep, TrainingHook};
pub use crate::export::{ExportOptions, ExportedModel, ServingInput, Signature};
pub use crate::head::Head;
pub use crate::model_fn::{Mode, ModelFnOps, PredictionKey};
pub use crate::models::{DnnClassifier, DnnRegressor};

pub mod plot {
    pub mod plot_loss_history;
}
