pub use serde::{Deserialize, Serialize};

pub use ndarray::{array, concatenate, s, Array1, Array2, ArrayD, Axis, IxDyn, Zip};
pub use ndarray_rand::rand_distr::{Normal, Uniform};
pub use ndarray_rand::RandomExt;

pub use crate::error::*;

// Internal re-exports
pub use crate::config::RunConfig;
pub use crate::core::{Activation, Dense, Dropout, LayerTrait, Loss, OptimizerSpec, OptimizerType};
pub use crate::features::{FeatureColumn, FeatureInput, Features, Labels, SparseTensor, Tensor};
pub use crate::head::Head;
pub use crate::model_fn::{Mode, ModelFnOps, PredictionKey, Predictions};
pub use crate::variables::VariableStore;
