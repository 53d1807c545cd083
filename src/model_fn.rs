use crate::core::TrainOp;
use crate::features::{FeatureInput, Labels};
use crate::metrics::{DefaultMetric, EvalInputs};
use crate::prelude::*;
use crate::summary::Summary;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
            Mode::Predict => "infer",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PredictionKey {
    Logits,
    Logistic,
    Probabilities,
    Classes,
    Scores,
}

impl PredictionKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionKey::Logits => "logits",
            PredictionKey::Logistic => "logistic",
            PredictionKey::Probabilities => "probabilities",
            PredictionKey::Classes => "classes",
            PredictionKey::Scores => "scores",
        }
    }
}

impl fmt::Display for PredictionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionKey {
    type Err = NNError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "logits" => Ok(PredictionKey::Logits),
            "logistic" => Ok(PredictionKey::Logistic),
            "probabilities" => Ok(PredictionKey::Probabilities),
            "classes" => Ok(PredictionKey::Classes),
            "scores" => Ok(PredictionKey::Scores),
            other => Err(NNError::UnknownPredictionKey(other.to_string())),
        }
    }
}

/// Every prediction is a `[batch, k]` array; class ids are stored as floats.
pub type Predictions = BTreeMap<PredictionKey, Array2<f64>>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemType {
    Classification,
    LogisticRegression,
    LinearRegression,
}

/// A named view over the predictions used when exporting signatures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputAlternative {
    pub problem_type: ProblemType,
    pub outputs: Vec<PredictionKey>,
}

/// Everything the estimator needs from one invocation of a model function.
#[derive(Debug, Clone)]
pub struct ModelFnOps {
    pub mode: Mode,
    pub predictions: Predictions,
    pub loss: Option<f64>,
    pub train_op: Option<TrainOp>,
    pub eval_inputs: Option<EvalInputs>,
    pub default_metrics: Vec<DefaultMetric>,
    pub output_alternatives: BTreeMap<String, OutputAlternative>,
    pub summaries: Vec<Summary>,
}

impl ModelFnOps {
    pub fn new(mode: Mode, predictions: Predictions) -> Self {
        Self {
            mode,
            predictions,
            loss: None,
            train_op: None,
            eval_inputs: None,
            default_metrics: Vec::new(),
            output_alternatives: BTreeMap::new(),
            summaries: Vec::new(),
        }
    }
}

/// Builds the model for one batch. Variables are read from (and created in)
/// the store by name on every call.
pub type ModelFn<P> = fn(
    FeatureInput,
    Option<&Labels>,
    Mode,
    &P,
    Option<&RunConfig>,
    &mut VariableStore,
) -> Result<ModelFnOps>;
