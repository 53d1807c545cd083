use crate::core::activations::sigmoid;
use crate::core::losses::{criteria, softmax_rows};
use crate::core::{Loss, OptimizerType, TrainOp};
use crate::features::{Features, Labels};
use crate::metrics::{DefaultMetric, EvalInputs};
use crate::model_fn::{ModelFnOps, OutputAlternative, PredictionKey, Predictions, ProblemType};
use crate::prelude::*;
use crate::summary::Summary;
use crate::utils::argmax_rows;
use crate::variables::{Initializer, Partitioner, VariableStore};

pub const CENTERED_BIAS_WEIGHT: &str = "centered_bias_weight";
const CENTERED_BIAS_LEARNING_RATE: f64 = 0.1;
const HEAD_KEY: &str = "head";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum HeadKind {
    MultiClass { n_classes: usize },
    BinaryLogistic,
    Regression { label_dimension: usize },
}

/// Turns logits into predictions, a loss, eval inputs and a training op.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Head {
    pub kind: HeadKind,
    pub weight_column_name: Option<String>,
    pub enable_centered_bias: bool,
}

impl Head {
    /// Two classes use a single logistic logit.
    pub fn multi_class(n_classes: usize, weight_column_name: Option<&str>, enable_centered_bias: bool) -> Result<Self> {
        let kind = match n_classes {
            0 | 1 => return Err(NNError::InvalidNClasses(n_classes)),
            2 => HeadKind::BinaryLogistic,
            n => HeadKind::MultiClass { n_classes: n },
        };
        Ok(Self {
            kind,
            weight_column_name: weight_column_name.map(str::to_string),
            enable_centered_bias,
        })
    }

    pub fn regression(label_dimension: usize, weight_column_name: Option<&str>, enable_centered_bias: bool) -> Result<Self> {
        if label_dimension == 0 {
            return Err(NNError::InvalidLabelDimension(label_dimension));
        }
        Ok(Self {
            kind: HeadKind::Regression { label_dimension },
            weight_column_name: weight_column_name.map(str::to_string),
            enable_centered_bias,
        })
    }

    pub fn logits_dimension(&self) -> usize {
        match self.kind {
            HeadKind::MultiClass { n_classes } => n_classes,
            HeadKind::BinaryLogistic => 1,
            HeadKind::Regression { label_dimension } => label_dimension,
        }
    }

    pub fn n_classes(&self) -> Option<usize> {
        match self.kind {
            HeadKind::MultiClass { n_classes } => Some(n_classes),
            HeadKind::BinaryLogistic => Some(2),
            HeadKind::Regression { .. } => None,
        }
    }

    pub fn loss(&self) -> Loss {
        match self.kind {
            HeadKind::MultiClass { .. } => Loss::SoftmaxCrossEntropy,
            HeadKind::BinaryLogistic => Loss::SigmoidCrossEntropy,
            HeadKind::Regression { .. } => Loss::MeanSquared,
        }
    }

    pub fn problem_type(&self) -> ProblemType {
        match self.kind {
            HeadKind::MultiClass { .. } => ProblemType::Classification,
            HeadKind::BinaryLogistic => ProblemType::LogisticRegression,
            HeadKind::Regression { .. } => ProblemType::LinearRegression,
        }
    }

    pub fn default_metrics(&self) -> Vec<DefaultMetric> {
        match self.kind {
            HeadKind::MultiClass { .. } => vec![DefaultMetric::Loss, DefaultMetric::Accuracy],
            HeadKind::BinaryLogistic => vec![
                DefaultMetric::Loss,
                DefaultMetric::Accuracy,
                DefaultMetric::Auc,
                DefaultMetric::LabelMean,
                DefaultMetric::PredictionMean,
                DefaultMetric::Precision(0.5),
                DefaultMetric::Recall(0.5),
            ],
            HeadKind::Regression { .. } => vec![DefaultMetric::Loss],
        }
    }

    pub fn predictions(&self, logits: &Array2<f64>) -> Predictions {
        let mut predictions = Predictions::new();
        match self.kind {
            HeadKind::MultiClass { .. } => {
                let classes = argmax_rows(logits).mapv(|c| c as f64).insert_axis(Axis(1));
                predictions.insert(PredictionKey::Probabilities, softmax_rows(logits));
                predictions.insert(PredictionKey::Classes, classes);
            }
            HeadKind::BinaryLogistic => {
                let p = logits.mapv(sigmoid);
                let classes = logits.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                let probabilities = Array2::from_shape_fn((logits.nrows(), 2), |(i, j)| {
                    if j == 0 {
                        1.0 - p[[i, 0]]
                    } else {
                        p[[i, 0]]
                    }
                });
                predictions.insert(PredictionKey::Logistic, p);
                predictions.insert(PredictionKey::Probabilities, probabilities);
                predictions.insert(PredictionKey::Classes, classes);
            }
            HeadKind::Regression { .. } => {
                predictions.insert(PredictionKey::Scores, logits.clone());
            }
        }
        if !matches!(self.kind, HeadKind::Regression { .. }) {
            predictions.insert(PredictionKey::Logits, logits.clone());
        }
        predictions
    }

    fn validate_labels(&self, labels: &Labels, batch: usize) -> Result<()> {
        if labels.nrows() != batch {
            return Err(NNError::InvalidLabels(format!(
                "{} label rows for a batch of {}",
                labels.nrows(),
                batch
            )));
        }
        match self.n_classes() {
            Some(n) => {
                if labels.ncols() != 1 {
                    return Err(NNError::InvalidLabels(format!(
                        "class labels must have shape [batch, 1], got {:?}",
                        labels.dim()
                    )));
                }
                if let Some(bad) = labels.iter().find(|&&y| y.fract() != 0.0 || y < 0.0 || y >= n as f64) {
                    return Err(NNError::InvalidLabels(format!("label {bad} is not a class id in [0, {n})")));
                }
            }
            None => {
                if labels.ncols() != self.logits_dimension() {
                    return Err(NNError::InvalidLabels(format!(
                        "expected {} label column(s), got {}",
                        self.logits_dimension(),
                        labels.ncols()
                    )));
                }
            }
        }
        Ok(())
    }

    fn example_weights(&self, features: &Features, batch: usize) -> Result<Array1<f64>> {
        let Some(name) = &self.weight_column_name else {
            return Ok(Array1::ones(batch));
        };
        let weights = features
            .get(name)
            .ok_or_else(|| NNError::MissingFeature(name.clone()))?
            .as_dense(name)?;
        if weights.dim() != (batch, 1) {
            return Err(NNError::InvalidFeature {
                name: name.clone(),
                reason: format!("weights must have shape [{batch}, 1], got {:?}", weights.dim()),
            });
        }
        Ok(weights.column(0).to_owned())
    }

    /// Builds the model-fn result from `logits`. `train_op_fn` receives the
    /// gradient of the training loss with respect to the logits and is only
    /// called in `Mode::Train`.
    pub fn head_ops<F>(
        &self,
        features: &Features,
        labels: Option<&Labels>,
        mode: Mode,
        train_op_fn: F,
        logits: Array2<f64>,
        store: &mut VariableStore,
    ) -> Result<ModelFnOps>
    where
        F: FnOnce(&Array2<f64>) -> Result<TrainOp>,
    {
        let dimension = self.logits_dimension();
        if logits.ncols() != dimension {
            return Err(NNError::LayerShapeMismatch(format!(
                "head expects {} logits, got {}",
                dimension,
                logits.ncols()
            )));
        }

        let mut summaries = Vec::new();
        let (logits, centered_bias) = if self.enable_centered_bias {
            let bias = store
                .get_or_create(CENTERED_BIAS_WEIGHT, (1, dimension), Initializer::Zeros, Partitioner::none())?
                .clone();
            for (i, &b) in bias.iter().enumerate() {
                summaries.push(Summary::scalar(format!("centered_bias/bias_{i}"), b));
            }
            (logits + &bias, Some(bias))
        } else {
            (logits, None)
        };

        let mut ops = ModelFnOps::new(mode, self.predictions(&logits));
        ops.output_alternatives.insert(
            HEAD_KEY.to_string(),
            OutputAlternative {
                problem_type: self.problem_type(),
                outputs: ops.predictions.keys().copied().collect(),
            },
        );
        if mode == Mode::Predict {
            ops.summaries = summaries;
            return Ok(ops);
        }

        let labels = labels.ok_or_else(|| NNError::MissingLabels(mode.to_string()))?;
        let batch = logits.nrows();
        self.validate_labels(labels, batch)?;
        let weights = self.example_weights(features, batch)?;
        let (losses, d_logits) = criteria(&logits, labels, self.loss())?;

        match mode {
            Mode::Train => {
                let loss = (&losses * &weights).mean().unwrap_or(0.0);
                let scale = &weights.view().insert_axis(Axis(1)) / batch as f64;
                let mut train_op = train_op_fn(&(d_logits * &scale))?;
                if let Some(bias) = centered_bias {
                    // the bias alone is fit to the labels
                    let bias_logits = Array2::from_shape_fn((batch, dimension), |(_, j)| bias[[0, j]]);
                    let (_, d_bias) = criteria(&bias_logits, labels, self.loss())?;
                    let grad = (d_bias * &scale).sum_axis(Axis(0)).insert_axis(Axis(0));
                    let bias_op = TrainOp::new(
                        OptimizerType::adagrad(CENTERED_BIAS_LEARNING_RATE),
                        vec![(CENTERED_BIAS_WEIGHT.to_string(), grad)],
                    );
                    train_op = bias_op.then(train_op);
                }
                summaries.push(Summary::scalar("loss", loss));
                ops.loss = Some(loss);
                ops.train_op = Some(train_op);
            }
            Mode::Eval => {
                let total = weights.sum();
                let loss = if total == 0.0 { 0.0 } else { (&losses * &weights).sum() / total };
                ops.loss = Some(loss);
                ops.default_metrics = self.default_metrics();
                ops.eval_inputs = Some(EvalInputs {
                    labels: labels.clone(),
                    weights,
                    example_losses: losses,
                });
            }
            Mode::Predict => {}
        }
        ops.summaries = summaries;
        Ok(ops)
    }
}
