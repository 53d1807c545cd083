use crate::model_fn::{PredictionKey, Predictions};
use crate::prelude::*;
use std::collections::BTreeMap;

/// `(predictions, labels, weights) -> value`, evaluated over a whole evaluation run.
pub type MetricFn = fn(&Array2<f64>, &Array2<f64>, Option<&Array1<f64>>) -> f64;

/// A metric function bound to the prediction it reads.
#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    pub metric_fn: MetricFn,
    pub prediction_key: PredictionKey,
}

impl MetricSpec {
    pub fn new(metric_fn: MetricFn, prediction_key: PredictionKey) -> Self {
        Self {
            metric_fn,
            prediction_key,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Metric {
    Fn(MetricFn),
    Spec(MetricSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetricKey {
    Name(String),
    /// Metric name and the prediction it reads.
    Pair(String, PredictionKey),
}

impl MetricKey {
    pub fn name(&self) -> &str {
        match self {
            MetricKey::Name(name) | MetricKey::Pair(name, _) => name,
        }
    }
}

pub type Metrics = BTreeMap<MetricKey, Metric>;

/// Labels, weights and per-example losses collected while evaluating.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EvalInputs {
    pub labels: Array2<f64>,
    pub weights: Array1<f64>,
    pub example_losses: Array1<f64>,
}

impl EvalInputs {
    pub fn concat(batches: &[EvalInputs]) -> Result<Self> {
        let labels: Vec<_> = batches.iter().map(|b| b.labels.view()).collect();
        let weights: Vec<_> = batches.iter().map(|b| b.weights.view()).collect();
        let losses: Vec<_> = batches.iter().map(|b| b.example_losses.view()).collect();
        Ok(Self {
            labels: concatenate(Axis(0), &labels)?,
            weights: concatenate(Axis(0), &weights)?,
            example_losses: concatenate(Axis(0), &losses)?,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum DefaultMetric {
    Loss,
    Accuracy,
    Auc,
    LabelMean,
    PredictionMean,
    Precision(f64),
    Recall(f64),
}

impl DefaultMetric {
    pub fn name(&self) -> String {
        match self {
            DefaultMetric::Loss => "loss".into(),
            DefaultMetric::Accuracy => "accuracy".into(),
            DefaultMetric::Auc => "auc".into(),
            DefaultMetric::LabelMean => "labels/actual_label_mean".into(),
            DefaultMetric::PredictionMean => "labels/prediction_mean".into(),
            DefaultMetric::Precision(t) => format!("precision/positive_threshold_{t:.6}_mean"),
            DefaultMetric::Recall(t) => format!("recall/positive_threshold_{t:.6}_mean"),
        }
    }

    pub fn compute(&self, predictions: &Predictions, inputs: &EvalInputs) -> Result<f64> {
        let weights = Some(&inputs.weights);
        let value = match self {
            DefaultMetric::Loss => weighted_mean(inputs.example_losses.view(), weights),
            DefaultMetric::Accuracy => accuracy(prediction(predictions, PredictionKey::Classes)?, &inputs.labels, weights),
            DefaultMetric::Auc => auc(prediction(predictions, PredictionKey::Logistic)?, &inputs.labels, weights),
            DefaultMetric::LabelMean => weighted_mean(inputs.labels.column(0), weights),
            DefaultMetric::PredictionMean => {
                weighted_mean(prediction(predictions, PredictionKey::Logistic)?.column(0), weights)
            }
            DefaultMetric::Precision(t) => {
                let (tp, fp, _) = confusion(prediction(predictions, PredictionKey::Logistic)?, &inputs.labels, weights, *t);
                ratio(tp, tp + fp)
            }
            DefaultMetric::Recall(t) => {
                let (tp, _, fn_) = confusion(prediction(predictions, PredictionKey::Logistic)?, &inputs.labels, weights, *t);
                ratio(tp, tp + fn_)
            }
        };
        Ok(value)
    }
}

pub(crate) fn prediction(predictions: &Predictions, key: PredictionKey) -> Result<&Array2<f64>> {
    predictions
        .get(&key)
        .ok_or_else(|| NNError::UnknownPredictionKey(key.to_string()))
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn weighted_mean(values: ndarray::ArrayView1<f64>, weights: Option<&Array1<f64>>) -> f64 {
    match weights {
        Some(w) => ratio(Zip::from(&values).and(w).fold(0.0, |acc, &v, &w| acc + v * w), w.sum()),
        None => values.mean().unwrap_or(0.0),
    }
}

/// Weighted true positives, false positives and false negatives at `threshold`.
fn confusion(scores: &Array2<f64>, labels: &Array2<f64>, weights: Option<&Array1<f64>>, threshold: f64) -> (f64, f64, f64) {
    let mut counts = (0.0, 0.0, 0.0);
    for (i, (&p, &y)) in scores.column(0).iter().zip(labels.column(0)).enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        match (p > threshold, y > 0.5) {
            (true, true) => counts.0 += w,
            (true, false) => counts.1 += w,
            (false, true) => counts.2 += w,
            (false, false) => {}
        }
    }
    counts
}

/// Fraction (weighted) of examples whose predicted class equals the label.
pub fn accuracy(classes: &Array2<f64>, labels: &Array2<f64>, weights: Option<&Array1<f64>>) -> f64 {
    let hits = Zip::from(classes.column(0))
        .and(labels.column(0))
        .map_collect(|&c, &y| if (c - y).abs() < 0.5 { 1.0 } else { 0.0 });
    weighted_mean(hits.view(), weights)
}

/// Area under the ROC curve, ties counted as half.
pub fn auc(scores: &Array2<f64>, labels: &Array2<f64>, weights: Option<&Array1<f64>>) -> f64 {
    let mut examples: Vec<(f64, bool, f64)> = scores
        .column(0)
        .iter()
        .zip(labels.column(0))
        .enumerate()
        .map(|(i, (&p, &y))| (p, y > 0.5, weights.map_or(1.0, |w| w[i])))
        .collect();
    examples.sort_by(|a, b| a.0.total_cmp(&b.0));

    let (mut area, mut negatives_below, mut positives, mut negatives) = (0.0, 0.0, 0.0, 0.0);
    for group in examples.chunk_by(|a, b| a.0 == b.0) {
        let pos: f64 = group.iter().filter(|e| e.1).map(|e| e.2).sum();
        let neg: f64 = group.iter().filter(|e| !e.1).map(|e| e.2).sum();
        area += pos * (negatives_below + 0.5 * neg);
        negatives_below += neg;
        positives += pos;
        negatives += neg;
    }
    ratio(area, positives * negatives)
}

pub fn mean_squared_error(predictions: &Array2<f64>, labels: &Array2<f64>, weights: Option<&Array1<f64>>) -> f64 {
    let per_example = (predictions - labels).mapv(|d| d * d).mean_axis(Axis(1));
    per_example.map_or(0.0, |e| weighted_mean(e.view(), weights))
}

pub fn mean_absolute_error(predictions: &Array2<f64>, labels: &Array2<f64>, weights: Option<&Array1<f64>>) -> f64 {
    let per_example = (predictions - labels).mapv(f64::abs).mean_axis(Axis(1));
    per_example.map_or(0.0, |e| weighted_mean(e.view(), weights))
}
