use crate::features::tensor::{batch_size, select_rows};
use crate::features::{FeatureInput, Features, Labels};
use crate::metrics::{prediction, EvalInputs, Metric, MetricKey, Metrics};
use crate::model_fn::{Mode, ModelFn, ModelFnOps, PredictionKey, Predictions};
use crate::plot::plot_loss_history::plot_loss_history;
use crate::prelude::*;
use crate::summary::{write_results, write_summaries};
use crate::variables::VariableStore;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CHECKPOINT_STATE: &str = "checkpoint";
const SUMMARIES_FILE: &str = "summaries.csv";

/// One batch of features and (optional) labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: FeatureInput,
    pub labels: Option<Labels>,
}

/// Source of batches; `Ok(None)` signals the end of input.
pub trait InputFn {
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

impl<F> InputFn for F
where
    F: FnMut() -> Result<Option<Batch>>,
{
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        self()
    }
}

/// Batches over in-memory features, optionally shuffled and repeated.
#[derive(Debug, Clone)]
pub struct ArrayInput {
    features: Features,
    labels: Option<Labels>,
    batch_size: usize,
    num_epochs: Option<usize>,
    rng: Option<StdRng>,
    order: Vec<usize>,
    position: usize,
    epoch: usize,
}

impl ArrayInput {
    pub fn new(features: impl Into<FeatureInput>, labels: Option<Labels>) -> Result<Self> {
        let features = features.into().into_feature_dict();
        let n = batch_size(&features)?;
        if let Some(labels) = &labels {
            if labels.nrows() != n {
                return Err(NNError::InvalidInputShape(format!(
                    "{} label rows for {} examples",
                    labels.nrows(),
                    n
                )));
            }
        }
        Ok(Self {
            features,
            labels,
            batch_size: 128,
            num_epochs: Some(1),
            rng: None,
            order: (0..n).collect(),
            position: 0,
            epoch: 0,
        })
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// `None` repeats forever.
    pub fn num_epochs(mut self, num_epochs: Option<usize>) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self.rng = Some(rng);
        self
    }
}

impl InputFn for ArrayInput {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.order.is_empty() {
            return Ok(None);
        }
        if self.position >= self.order.len() {
            self.epoch += 1;
            self.position = 0;
            if let Some(rng) = self.rng.as_mut() {
                self.order.shuffle(rng);
            }
        }
        if self.num_epochs.is_some_and(|n| self.epoch >= n) {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let idx = &self.order[self.position..end];
        self.position = end;
        Ok(Some(Batch {
            features: FeatureInput::Map(select_rows(&self.features, idx)),
            labels: self.labels.as_ref().map(|l| l.select(Axis(0), idx)),
        }))
    }
}

/// Observes training; `after_step` returning `true` stops training.
pub trait TrainingHook {
    fn begin(&mut self, _global_step: u64) {}

    fn after_step(&mut self, _global_step: u64, _loss: f64) -> bool {
        false
    }

    fn end(&mut self, _global_step: u64) {}
}

pub struct StopAtStep {
    pub last_step: u64,
}

impl TrainingHook for StopAtStep {
    fn after_step(&mut self, global_step: u64, _loss: f64) -> bool {
        global_step >= self.last_step
    }
}

/// Records the loss of every step.
#[derive(Debug, Default, Clone)]
pub struct LossHistory {
    pub losses: Vec<(u64, f64)>,
}

impl LossHistory {
    pub fn plot<Q: AsRef<Path>>(&self, filename: Q) -> Result<()> {
        plot_loss_history(&self.losses, filename)
    }
}

impl TrainingHook for LossHistory {
    fn after_step(&mut self, global_step: u64, loss: f64) -> bool {
        self.losses.push((global_step, loss));
        false
    }
}

pub type FeatureEngineeringFn = Arc<dyn Fn(Features, Option<Labels>) -> Result<(Features, Option<Labels>)> + Send + Sync>;

/// Model function and everything it is invoked with, apart from the variables.
struct Model<P> {
    model_fn: ModelFn<P>,
    params: P,
    config: RunConfig,
    feature_engineering_fn: Option<FeatureEngineeringFn>,
}

impl<P> Model<P> {
    fn call(
        &self,
        features: FeatureInput,
        labels: Option<Labels>,
        mode: Mode,
        store: &mut VariableStore,
    ) -> Result<ModelFnOps> {
        let (features, labels) = match &self.feature_engineering_fn {
            Some(f) => {
                let (features, labels) = f(features.into_feature_dict(), labels)?;
                (FeatureInput::Map(features), labels)
            }
            None => (features, labels),
        };
        (self.model_fn)(features, labels.as_ref(), mode, &self.params, Some(&self.config), store)
    }
}

/// Train / evaluate / predict / export lifecycle around a model function.
pub struct Estimator<P> {
    model: Model<P>,
    model_dir: Option<PathBuf>,
    store: VariableStore,
}

impl<P: Serialize> Estimator<P> {
    /// Restores the latest checkpoint in `model_dir` if there is one.
    /// Without a `model_dir` nothing is written to disk.
    pub fn new(model_fn: ModelFn<P>, params: P, model_dir: Option<PathBuf>, config: Option<RunConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();
        let store = match model_dir.as_deref() {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                match latest_checkpoint(dir)? {
                    Some(path) => {
                        info!(checkpoint = %path.display(), "restoring parameters");
                        VariableStore::load(path)?
                    }
                    None => VariableStore::new(config.tf_random_seed),
                }
            }
            None => VariableStore::new(config.tf_random_seed),
        };
        Ok(Self {
            model: Model {
                model_fn,
                params,
                config,
                feature_engineering_fn: None,
            },
            model_dir,
            store,
        })
    }

    pub fn with_feature_engineering_fn(mut self, f: FeatureEngineeringFn) -> Self {
        self.model.feature_engineering_fn = Some(f);
        self
    }

    pub fn params(&self) -> &P {
        &self.model.params
    }

    pub fn config(&self) -> &RunConfig {
        &self.model.config
    }

    pub fn model_dir(&self) -> Option<&Path> {
        self.model_dir.as_deref()
    }

    pub fn global_step(&self) -> u64 {
        self.store.global_step()
    }

    pub(crate) fn store(&self) -> &VariableStore {
        &self.store
    }

    fn trained_store(&self) -> Result<&VariableStore> {
        if !self.store.is_initialized() {
            return Err(NNError::NotTrained(self.location()));
        }
        Ok(&self.store)
    }

    fn location(&self) -> String {
        self.model_dir
            .as_ref()
            .map_or_else(|| "<in-memory model>".to_string(), |d| d.display().to_string())
    }

    /// Trains for `steps` more steps, up to `max_steps` in total, or until
    /// the input is exhausted or a hook asks to stop.
    pub fn fit(
        &mut self,
        input: &mut dyn InputFn,
        steps: Option<u64>,
        max_steps: Option<u64>,
        hooks: &mut [&mut dyn TrainingHook],
    ) -> Result<&mut Self> {
        if steps.is_some() && max_steps.is_some() {
            return Err(NNError::InvalidArgument("Can not provide both steps and max_steps.".into()));
        }
        if steps == Some(0) {
            return Err(NNError::InvalidArgument("Must specify steps > 0".into()));
        }
        if max_steps == Some(0) {
            return Err(NNError::InvalidArgument("Must specify max_steps > 0".into()));
        }
        let start = self.store.global_step();
        if let Some(max_steps) = max_steps {
            if start >= max_steps {
                warn!(global_step = start, max_steps, "skipping training since max_steps has already been reached");
                return Ok(self);
            }
        }
        let last_step = steps.map(|s| start + s).or(max_steps);
        let config = self.model.config.clone();

        for hook in hooks.iter_mut() {
            hook.begin(start);
        }
        let mut last_loss = None;
        while last_step.map_or(true, |last| self.store.global_step() < last) {
            let Some(batch) = input.next_batch()? else {
                break;
            };
            let labels = batch.labels.ok_or_else(|| NNError::MissingLabels(Mode::Train.to_string()))?;
            let ops = self
                .model
                .call(batch.features, Some(labels), Mode::Train, &mut self.store)?;
            let loss = ops
                .loss
                .ok_or_else(|| NNError::Other("model function returned no loss in train mode".into()))?;
            if loss.is_nan() {
                return Err(NNError::NanLoss(self.store.global_step()));
            }
            ops.train_op
                .as_ref()
                .ok_or_else(|| NNError::Other("model function returned no train op in train mode".into()))?
                .run(&mut self.store)?;
            let step = self.store.increment_global_step();
            last_loss = Some(loss);

            if step == start + 1 || every(step, config.log_step_count_steps) {
                info!(step, loss, "training");
            }
            if let Some(dir) = &self.model_dir {
                if every(step, config.save_summary_steps) {
                    write_summaries(dir.join(SUMMARIES_FILE), step, &ops.summaries)?;
                }
                if every(step, config.save_checkpoints_steps) {
                    self.save_checkpoint()?;
                }
            }

            let mut stop = false;
            for hook in hooks.iter_mut() {
                stop |= hook.after_step(step, loss);
            }
            if stop {
                debug!(step, "stop requested by hook");
                break;
            }
        }

        let end = self.store.global_step();
        for hook in hooks.iter_mut() {
            hook.end(end);
        }
        if let Some(loss) = last_loss {
            info!(global_step = end, loss, "loss for final step");
            if self.model_dir.is_some() {
                self.save_checkpoint()?;
            }
        }
        Ok(self)
    }

    /// Writes `model.ckpt-<step>.bin` and drops checkpoints beyond `keep_checkpoint_max`.
    fn save_checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.model_dir else {
            return Ok(());
        };
        let step = self.store.global_step();
        let name = format!("model.ckpt-{step}.bin");
        self.store.save(dir.join(&name))?;

        let mut kept = checkpoint_names(dir)?;
        kept.retain(|n| *n != name);
        kept.push(name);
        let keep = self.model.config.keep_checkpoint_max;
        if keep > 0 && kept.len() > keep {
            for old in kept.drain(..kept.len() - keep) {
                let path = dir.join(old);
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove old checkpoint");
                }
            }
        }
        fs::write(dir.join(CHECKPOINT_STATE), kept.join("\n"))?;
        debug!(step, "saved checkpoint");
        Ok(())
    }

    /// Evaluates over the whole input (or `steps` batches) and returns metric
    /// values by name, including `global_step`.
    pub fn evaluate(
        &self,
        input: &mut dyn InputFn,
        steps: Option<u64>,
        metrics: Option<&Metrics>,
        name: Option<&str>,
        checkpoint_path: Option<&Path>,
    ) -> Result<BTreeMap<String, f64>> {
        if steps == Some(0) {
            return Err(NNError::InvalidArgument("Must specify steps > 0".into()));
        }
        let mut store = match checkpoint_path {
            Some(path) => VariableStore::load(path)?,
            None => self.trained_store()?.clone(),
        };

        let mut batches = Vec::new();
        let mut eval_inputs = Vec::new();
        let mut default_metrics = Vec::new();
        while steps.map_or(true, |s| (batches.len() as u64) < s) {
            let Some(batch) = input.next_batch()? else {
                break;
            };
            let labels = batch.labels.ok_or_else(|| NNError::MissingLabels(Mode::Eval.to_string()))?;
            let ops = self.model.call(batch.features, Some(labels), Mode::Eval, &mut store)?;
            let inputs = ops
                .eval_inputs
                .ok_or_else(|| NNError::Other("model function returned no eval inputs".into()))?;
            eval_inputs.push(inputs);
            default_metrics = ops.default_metrics;
            batches.push(ops.predictions);
        }
        if batches.is_empty() {
            return Err(NNError::InvalidArgument("evaluation input produced no batches".into()));
        }
        let predictions = concat_predictions(batches)?;
        let inputs = EvalInputs::concat(&eval_inputs)?;

        let mut results = BTreeMap::new();
        for metric in &default_metrics {
            results.insert(metric.name(), metric.compute(&predictions, &inputs)?);
        }
        if let Some(metrics) = metrics {
            for (key, metric) in metrics {
                results.insert(key.name().to_string(), custom_metric(key, metric, &predictions, &inputs)?);
            }
        }
        results.insert("global_step".to_string(), store.global_step() as f64);
        info!(?results, "evaluation finished");

        if let Some(dir) = &self.model_dir {
            let eval_dir = dir.join(name.map_or_else(|| "eval".to_string(), |n| format!("eval_{n}")));
            fs::create_dir_all(&eval_dir)?;
            write_results(eval_dir.join("results.csv"), &results)?;
        }
        Ok(results)
    }

    /// Runs the model in predict mode over all of `input`.
    pub fn predict(&self, input: &mut dyn InputFn, outputs: Option<&[PredictionKey]>) -> Result<Predictions> {
        let mut store = self.trained_store()?.clone();
        let mut batches = Vec::new();
        while let Some(batch) = input.next_batch()? {
            let ops = self.model.call(batch.features, None, Mode::Predict, &mut store)?;
            batches.push(filter_outputs(ops.predictions, outputs)?);
        }
        if batches.is_empty() {
            return Ok(Predictions::new());
        }
        concat_predictions(batches)
    }

    /// Lazily yields one prediction row per example.
    pub fn predict_iter<'a>(
        &'a self,
        input: Box<dyn InputFn + 'a>,
        outputs: Option<Vec<PredictionKey>>,
    ) -> Result<PredictionIter<'a, P>> {
        Ok(PredictionIter {
            model: &self.model,
            store: self.trained_store()?.clone(),
            input,
            outputs,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Predictions for one batch of features.
    pub fn predict_ops(&self, features: FeatureInput) -> Result<Predictions> {
        let mut store = self.trained_store()?.clone();
        Ok(self.model.call(features, None, Mode::Predict, &mut store)?.predictions)
    }

    /// Runs the model function once against a copy of the variables.
    pub(crate) fn model_fn_ops(&self, features: FeatureInput, labels: Option<Labels>, mode: Mode) -> Result<ModelFnOps> {
        let mut store = self.trained_store()?.clone();
        self.model.call(features, labels, mode, &mut store)
    }

    pub fn get_variable_names(&self) -> Result<Vec<String>> {
        Ok(self.trained_store()?.names())
    }

    pub fn get_variable_value(&self, name: &str) -> Result<Array2<f64>> {
        self.trained_store()?.variable_value(name)
    }
}

fn every(step: u64, period: u64) -> bool {
    period > 0 && step % period == 0
}

fn checkpoint_names(dir: &Path) -> Result<Vec<String>> {
    let state = dir.join(CHECKPOINT_STATE);
    if !state.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read_to_string(state)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Path of the most recent checkpoint listed in `dir`, if any.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(checkpoint_names(dir)?
        .last()
        .map(|name| dir.join(name))
        .filter(|path| path.exists()))
}

fn concat_predictions(batches: Vec<Predictions>) -> Result<Predictions> {
    let mut out = Predictions::new();
    let Some(first) = batches.first() else {
        return Ok(out);
    };
    for key in first.keys() {
        let views = batches
            .iter()
            .map(|b| prediction(b, *key).map(|p| p.view()))
            .collect::<Result<Vec<_>>>()?;
        out.insert(*key, concatenate(Axis(0), &views)?);
    }
    Ok(out)
}

fn filter_outputs(predictions: Predictions, outputs: Option<&[PredictionKey]>) -> Result<Predictions> {
    let Some(outputs) = outputs else {
        return Ok(predictions);
    };
    let mut predictions = predictions;
    outputs
        .iter()
        .map(|key| {
            predictions
                .remove(key)
                .map(|p| (*key, p))
                .ok_or_else(|| NNError::UnknownPredictionKey(key.to_string()))
        })
        .collect()
}

fn custom_metric(key: &MetricKey, metric: &Metric, predictions: &Predictions, inputs: &EvalInputs) -> Result<f64> {
    let weights = Some(&inputs.weights);
    match (key, metric) {
        (MetricKey::Pair(_, prediction_key), Metric::Fn(f)) => {
            Ok(f(prediction(predictions, *prediction_key)?, &inputs.labels, weights))
        }
        (MetricKey::Name(_), Metric::Spec(spec)) => Ok((spec.metric_fn)(
            prediction(predictions, spec.prediction_key)?,
            &inputs.labels,
            weights,
        )),
        (MetricKey::Pair(name, _), Metric::Spec(_)) => Err(NNError::InvalidMetric {
            name: name.clone(),
            reason: "a MetricSpec must be keyed by a bare name".into(),
        }),
        (MetricKey::Name(name), Metric::Fn(f)) => {
            let mut values = predictions.values();
            match (values.next(), values.next()) {
                (Some(p), None) => Ok(f(p, &inputs.labels, weights)),
                _ => Err(NNError::InvalidMetric {
                    name: name.clone(),
                    reason: "the model has several predictions; key the metric by (name, prediction key)".into(),
                }),
            }
        }
    }
}

/// Per-example predictions, pulled batch by batch from the input.
pub struct PredictionIter<'a, P> {
    model: &'a Model<P>,
    store: VariableStore,
    input: Box<dyn InputFn + 'a>,
    outputs: Option<Vec<PredictionKey>>,
    pending: VecDeque<BTreeMap<PredictionKey, Array1<f64>>>,
    done: bool,
}

impl<P> PredictionIter<'_, P> {
    fn fill(&mut self) -> Result<bool> {
        let Some(batch) = self.input.next_batch()? else {
            return Ok(false);
        };
        let ops = self.model.call(batch.features, None, Mode::Predict, &mut self.store)?;
        let predictions = filter_outputs(ops.predictions, self.outputs.as_deref())?;
        let rows = predictions.values().next().map_or(0, |p| p.nrows());
        for i in 0..rows {
            self.pending
                .push_back(predictions.iter().map(|(k, p)| (*k, p.row(i).to_owned())).collect());
        }
        Ok(true)
    }
}

impl<P> Iterator for PredictionIter<'_, P> {
    type Item = Result<BTreeMap<PredictionKey, Array1<f64>>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() && !self.done {
            match self.fill() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.pending.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(n: usize) -> Features {
        let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
        Features::from([("x".to_string(), Tensor::from(x))])
    }

    #[test]
    fn array_input_batches_and_epochs() {
        let labels = Array2::from_shape_fn((5, 1), |(i, _)| i as f64);
        let mut input = ArrayInput::new(features(5), Some(labels)).unwrap().batch_size(2).num_epochs(Some(2));
        let mut sizes = Vec::new();
        while let Some(batch) = input.next_batch().unwrap() {
            sizes.push(batch.labels.unwrap().nrows());
        }
        assert_eq!(sizes, vec![2, 2, 1, 2, 2, 1]);
    }

    #[test]
    fn shuffled_input_keeps_rows_aligned() {
        let labels = Array2::from_shape_fn((6, 1), |(i, _)| i as f64);
        let mut input = ArrayInput::new(features(6), Some(labels)).unwrap().batch_size(6).shuffle(3);
        let batch = input.next_batch().unwrap().unwrap();
        let FeatureInput::Map(features) = batch.features else {
            panic!("expected a feature map");
        };
        let x = features["x"].as_dense("x").unwrap().clone();
        assert_eq!(x, batch.labels.unwrap());
        assert!(input.next_batch().unwrap().is_none());
    }

    #[test]
    fn label_rows_must_match() {
        let err = ArrayInput::new(features(3), Some(Array2::zeros((2, 1)))).unwrap_err();
        assert!(matches!(err, NNError::InvalidInputShape(_)));
    }

    #[test]
    fn closures_are_input_fns() {
        let mut calls = 0;
        let mut input = || -> Result<Option<Batch>> {
            calls += 1;
            Ok(None)
        };
        assert!(input.next_batch().unwrap().is_none());
        drop(input);
        assert_eq!(calls, 1);
    }

    #[test]
    fn output_filter_rejects_unknown_keys() {
        let predictions = Predictions::from([(PredictionKey::Scores, array![[1.0]])]);
        assert!(matches!(
            filter_outputs(predictions.clone(), Some(&[PredictionKey::Classes])),
            Err(NNError::UnknownPredictionKey(_))
        ));
        assert_eq!(filter_outputs(predictions, Some(&[PredictionKey::Scores])).unwrap().len(), 1);
    }
}
