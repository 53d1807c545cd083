use crate::core::layers::{biases_name, weights_name};
use crate::dnn::{dnn_model_fn, DnnParams, PARENT_SCOPE};
use crate::estimator::{Estimator, FeatureEngineeringFn, InputFn, TrainingHook};
use crate::export::{
    classification_signature_fn_with_prob, regression_signature_fn, ExportOptions, ServingInput,
};
use crate::features::{create_feature_spec_for_parsing, FeatureColumn, FeatureInput};
use crate::head::{Head, CENTERED_BIAS_WEIGHT};
use crate::metrics::{Metric, MetricKey, Metrics};
use crate::model_fn::{PredictionKey, Predictions};
use crate::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Options shared by both estimators.
#[derive(Clone)]
struct DnnOptions {
    hidden_units: Vec<usize>,
    feature_columns: Vec<FeatureColumn>,
    model_dir: Option<PathBuf>,
    weight_column_name: Option<String>,
    optimizer: Option<OptimizerSpec>,
    activation_fn: Activation,
    dropout: Option<f64>,
    gradient_clip_norm: Option<f64>,
    enable_centered_bias: bool,
    config: Option<RunConfig>,
    feature_engineering_fn: Option<FeatureEngineeringFn>,
    embedding_lr_multipliers: BTreeMap<String, f64>,
}

impl DnnOptions {
    fn new(hidden_units: Vec<usize>, feature_columns: Vec<FeatureColumn>) -> Self {
        Self {
            hidden_units,
            feature_columns,
            model_dir: None,
            weight_column_name: None,
            optimizer: None,
            activation_fn: Activation::Relu,
            dropout: None,
            gradient_clip_norm: None,
            enable_centered_bias: false,
            config: None,
            feature_engineering_fn: None,
            embedding_lr_multipliers: BTreeMap::new(),
        }
    }

    fn into_estimator(self, head: Head) -> Result<Estimator<DnnParams>> {
        let params = DnnParams {
            head,
            hidden_units: self.hidden_units,
            feature_columns: self.feature_columns,
            optimizer: self.optimizer,
            activation_fn: self.activation_fn,
            dropout: self.dropout,
            gradient_clip_norm: self.gradient_clip_norm,
            embedding_lr_multipliers: self.embedding_lr_multipliers,
        };
        params.validate()?;
        let estimator = Estimator::new(dnn_model_fn, params, self.model_dir, self.config)?;
        Ok(match self.feature_engineering_fn {
            Some(f) => estimator.with_feature_engineering_fn(f),
            None => estimator,
        })
    }
}

macro_rules! dnn_builder_setters {
    ($builder:ty) => {
        impl $builder {
            /// Checkpoints, summaries and eval results go here.
            pub fn model_dir<Q: Into<PathBuf>>(mut self, dir: Q) -> Self {
                self.options.model_dir = Some(dir.into());
                self
            }

            /// Feature holding per-example weights.
            pub fn weight_column_name(mut self, name: &str) -> Self {
                self.options.weight_column_name = Some(name.to_string());
                self
            }

            pub fn optimizer(mut self, optimizer: impl Into<OptimizerSpec>) -> Self {
                self.options.optimizer = Some(optimizer.into());
                self
            }

            pub fn activation_fn(mut self, activation: Activation) -> Self {
                self.options.activation_fn = activation;
                self
            }

            pub fn dropout(mut self, rate: f64) -> Self {
                self.options.dropout = Some(rate);
                self
            }

            pub fn gradient_clip_norm(mut self, clip_norm: f64) -> Self {
                self.options.gradient_clip_norm = Some(clip_norm);
                self
            }

            pub fn enable_centered_bias(mut self, enable: bool) -> Self {
                self.options.enable_centered_bias = enable;
                self
            }

            pub fn config(mut self, config: RunConfig) -> Self {
                self.options.config = Some(config);
                self
            }

            pub fn feature_engineering_fn(mut self, f: FeatureEngineeringFn) -> Self {
                self.options.feature_engineering_fn = Some(f);
                self
            }

            pub fn embedding_lr_multipliers(mut self, multipliers: BTreeMap<String, f64>) -> Self {
                self.options.embedding_lr_multipliers = multipliers;
                self
            }
        }
    };
}

/// Accessors both estimators forward unchanged to the underlying `Estimator`.
macro_rules! dnn_estimator_accessors {
    ($model:ty, $title:literal) => {
        impl $model {
            pub fn fit(
                &mut self,
                input: &mut dyn InputFn,
                steps: Option<u64>,
                max_steps: Option<u64>,
                hooks: &mut [&mut dyn TrainingHook],
            ) -> Result<&mut Self> {
                self.estimator.fit(input, steps, max_steps, hooks)?;
                Ok(self)
            }

            /// Predictions for a single batch of features.
            pub fn predict_ops(&self, features: impl Into<FeatureInput>) -> Result<Predictions> {
                self.estimator.predict_ops(features.into())
            }

            pub fn export_savedmodel<Q: AsRef<Path>>(
                &self,
                export_dir_base: Q,
                serving_input: &ServingInput,
                default_output_alternative_key: Option<&str>,
                assets_extra: Option<&BTreeMap<String, PathBuf>>,
                as_text: bool,
                exports_to_keep: Option<usize>,
            ) -> Result<PathBuf> {
                self.estimator.export_savedmodel(
                    export_dir_base,
                    serving_input,
                    default_output_alternative_key,
                    assets_extra,
                    as_text,
                    exports_to_keep,
                )
            }

            pub fn get_variable_names(&self) -> Result<Vec<String>> {
                self.estimator.get_variable_names()
            }

            pub fn get_variable_value(&self, name: &str) -> Result<Array2<f64>> {
                self.estimator.get_variable_value(name)
            }

            pub fn model_dir(&self) -> Option<&Path> {
                self.estimator.model_dir()
            }

            pub fn config(&self) -> &RunConfig {
                self.estimator.config()
            }

            pub fn params(&self) -> &DnnParams {
                self.estimator.params()
            }

            pub fn estimator(&self) -> &Estimator<DnnParams> {
                &self.estimator
            }

            /// Hidden layer weights followed by the logits weights.
            #[deprecated(note = "use get_variable_value(\"dnn/hiddenlayer_<i>/weights\") instead")]
            pub fn weights_(&self) -> Result<Vec<Array2<f64>>> {
                layer_scopes(self.params())
                    .iter()
                    .map(|scope| self.get_variable_value(&weights_name(scope)))
                    .collect()
            }

            /// Hidden layer biases, the logits biases and, when enabled, the centered bias.
            #[deprecated(note = "use get_variable_value(\"dnn/hiddenlayer_<i>/biases\") instead")]
            pub fn bias_(&self) -> Result<Vec<Array2<f64>>> {
                let mut biases = layer_scopes(self.params())
                    .iter()
                    .map(|scope| self.get_variable_value(&biases_name(scope)))
                    .collect::<Result<Vec<_>>>()?;
                if self.params().head.enable_centered_bias {
                    biases.push(self.get_variable_value(CENTERED_BIAS_WEIGHT)?);
                }
                Ok(biases)
            }

            /// Layer table of the trained network.
            pub fn summary(&self) -> Result<String> {
                summary_table($title, &self.estimator)
            }
        }
    };
}

fn layer_scopes(params: &DnnParams) -> Vec<String> {
    (0..params.hidden_units.len())
        .map(|i| format!("{PARENT_SCOPE}/hiddenlayer_{i}"))
        .chain(std::iter::once(format!("{PARENT_SCOPE}/logits")))
        .collect()
}

fn summary_table(title: &str, estimator: &Estimator<DnnParams>) -> Result<String> {
    let params = estimator.params();
    let scopes = layer_scopes(params);
    let mut total_param = 0;
    let mut res = format!("\nModel {title}\n");
    res.push_str("-------------------------------------------------------------\n");
    res.push_str("Layer (Type)\t\t\t Output shape\t\t No.of params\n");
    for (i, scope) in scopes.iter().enumerate() {
        let activation = if i + 1 == scopes.len() {
            Activation::Linear
        } else {
            params.activation_fn
        };
        let layer = Dense {
            scope: scope.clone(),
            w: estimator.get_variable_value(&weights_name(scope))?,
            b: estimator.get_variable_value(&biases_name(scope))?,
            activation,
        };
        let count = layer.count_params();
        total_param += count;
        res.push_str(&format!(
            "{} ({})\t  (None, {})\t\t  {}\n",
            layer.scope,
            layer.typ(),
            layer.b.len(),
            count
        ));
    }
    res.push_str("-------------------------------------------------------------\n");
    res.push_str(&format!("Total params: {}\n", total_param));
    Ok(res)
}

fn take_prediction(mut row: BTreeMap<PredictionKey, Array1<f64>>, key: PredictionKey) -> Result<Array1<f64>> {
    row.remove(&key)
        .ok_or_else(|| NNError::UnknownPredictionKey(key.to_string()))
}

/// `key` from the predictions; zero rows shaped by `head` when the input was empty.
fn prediction_column(mut predictions: Predictions, key: PredictionKey, head: &Head) -> Result<Array2<f64>> {
    if predictions.is_empty() {
        predictions = head.predictions(&Array2::zeros((0, head.logits_dimension())));
    }
    predictions
        .remove(&key)
        .ok_or_else(|| NNError::UnknownPredictionKey(key.to_string()))
}

/// Fills the parsing spec from the feature columns when the caller left it empty.
fn export_options(
    mut options: ExportOptions,
    params: &DnnParams,
    signature_fn: crate::export::SignatureFn,
    prediction_key: PredictionKey,
) -> ExportOptions {
    if options.input_spec.is_empty() {
        options.input_spec = create_feature_spec_for_parsing(&params.feature_columns);
    }
    options.signature_fn.get_or_insert(signature_fn);
    options.prediction_key.get_or_insert(prediction_key);
    options
}

pub struct DnnClassifierBuilder {
    options: DnnOptions,
    n_classes: usize,
}

dnn_builder_setters!(DnnClassifierBuilder);

impl DnnClassifierBuilder {
    /// Defaults to 2 (binary classification).
    pub fn n_classes(mut self, n_classes: usize) -> Self {
        self.n_classes = n_classes;
        self
    }

    pub fn build(self) -> Result<DnnClassifier> {
        let head = Head::multi_class(
            self.n_classes,
            self.options.weight_column_name.as_deref(),
            self.options.enable_centered_bias,
        )?;
        Ok(DnnClassifier {
            estimator: self.options.into_estimator(head)?,
        })
    }
}

/// Feed-forward classifier over `n_classes` classes.
pub struct DnnClassifier {
    estimator: Estimator<DnnParams>,
}

dnn_estimator_accessors!(DnnClassifier, "DnnClassifier");

impl DnnClassifier {
    pub fn builder(hidden_units: Vec<usize>, feature_columns: Vec<FeatureColumn>) -> DnnClassifierBuilder {
        DnnClassifierBuilder {
            options: DnnOptions::new(hidden_units, feature_columns),
            n_classes: 2,
        }
    }

    pub fn new(hidden_units: Vec<usize>, feature_columns: Vec<FeatureColumn>, n_classes: usize) -> Result<Self> {
        Self::builder(hidden_units, feature_columns).n_classes(n_classes).build()
    }

    pub fn evaluate(
        &self,
        input: &mut dyn InputFn,
        steps: Option<u64>,
        metrics: Option<&Metrics>,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, f64>> {
        self.estimator.evaluate(input, steps, metrics, name, None)
    }

    /// Most likely class index per example.
    pub fn predict(&self, input: &mut dyn InputFn) -> Result<Array1<usize>> {
        let predictions = self.estimator.predict(input, Some(&[PredictionKey::Classes]))?;
        Ok(prediction_column(predictions, PredictionKey::Classes, &self.params().head)?
            .column(0)
            .mapv(|c| c as usize))
    }

    /// Class probabilities, one row per example.
    pub fn predict_proba(&self, input: &mut dyn InputFn) -> Result<Array2<f64>> {
        let predictions = self
            .estimator
            .predict(input, Some(&[PredictionKey::Probabilities]))?;
        prediction_column(predictions, PredictionKey::Probabilities, &self.params().head)
    }

    pub fn predict_classes_iter<'a>(
        &'a self,
        input: Box<dyn InputFn + 'a>,
    ) -> Result<impl Iterator<Item = Result<usize>> + 'a> {
        let rows = self
            .estimator
            .predict_iter(input, Some(vec![PredictionKey::Classes]))?;
        Ok(rows.map(|row| -> Result<usize> {
            Ok(take_prediction(row?, PredictionKey::Classes)?[0] as usize)
        }))
    }

    pub fn predict_proba_iter<'a>(
        &'a self,
        input: Box<dyn InputFn + 'a>,
    ) -> Result<impl Iterator<Item = Result<Array1<f64>>> + 'a> {
        let rows = self
            .estimator
            .predict_iter(input, Some(vec![PredictionKey::Probabilities]))?;
        Ok(rows.map(|row| take_prediction(row?, PredictionKey::Probabilities)))
    }

    /// Exports with a probability signature. An empty `input_spec` is
    /// derived from the feature columns.
    pub fn export<Q: AsRef<Path>>(&self, export_dir: Q, options: ExportOptions) -> Result<PathBuf> {
        let options = export_options(
            options,
            self.params(),
            classification_signature_fn_with_prob,
            PredictionKey::Probabilities,
        );
        self.estimator.export(export_dir, &options)
    }
}

pub struct DnnRegressorBuilder {
    options: DnnOptions,
    label_dimension: usize,
}

dnn_builder_setters!(DnnRegressorBuilder);

impl DnnRegressorBuilder {
    /// Defaults to 1.
    pub fn label_dimension(mut self, label_dimension: usize) -> Self {
        self.label_dimension = label_dimension;
        self
    }

    pub fn build(self) -> Result<DnnRegressor> {
        let head = Head::regression(
            self.label_dimension,
            self.options.weight_column_name.as_deref(),
            self.options.enable_centered_bias,
        )?;
        Ok(DnnRegressor {
            estimator: self.options.into_estimator(head)?,
            label_dimension: self.label_dimension,
        })
    }
}

/// Feed-forward regressor with `label_dimension` outputs.
pub struct DnnRegressor {
    estimator: Estimator<DnnParams>,
    label_dimension: usize,
}

dnn_estimator_accessors!(DnnRegressor, "DnnRegressor");

impl DnnRegressor {
    pub fn builder(hidden_units: Vec<usize>, feature_columns: Vec<FeatureColumn>) -> DnnRegressorBuilder {
        DnnRegressorBuilder {
            options: DnnOptions::new(hidden_units, feature_columns),
            label_dimension: 1,
        }
    }

    pub fn new(hidden_units: Vec<usize>, feature_columns: Vec<FeatureColumn>, label_dimension: usize) -> Result<Self> {
        Self::builder(hidden_units, feature_columns)
            .label_dimension(label_dimension)
            .build()
    }

    pub fn label_dimension(&self) -> usize {
        self.label_dimension
    }

    /// Metrics given as a bare name and function are read against `Scores`.
    pub fn evaluate(
        &self,
        input: &mut dyn InputFn,
        steps: Option<u64>,
        metrics: Option<&Metrics>,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, f64>> {
        let metrics = metrics.map(scores_metrics);
        self.estimator.evaluate(input, steps, metrics.as_ref(), name, None)
    }

    /// Scores shaped `[batch]` for one output, `[batch, label_dimension]` otherwise.
    pub fn predict(&self, input: &mut dyn InputFn) -> Result<ArrayD<f64>> {
        let predictions = self.estimator.predict(input, Some(&[PredictionKey::Scores]))?;
        let scores = prediction_column(predictions, PredictionKey::Scores, &self.params().head)?;
        Ok(if self.label_dimension == 1 {
            scores.column(0).to_owned().into_dyn()
        } else {
            scores.into_dyn()
        })
    }

    /// One `label_dimension`-long score vector per example.
    pub fn predict_scores_iter<'a>(
        &'a self,
        input: Box<dyn InputFn + 'a>,
    ) -> Result<impl Iterator<Item = Result<Array1<f64>>> + 'a> {
        let rows = self
            .estimator
            .predict_iter(input, Some(vec![PredictionKey::Scores]))?;
        Ok(rows.map(|row| take_prediction(row?, PredictionKey::Scores)))
    }

    /// Exports with a regression signature. An empty `input_spec` is
    /// derived from the feature columns.
    pub fn export<Q: AsRef<Path>>(&self, export_dir: Q, options: ExportOptions) -> Result<PathBuf> {
        let options = export_options(options, self.params(), regression_signature_fn, PredictionKey::Scores);
        self.estimator.export(export_dir, &options)
    }
}

fn scores_metrics(metrics: &Metrics) -> Metrics {
    metrics
        .iter()
        .map(|(key, metric)| match (key, metric) {
            (MetricKey::Name(name), Metric::Fn(f)) => {
                (MetricKey::Pair(name.clone(), PredictionKey::Scores), Metric::Fn(*f))
            }
            _ => (key.clone(), *metric),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::ArrayInput;
    use crate::features::real_valued_column;
    use crate::metrics::{mean_absolute_error, MetricSpec};

    fn columns() -> Vec<FeatureColumn> {
        vec![real_valued_column("x", 2).into()]
    }

    fn xor_like(n: usize) -> (Features, Labels) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| ((i * (j + 1)) % 5) as f64 / 4.0);
        let y = Array2::from_shape_fn((n, 1), |(i, _)| ((i % 5) > 2) as u8 as f64);
        (Features::from([("x".to_string(), Tensor::from(x))]), y)
    }

    #[test]
    fn single_class_fails_at_construction() {
        let err = DnnClassifier::new(vec![4], columns(), 1).err().unwrap();
        assert!(matches!(err, NNError::InvalidNClasses(1)));
    }

    #[test]
    fn bare_named_functions_read_scores() {
        let metrics = Metrics::from([
            (MetricKey::Name("mae".into()), Metric::Fn(mean_absolute_error)),
            (
                MetricKey::Name("spec".into()),
                Metric::Spec(MetricSpec::new(mean_absolute_error, PredictionKey::Scores)),
            ),
        ]);
        let remapped = scores_metrics(&metrics);
        assert!(remapped.contains_key(&MetricKey::Pair("mae".into(), PredictionKey::Scores)));
        assert!(remapped.contains_key(&MetricKey::Name("spec".into())));
    }

    #[test]
    #[allow(deprecated)]
    fn weights_and_biases_follow_layer_order() {
        let (features, labels) = xor_like(20);
        let mut classifier = DnnClassifier::builder(vec![3, 2], columns())
            .enable_centered_bias(true)
            .build()
            .unwrap();
        let mut input = ArrayInput::new(features, Some(labels)).unwrap().batch_size(10);
        classifier.fit(&mut input, Some(2), None, &mut []).unwrap();

        let shapes: Vec<_> = classifier.weights_().unwrap().iter().map(|w| w.dim()).collect();
        assert_eq!(shapes, vec![(2, 3), (3, 2), (2, 1)]);
        let biases = classifier.bias_().unwrap();
        assert_eq!(biases.len(), 4);
        assert_eq!(biases[3].dim(), (1, 1));

        let summary = classifier.summary().unwrap();
        assert!(summary.contains("dnn/hiddenlayer_1 (Dense)"));
        assert!(summary.contains("Total params: 20"));
    }
}
