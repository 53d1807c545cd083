use crate::core::optimizers::{optimize_loss, Gradients, DEFAULT_LEARNING_RATE};
use crate::core::{Activation, Dense, Dropout, OptimizerSpec, TrainOp};
use crate::features::{input_from_feature_columns, FeatureColumn, FeatureInput, Labels};
use crate::head::Head;
use crate::model_fn::{Mode, ModelFnOps};
use crate::prelude::*;
use crate::summary::Summary;
use crate::utils::zero_fraction;
use crate::variables::{Partitioner, VariableStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};

pub const PARENT_SCOPE: &str = "dnn";
pub const INPUT_LAYER_MIN_SLICE_SIZE: usize = 64 << 20;
pub const HIDDEN_LAYER_MIN_SLICE_SIZE: usize = 256 << 10;

/// Hyperparameters of the feed-forward network.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DnnParams {
    pub head: Head,
    pub hidden_units: Vec<usize>,
    pub feature_columns: Vec<FeatureColumn>,
    /// Adagrad with learning rate 0.05 when unset.
    pub optimizer: Option<OptimizerSpec>,
    pub activation_fn: Activation,
    /// Probability of dropping a hidden unit while training.
    pub dropout: Option<f64>,
    pub gradient_clip_norm: Option<f64>,
    /// Embedding column name -> learning rate multiplier.
    pub embedding_lr_multipliers: BTreeMap<String, f64>,
}

impl DnnParams {
    pub fn new(head: Head, hidden_units: Vec<usize>, feature_columns: Vec<FeatureColumn>) -> Self {
        Self {
            head,
            hidden_units,
            feature_columns,
            optimizer: None,
            activation_fn: Activation::Relu,
            dropout: None,
            gradient_clip_norm: None,
            embedding_lr_multipliers: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.feature_columns.is_empty() {
            return Err(NNError::InvalidFeatureColumn("no feature columns given".into()));
        }
        let mut names = BTreeSet::new();
        for column in &self.feature_columns {
            column.validate()?;
            let name = column.name();
            if !names.insert(name.clone()) {
                return Err(NNError::InvalidFeatureColumn(format!("duplicate feature column `{name}`")));
            }
        }
        if let Some(i) = self.hidden_units.iter().position(|&u| u == 0) {
            return Err(NNError::InvalidLayerConfiguration(format!(
                "hidden layer {i} must have at least one unit"
            )));
        }
        if let Some(rate) = self.dropout {
            Dropout::new(rate)?;
        }
        if let Some(clip) = self.gradient_clip_norm {
            if clip <= 0.0 {
                return Err(NNError::InvalidConfiguration(format!(
                    "gradient_clip_norm must be > 0, got {clip}"
                )));
            }
        }
        Ok(())
    }

    /// Maps embedding column multipliers onto their variable names.
    fn gradient_multipliers(&self, input_scope: &str) -> Result<BTreeMap<String, f64>> {
        self.embedding_lr_multipliers
            .iter()
            .map(|(column, &multiplier)| {
                self.feature_columns
                    .iter()
                    .filter_map(|c| c.embedding())
                    .find(|e| e.name() == *column)
                    .map(|e| (e.variable_name(input_scope), multiplier))
                    .ok_or_else(|| {
                        NNError::InvalidConfiguration(format!(
                            "embedding_lr_multipliers references `{column}`, which is not an embedding column"
                        ))
                    })
            })
            .collect()
    }
}

struct HiddenLayer {
    layer: Dense,
    input: Array2<f64>,
    z: Array2<f64>,
    mask: Option<Array2<f64>>,
}

fn add_layer_summary(summaries: &mut Vec<Summary>, scope: &str, value: &Array2<f64>) {
    summaries.push(Summary::scalar(format!("{scope}_fraction_of_zero_values"), zero_fraction(value)));
    summaries.push(Summary::histogram(format!("{scope}_activation"), value));
}

/// Input layer, hidden layers and logits, handed to the head.
pub fn dnn_model_fn(
    features: FeatureInput,
    labels: Option<&Labels>,
    mode: Mode,
    params: &DnnParams,
    config: Option<&RunConfig>,
    store: &mut VariableStore,
) -> Result<ModelFnOps> {
    let features = features.into_feature_dict();
    let num_ps_replicas = config.map_or(0, |c| c.num_ps_replicas);

    let input_scope = format!("{PARENT_SCOPE}/input_from_feature_columns");
    let input = input_from_feature_columns(
        &features,
        &params.feature_columns,
        store,
        &input_scope,
        Partitioner::min_max(num_ps_replicas, INPUT_LAYER_MIN_SLICE_SIZE),
    )?;
    let partitioner = Partitioner::min_max(num_ps_replicas, HIDDEN_LAYER_MIN_SLICE_SIZE);

    let dropout = match params.dropout {
        Some(rate) if mode == Mode::Train => Some(Dropout::new(rate)?),
        _ => None,
    };
    let seed = config.map_or(store.seed(), |c| c.tf_random_seed);
    let mut rng = StdRng::seed_from_u64(seed ^ store.global_step().wrapping_mul(0x9E37_79B9_7F4A_7C15));

    let mut summaries = Vec::new();
    let mut hidden = Vec::with_capacity(params.hidden_units.len());
    let mut a = input.output.clone();
    let mut prev = input.dimension();
    for (i, &units) in params.hidden_units.iter().enumerate() {
        let scope = format!("{PARENT_SCOPE}/hiddenlayer_{i}");
        let layer = Dense::build(store, &scope, prev, units, params.activation_fn, partitioner)?;
        let (z, out) = layer.forward(&a)?;
        let (out, mask) = match &dropout {
            Some(dropout) => {
                let (out, mask) = dropout.forward(out, &mut rng);
                (out, Some(mask))
            }
            None => (out, None),
        };
        add_layer_summary(&mut summaries, &scope, &out);
        hidden.push(HiddenLayer {
            layer,
            input: std::mem::replace(&mut a, out),
            z,
            mask,
        });
        prev = units;
    }

    let scope = format!("{PARENT_SCOPE}/logits");
    let logits_layer = Dense::build(
        store,
        &scope,
        prev,
        params.head.logits_dimension(),
        Activation::Linear,
        partitioner,
    )?;
    let (z_logits, logits) = logits_layer.forward(&a)?;
    add_layer_summary(&mut summaries, &scope, &logits);

    let train_op_fn = |d_logits: &Array2<f64>| -> Result<TrainOp> {
        let mut gradients = Gradients::new();
        let (dw, db, mut da) = logits_layer.backward(&z_logits, &a, d_logits.clone())?;
        gradients.push((logits_layer.weights_name(), dw));
        gradients.push((logits_layer.biases_name(), db));
        for cache in hidden.iter().rev() {
            if let Some(mask) = &cache.mask {
                da = Dropout::backward(mask, da);
            }
            let (dw, db, d_prev) = cache.layer.backward(&cache.z, &cache.input, da)?;
            gradients.push((cache.layer.weights_name(), dw));
            gradients.push((cache.layer.biases_name(), db));
            da = d_prev;
        }
        gradients.extend(input.embedding_gradients(&da));

        let optimizer = params
            .optimizer
            .clone()
            .unwrap_or_default()
            .resolve(DEFAULT_LEARNING_RATE)?;
        let multipliers = params.gradient_multipliers(&input_scope)?;
        optimize_loss(gradients, optimizer, &multipliers, params.gradient_clip_norm)
    };

    let mut ops = params
        .head
        .head_ops(&features, labels, mode, train_op_fn, logits, store)?;
    summaries.append(&mut ops.summaries);
    ops.summaries = summaries;
    Ok(ops)
}
