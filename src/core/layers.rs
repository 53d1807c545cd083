use crate::core::activations::Activation;
use crate::prelude::*;
use crate::variables::{Initializer, Partitioner, VariableStore};
use rand::Rng;

pub trait LayerTrait {
    fn typ(&self) -> String;

    fn count_params(&self) -> usize;
}

/// Fully connected layer whose parameters live in a `VariableStore` under
/// `<scope>/weights` and `<scope>/biases`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Dense {
    pub scope: String,
    pub w: Array2<f64>,
    pub b: Array2<f64>,
    pub activation: Activation,
}

impl LayerTrait for Dense {
    fn typ(&self) -> String {
        "Dense".into()
    }

    fn count_params(&self) -> usize {
        self.w.len() + self.b.len()
    }
}

impl Dense {
    pub fn build(
        store: &mut VariableStore,
        scope: &str,
        prev: usize,
        perceptron: usize,
        activation: Activation,
        partitioner: Partitioner,
    ) -> Result<Self> {
        if perceptron == 0 || prev == 0 {
            return Err(NNError::InvalidLayerConfiguration(format!(
                "{scope}: layer dimensions must be greater than 0 (got {prev} -> {perceptron})"
            )));
        }
        let w = store
            .get_or_create(
                &weights_name(scope),
                (prev, perceptron),
                Initializer::GlorotUniform,
                partitioner,
            )?
            .clone();
        let b = store
            .get_or_create(&biases_name(scope), (1, perceptron), Initializer::Zeros, partitioner)?
            .clone();
        Ok(Self {
            scope: scope.to_string(),
            w,
            b,
            activation,
        })
    }

    pub fn weights_name(&self) -> String {
        weights_name(&self.scope)
    }

    pub fn biases_name(&self) -> String {
        biases_name(&self.scope)
    }

    /// Returns the pre-activation `z` and the activation `a`.
    pub fn forward(&self, a: &Array2<f64>) -> Result<(Array2<f64>, Array2<f64>)> {
        if a.ncols() != self.w.nrows() {
            return Err(NNError::LayerShapeMismatch(format!(
                "{}: expected {} input columns, got {}",
                self.scope,
                self.w.nrows(),
                a.ncols()
            )));
        }
        let z = a.dot(&self.w) + &self.b;
        let a = self.activation.forward(&z);
        Ok((z, a))
    }

    /// Gradients for weights and biases, and the gradient flowing into the
    /// previous layer. `da` is the gradient of the (already batch-averaged)
    /// loss with respect to this layer's output.
    pub fn backward(
        &self,
        z: &Array2<f64>,
        a_prev: &Array2<f64>,
        da: Array2<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>, Array2<f64>)> {
        if da.dim() != z.dim() {
            return Err(NNError::LayerShapeMismatch(format!(
                "{}: gradient shape {:?} does not match output shape {:?}",
                self.scope,
                da.dim(),
                z.dim()
            )));
        }
        let dz = self.activation.backward(z, da);
        let dw = a_prev.t().dot(&dz);
        let db = dz.sum_axis(Axis(0)).insert_axis(Axis(0));
        let da = dz.dot(&self.w.t());
        Ok((dw, db, da))
    }
}

pub fn weights_name(scope: &str) -> String {
    format!("{scope}/weights")
}

pub fn biases_name(scope: &str) -> String {
    format!("{scope}/biases")
}

/// Inverted dropout: kept units are scaled by `1 / keep_prob`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    pub rate: f64,
}

impl Dropout {
    pub fn new(rate: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(NNError::InvalidConfiguration(format!(
                "dropout must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self { rate })
    }

    pub fn keep_prob(&self) -> f64 {
        1.0 - self.rate
    }

    /// Returns the dropped-out activation and the scaling mask used.
    pub fn forward<R: Rng>(&self, a: Array2<f64>, rng: &mut R) -> (Array2<f64>, Array2<f64>) {
        let keep = self.keep_prob();
        let mask = Array2::from_shape_simple_fn(a.raw_dim(), || {
            if rng.gen::<f64>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        (a * &mask, mask)
    }

    pub fn backward(mask: &Array2<f64>, da: Array2<f64>) -> Array2<f64> {
        da * mask
    }
}
