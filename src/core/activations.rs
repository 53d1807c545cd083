#[allow(unused)]
use crate::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    Linear,
    #[default]
    Relu,
    Relu6,
    Elu,
    Sigmoid,
    Tanh,
    Softplus,
}

impl Activation {
    pub fn forward(&self, z: &Array2<f64>) -> Array2<f64> {
        match self {
            Self::Linear => z.clone(),
            Self::Relu => z.mapv(|z| z.max(0.0)),
            Self::Relu6 => z.mapv(|z| z.clamp(0.0, 6.0)),
            Self::Elu => z.mapv(|z| if z > 0.0 { z } else { z.exp_m1() }),
            Self::Sigmoid => z.mapv(sigmoid),
            Self::Tanh => z.mapv(|z| z.tanh()),
            Self::Softplus => z.mapv(softplus),
        }
    }

    /// Multiplies the upstream gradient by the activation derivative at `z`.
    pub fn backward(&self, z: &Array2<f64>, da: Array2<f64>) -> Array2<f64> {
        match self {
            Self::Linear => da,
            Self::Relu => da * z.mapv(|z| if z > 0.0 { 1.0 } else { 0.0 }),
            Self::Relu6 => da * z.mapv(|z| if z > 0.0 && z < 6.0 { 1.0 } else { 0.0 }),
            Self::Elu => da * z.mapv(|z| if z > 0.0 { 1.0 } else { z.exp() }),
            Self::Sigmoid => da * z.mapv(|z| {
                let s = sigmoid(z);
                s * (1.0 - s)
            }),
            Self::Tanh => da * tanh_backward(z),
            Self::Softplus => da * z.mapv(sigmoid),
        }
    }
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

fn tanh_backward(z: &Array2<f64>) -> Array2<f64> {
    z.mapv(|z| {
        let t = z.tanh();
        1.0 - t * t
    })
}
