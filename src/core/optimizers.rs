use crate::prelude::*;
use crate::variables::VariableStore;
use serde::ser::Error as _;
use serde::{Deserializer, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Learning rate used when the optimizer is given by name.
pub const DEFAULT_LEARNING_RATE: f64 = 0.05;

/// Named gradients, in the order they were computed.
pub type Gradients = Vec<(String, Array2<f64>)>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum OptimizerType {
    SGD(f64),
    Momentum {
        lr: f64,
        momentum: f64,
        use_nesterov: bool,
    },
    Adagrad {
        lr: f64,
        initial_accumulator_value: f64,
    },
    ProximalAdagrad {
        lr: f64,
        initial_accumulator_value: f64,
        l1: f64,
        l2: f64,
    },
    Adam {
        lr: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
    RMSProp {
        lr: f64,
        decay: f64,
        momentum: f64,
        epsilon: f64,
    },
}

impl OptimizerType {
    pub fn adagrad(lr: f64) -> Self {
        Self::Adagrad {
            lr,
            initial_accumulator_value: 0.1,
        }
    }

    pub fn adam(lr: f64) -> Self {
        Self::Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }

    pub fn from_name(name: &str, lr: f64) -> Result<Self> {
        Ok(match name {
            "SGD" => Self::SGD(lr),
            "Momentum" => Self::Momentum {
                lr,
                momentum: 0.9,
                use_nesterov: false,
            },
            "Adagrad" => Self::adagrad(lr),
            "ProximalAdagrad" => Self::ProximalAdagrad {
                lr,
                initial_accumulator_value: 0.1,
                l1: 0.0,
                l2: 0.0,
            },
            "Adam" => Self::adam(lr),
            "RMSProp" => Self::RMSProp {
                lr,
                decay: 0.9,
                momentum: 0.0,
                epsilon: 1e-10,
            },
            other => {
                return Err(NNError::UnsupportedOptimizer(format!(
                    "`{other}`; expected one of SGD, Momentum, Adagrad, ProximalAdagrad, Adam, RMSProp"
                )))
            }
        })
    }

    /// Prefix of the slot variables this optimizer keeps per variable.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SGD(_) => "SGD",
            Self::Momentum { .. } => "Momentum",
            Self::Adagrad { .. } => "Adagrad",
            Self::ProximalAdagrad { .. } => "ProximalAdagrad",
            Self::Adam { .. } => "Adam",
            Self::RMSProp { .. } => "RMSProp",
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match *self {
            Self::SGD(lr)
            | Self::Momentum { lr, .. }
            | Self::Adagrad { lr, .. }
            | Self::ProximalAdagrad { lr, .. }
            | Self::Adam { lr, .. }
            | Self::RMSProp { lr, .. } => lr,
        }
    }

    /// One update of `var` with `grad`. `step` is the zero-based global step.
    pub fn apply(
        &self,
        var: &mut Array2<f64>,
        grad: &Array2<f64>,
        slots: &mut BTreeMap<String, Array2<f64>>,
        step: u64,
    ) -> Result<()> {
        if var.dim() != grad.dim() {
            return Err(NNError::LayerShapeMismatch(format!(
                "gradient shape {:?} does not match variable shape {:?}",
                grad.dim(),
                var.dim()
            )));
        }
        let shape = var.dim();

        match *self {
            Self::SGD(lr) => {
                var.scaled_add(-lr, grad);
            }
            Self::Momentum {
                lr,
                momentum,
                use_nesterov,
            } => {
                let mut accum = take_slot(slots, "Momentum", shape, 0.0);
                accum = accum * momentum + grad;
                if use_nesterov {
                    *var -= &((grad + &(&accum * momentum)) * lr);
                } else {
                    var.scaled_add(-lr, &accum);
                }
                slots.insert("Momentum".into(), accum);
            }
            Self::Adagrad {
                lr,
                initial_accumulator_value,
            } => {
                let mut accum = take_slot(slots, "Adagrad", shape, initial_accumulator_value);
                accum += &grad.mapv(|g| g * g);
                ndarray::Zip::from(&mut *var)
                    .and(grad)
                    .and(&accum)
                    .for_each(|v, &g, &a| *v -= lr * g / a.sqrt());
                slots.insert("Adagrad".into(), accum);
            }
            Self::ProximalAdagrad {
                lr,
                initial_accumulator_value,
                l1,
                l2,
            } => {
                let mut accum = take_slot(slots, "ProximalAdagrad", shape, initial_accumulator_value);
                accum += &grad.mapv(|g| g * g);
                ndarray::Zip::from(&mut *var)
                    .and(grad)
                    .and(&accum)
                    .for_each(|v, &g, &a| {
                        let lr_t = lr / a.sqrt();
                        let prox = *v - lr_t * g;
                        let shrunk = (prox.abs() - lr_t * l1).max(0.0);
                        *v = prox.signum() * shrunk / (1.0 + lr_t * l2);
                    });
                slots.insert("ProximalAdagrad".into(), accum);
            }
            Self::Adam {
                lr,
                beta1,
                beta2,
                epsilon,
            } => {
                let mut m = take_slot(slots, "Adam", shape, 0.0);
                let mut v = take_slot(slots, "Adam_1", shape, 0.0);
                m = m * beta1 + &(grad * (1.0 - beta1));
                v = v * beta2 + &(grad.mapv(|g| g * g) * (1.0 - beta2));
                let t = (step + 1) as i32;
                let lr_t = lr * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));
                ndarray::Zip::from(&mut *var)
                    .and(&m)
                    .and(&v)
                    .for_each(|w, &m, &v| *w -= lr_t * m / (v.sqrt() + epsilon));
                slots.insert("Adam".into(), m);
                slots.insert("Adam_1".into(), v);
            }
            Self::RMSProp {
                lr,
                decay,
                momentum,
                epsilon,
            } => {
                let mut ms = take_slot(slots, "RMSProp", shape, 1.0);
                let mut mom = take_slot(slots, "RMSProp_1", shape, 0.0);
                ms = ms * decay + &(grad.mapv(|g| g * g) * (1.0 - decay));
                ndarray::Zip::from(&mut mom)
                    .and(grad)
                    .and(&ms)
                    .for_each(|mo, &g, &s| *mo = momentum * *mo + lr * g / (s + epsilon).sqrt());
                *var -= &mom;
                slots.insert("RMSProp".into(), ms);
                slots.insert("RMSProp_1".into(), mom);
            }
        }
        Ok(())
    }
}

/// How the optimizer was supplied: by name, as an instance, or as a
/// zero-argument factory that is invoked to obtain the instance.
#[derive(Clone)]
pub enum OptimizerSpec {
    Name(String),
    Instance(OptimizerType),
    Factory(Arc<dyn Fn() -> OptimizerType + Send + Sync>),
}

impl OptimizerSpec {
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> OptimizerType + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(f))
    }

    /// Names are instantiated with `learning_rate`; instances and factory
    /// results keep their own.
    pub fn resolve(&self, learning_rate: f64) -> Result<OptimizerType> {
        match self {
            Self::Name(name) => OptimizerType::from_name(name, learning_rate),
            Self::Instance(optimizer) => Ok(optimizer.clone()),
            Self::Factory(factory) => Ok(factory()),
        }
    }
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::Name("Adagrad".into())
    }
}

impl fmt::Debug for OptimizerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Instance(optimizer) => f.debug_tuple("Instance").field(optimizer).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

impl From<OptimizerType> for OptimizerSpec {
    fn from(optimizer: OptimizerType) -> Self {
        Self::Instance(optimizer)
    }
}

impl From<&str> for OptimizerSpec {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl Serialize for OptimizerSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.resolve(DEFAULT_LEARNING_RATE)
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

/// Reads back as the instance it was serialized as.
impl<'de> Deserialize<'de> for OptimizerSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        OptimizerType::deserialize(deserializer).map(Self::Instance)
    }
}

fn take_slot(
    slots: &mut BTreeMap<String, Array2<f64>>,
    name: &str,
    shape: (usize, usize),
    init: f64,
) -> Array2<f64> {
    slots
        .remove(name)
        .unwrap_or_else(|| Array2::from_elem(shape, init))
}

pub fn global_norm(gradients: &[(String, Array2<f64>)]) -> f64 {
    gradients
        .iter()
        .map(|(_, g)| g.iter().map(|v| v * v).sum::<f64>())
        .sum::<f64>()
        .sqrt()
}

/// Rescales all gradients by `clip_norm / max(global_norm, clip_norm)`.
/// Returns the norm before clipping.
pub fn clip_by_global_norm(gradients: &mut [(String, Array2<f64>)], clip_norm: f64) -> f64 {
    let norm = global_norm(gradients);
    if norm > clip_norm && norm.is_finite() {
        let scale = clip_norm / norm;
        for (_, g) in gradients.iter_mut() {
            g.mapv_inplace(|v| v * scale);
        }
    }
    norm
}

pub fn multiply_gradients(gradients: &mut [(String, Array2<f64>)], multipliers: &BTreeMap<String, f64>) {
    for (name, g) in gradients.iter_mut() {
        if let Some(&multiplier) = multipliers.get(name) {
            g.mapv_inplace(|v| v * multiplier);
        }
    }
}

#[derive(Debug, Clone)]
struct Update {
    optimizer: OptimizerType,
    gradients: Gradients,
}

/// Pending variable updates produced while building a training step.
/// Nothing changes until the op is run against a store.
#[derive(Debug, Clone)]
pub struct TrainOp {
    updates: Vec<Update>,
}

impl TrainOp {
    pub fn new(optimizer: OptimizerType, gradients: Gradients) -> Self {
        Self {
            updates: vec![Update {
                optimizer,
                gradients,
            }],
        }
    }

    /// Runs `self` first, then `next`.
    pub fn then(mut self, next: TrainOp) -> Self {
        self.updates.extend(next.updates);
        self
    }

    pub fn gradients(&self) -> impl Iterator<Item = &(String, Array2<f64>)> {
        self.updates.iter().flat_map(|u| u.gradients.iter())
    }

    pub fn run(&self, store: &mut VariableStore) -> Result<()> {
        let step = store.global_step();
        for update in &self.updates {
            for (name, grad) in &update.gradients {
                let (var, slots) = store.value_and_slots_mut(name)?;
                update.optimizer.apply(var, grad, slots, step)?;
            }
        }
        Ok(())
    }
}

/// Gradient multipliers first, then global-norm clipping, then the optimizer.
pub fn optimize_loss(
    mut gradients: Gradients,
    optimizer: OptimizerType,
    gradient_multipliers: &BTreeMap<String, f64>,
    clip_gradients: Option<f64>,
) -> Result<TrainOp> {
    if !gradient_multipliers.is_empty() {
        multiply_gradients(&mut gradients, gradient_multipliers);
    }
    if let Some(clip_norm) = clip_gradients {
        if clip_norm <= 0.0 {
            return Err(NNError::InvalidConfiguration(format!(
                "gradient_clip_norm must be > 0, got {clip_norm}"
            )));
        }
        clip_by_global_norm(&mut gradients, clip_norm);
    }
    Ok(TrainOp::new(optimizer, gradients))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{Initializer, Partitioner};
    use approx::assert_abs_diff_eq;

    fn step(optimizer: &OptimizerType, var: f64, grads: &[f64]) -> f64 {
        let mut v = array![[var]];
        let mut slots = BTreeMap::new();
        for (i, &g) in grads.iter().enumerate() {
            optimizer.apply(&mut v, &array![[g]], &mut slots, i as u64).unwrap();
        }
        v[[0, 0]]
    }

    #[test]
    fn sgd_and_adagrad_updates() {
        assert_abs_diff_eq!(step(&OptimizerType::SGD(0.1), 1.0, &[2.0]), 0.8, epsilon = 1e-12);
        // accumulator 0.1 + 4 = 4.1
        let expected = 1.0 - 0.05 * 2.0 / 4.1f64.sqrt();
        assert_abs_diff_eq!(step(&OptimizerType::adagrad(0.05), 1.0, &[2.0]), expected, epsilon = 1e-12);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let moved = step(&OptimizerType::adam(0.01), 0.0, &[3.0]);
        assert_abs_diff_eq!(moved, -0.01, epsilon = 1e-6);
    }

    #[test]
    fn proximal_adagrad_shrinks_towards_zero() {
        let optimizer = OptimizerType::ProximalAdagrad {
            lr: 0.1,
            initial_accumulator_value: 1.0,
            l1: 100.0,
            l2: 0.0,
        };
        assert_eq!(step(&optimizer, 0.5, &[0.0]), 0.0);
    }

    #[test]
    fn names_resolve_with_default_learning_rate() {
        let spec = OptimizerSpec::default();
        assert_eq!(spec.resolve(DEFAULT_LEARNING_RATE).unwrap(), OptimizerType::adagrad(0.05));
        assert!(matches!(
            OptimizerSpec::from("Nope").resolve(0.1),
            Err(NNError::UnsupportedOptimizer(_))
        ));
    }

    #[test]
    fn factory_resolves_to_its_invocation_result() {
        let factory = OptimizerSpec::factory(|| OptimizerType::SGD(0.3));
        let instance = OptimizerSpec::from(OptimizerType::SGD(0.3));
        assert_eq!(factory.resolve(0.05).unwrap(), instance.resolve(0.05).unwrap());
        assert_eq!(
            serde_json::to_string(&factory).unwrap(),
            serde_json::to_string(&instance).unwrap()
        );
    }

    #[test]
    fn named_optimizer_reads_back_as_instance() {
        let json = serde_json::to_string(&OptimizerSpec::from("Adam")).unwrap();
        let spec: OptimizerSpec = serde_json::from_str(&json).unwrap();
        assert!(matches!(spec, OptimizerSpec::Instance(_)));
        assert_eq!(spec.resolve(1.0).unwrap(), OptimizerType::adam(DEFAULT_LEARNING_RATE));
    }

    #[test]
    fn global_norm_clipping() {
        let mut grads = vec![("a".to_string(), array![[3.0]]), ("b".to_string(), array![[4.0]])];
        let norm = clip_by_global_norm(&mut grads, 1.0);
        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grads[0].1[[0, 0]], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(global_norm(&grads), 1.0, epsilon = 1e-12);

        let mut small = vec![("a".to_string(), array![[0.1]])];
        clip_by_global_norm(&mut small, 1.0);
        assert_eq!(small[0].1, array![[0.1]]);
    }

    #[test]
    fn multipliers_apply_before_clipping() {
        let grads = vec![("emb".to_string(), array![[1.0]]), ("w".to_string(), array![[1.0]])];
        let multipliers = BTreeMap::from([("emb".to_string(), 3.0)]);
        let op = optimize_loss(grads, OptimizerType::SGD(1.0), &multipliers, None).unwrap();
        let scaled: Vec<f64> = op.gradients().map(|(_, g)| g[[0, 0]]).collect();
        assert_eq!(scaled, vec![3.0, 1.0]);

        let err = optimize_loss(vec![], OptimizerType::SGD(1.0), &BTreeMap::new(), Some(0.0));
        assert!(matches!(err, Err(NNError::InvalidConfiguration(_))));
    }

    #[test]
    fn train_op_updates_store_and_slots() {
        let mut store = VariableStore::new(0);
        store
            .get_or_create("w", (1, 1), Initializer::Constant(1.0), Partitioner::none())
            .unwrap();
        TrainOp::new(OptimizerType::adagrad(0.05), vec![("w".into(), array![[2.0]])])
            .run(&mut store)
            .unwrap();
        assert!(store.value("w").unwrap()[[0, 0]] < 1.0);
        assert_abs_diff_eq!(store.variable_value("w/Adagrad").unwrap()[[0, 0]], 4.1, epsilon = 1e-12);

        let missing = TrainOp::new(OptimizerType::SGD(1.0), vec![("nope".into(), array![[1.0]])]);
        assert!(matches!(missing.run(&mut store), Err(NNError::VariableNotFound(_))));
    }
}
