use crate::prelude::*;
use crate::rand_array;
use crate::utils::fingerprint;
use ndarray_rand::rand_distr::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

pub const GLOBAL_STEP: &str = "global_step";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zeros,
    Constant(f64),
    /// Uniform in `[-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// Normal with the given stddev, resampled outside two stddevs.
    TruncatedNormal(f64),
}

impl Initializer {
    fn initialize(&self, shape: (usize, usize), rng: &mut StdRng) -> Result<Array2<f64>> {
        Ok(match *self {
            Self::Zeros => Array2::zeros(shape),
            Self::Constant(value) => Array2::from_elem(shape, value),
            Self::GlorotUniform => {
                let limit = (6.0 / (shape.0 + shape.1) as f64).sqrt();
                rand_array!(rng, limit, shape.0, shape.1)
            }
            Self::TruncatedNormal(stddev) => {
                let normal = Normal::new(0.0, stddev)
                    .map_err(|e| NNError::InvalidConfiguration(format!("initializer stddev: {e}")))?;
                Array2::from_shape_simple_fn(shape, || loop {
                    let v: f64 = normal.sample(&mut *rng);
                    if v.abs() <= 2.0 * stddev {
                        break v;
                    }
                })
            }
        })
    }
}

/// Min/max partitioning hint for a variable. Only the shard count is
/// computed; storage stays a single array.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    pub max_partitions: usize,
    pub min_slice_size: usize,
}

impl Partitioner {
    pub fn min_max(max_partitions: usize, min_slice_size: usize) -> Self {
        Self {
            max_partitions,
            min_slice_size: min_slice_size.max(1),
        }
    }

    pub fn none() -> Self {
        Self::min_max(1, usize::MAX)
    }

    pub fn partitions(&self, shape: (usize, usize)) -> usize {
        let bytes = shape.0 * shape.1 * std::mem::size_of::<f64>();
        bytes
            .div_ceil(self.min_slice_size)
            .max(1)
            .min(self.max_partitions.max(1))
            .min(shape.0.max(1))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Variable {
    pub value: Array2<f64>,
    pub partitions: usize,
}

/// Named model state: trainable variables, optimizer slots and the global step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VariableStore {
    variables: BTreeMap<String, Variable>,
    slots: BTreeMap<String, BTreeMap<String, Array2<f64>>>,
    global_step: u64,
    seed: u64,
}

impl VariableStore {
    pub fn new(seed: u64) -> Self {
        Self {
            variables: BTreeMap::new(),
            slots: BTreeMap::new(),
            global_step: 0,
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn increment_global_step(&mut self) -> u64 {
        self.global_step += 1;
        self.global_step
    }

    pub fn is_initialized(&self) -> bool {
        !self.variables.is_empty()
    }

    /// Returns the variable, creating it on first use. Initial values only
    /// depend on the store seed and the variable name.
    pub fn get_or_create(
        &mut self,
        name: &str,
        shape: (usize, usize),
        initializer: Initializer,
        partitioner: Partitioner,
    ) -> Result<&Array2<f64>> {
        if !self.variables.contains_key(name) {
            let mut rng = StdRng::seed_from_u64(self.seed ^ fingerprint(name));
            let value = initializer.initialize(shape, &mut rng)?;
            let partitions = partitioner.partitions(shape);
            debug!(variable = name, ?shape, partitions, "created variable");
            self.variables
                .insert(name.to_string(), Variable { value, partitions });
        }
        let variable = &self.variables[name];
        if variable.value.dim() != shape {
            return Err(NNError::LayerShapeMismatch(format!(
                "variable `{}` has shape {:?}, requested {:?}",
                name,
                variable.value.dim(),
                shape
            )));
        }
        Ok(&variable.value)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn value(&self, name: &str) -> Result<&Array2<f64>> {
        self.variables
            .get(name)
            .map(|v| &v.value)
            .ok_or_else(|| NNError::VariableNotFound(name.to_string()))
    }

    /// Variable value together with its optimizer slots.
    pub fn value_and_slots_mut(
        &mut self,
        name: &str,
    ) -> Result<(&mut Array2<f64>, &mut BTreeMap<String, Array2<f64>>)> {
        let variable = self
            .variables
            .get_mut(name)
            .ok_or_else(|| NNError::VariableNotFound(name.to_string()))?;
        let slots = self.slots.entry(name.to_string()).or_default();
        Ok((&mut variable.value, slots))
    }

    /// Variables, slot variables (`<variable>/<slot>`) and `global_step`, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.variables.keys().cloned().collect();
        for (variable, slots) in &self.slots {
            names.extend(slots.keys().map(|slot| format!("{variable}/{slot}")));
        }
        names.push(GLOBAL_STEP.to_string());
        names.sort();
        names
    }

    /// Looks up variables, slot variables and `global_step` by name.
    pub fn variable_value(&self, name: &str) -> Result<Array2<f64>> {
        if name == GLOBAL_STEP {
            return Ok(Array2::from_elem((1, 1), self.global_step as f64));
        }
        if let Some(variable) = self.variables.get(name) {
            return Ok(variable.value.clone());
        }
        name.rsplit_once('/')
            .and_then(|(variable, slot)| self.slots.get(variable)?.get(slot))
            .cloned()
            .ok_or_else(|| NNError::VariableNotFound(name.to_string()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded: Vec<u8> = bincode::serialize(self)?;
        File::create(path)?.write_all(&encoded)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut buffer = Vec::new();
        File::open(path)
            .map_err(|e| NNError::ModelLoadError(format!("{}: {}", path.display(), e)))?
            .read_to_end(&mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }
}
