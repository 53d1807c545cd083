use crate::prelude::*;
use std::collections::BTreeMap;

/// One entry of a sparse feature row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

/// Ragged batch: one (possibly empty) list of values per example.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SparseTensor {
    pub rows: Vec<Vec<Value>>,
}

impl SparseTensor {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self { rows }
    }

    pub fn from_rows<T: Into<Value> + Clone>(rows: &[Vec<T>]) -> Self {
        Self {
            rows: rows
                .iter()
                .map(|row| row.iter().cloned().map(Into::into).collect())
                .collect(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }

    pub fn select_rows(&self, idx: &[usize]) -> Self {
        Self {
            rows: idx.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Tensor {
    Dense(Array2<f64>),
    Sparse(SparseTensor),
}

impl Tensor {
    pub fn batch_size(&self) -> usize {
        match self {
            Tensor::Dense(x) => x.nrows(),
            Tensor::Sparse(x) => x.batch_size(),
        }
    }

    pub fn select_rows(&self, idx: &[usize]) -> Self {
        match self {
            Tensor::Dense(x) => Tensor::Dense(x.select(Axis(0), idx)),
            Tensor::Sparse(x) => Tensor::Sparse(x.select_rows(idx)),
        }
    }

    pub fn as_dense(&self, name: &str) -> Result<&Array2<f64>> {
        match self {
            Tensor::Dense(x) => Ok(x),
            Tensor::Sparse(_) => Err(NNError::InvalidFeature {
                name: name.to_string(),
                reason: "expected a dense tensor, got a sparse one".into(),
            }),
        }
    }

    pub fn as_sparse(&self, name: &str) -> Result<&SparseTensor> {
        match self {
            Tensor::Sparse(x) => Ok(x),
            Tensor::Dense(_) => Err(NNError::InvalidFeature {
                name: name.to_string(),
                reason: "expected a sparse tensor, got a dense one".into(),
            }),
        }
    }
}

impl From<Array2<f64>> for Tensor {
    fn from(x: Array2<f64>) -> Self {
        Tensor::Dense(x)
    }
}

impl From<SparseTensor> for Tensor {
    fn from(x: SparseTensor) -> Self {
        Tensor::Sparse(x)
    }
}

pub type Features = BTreeMap<String, Tensor>;

pub type Labels = Array2<f64>;

/// What callers may hand to the model: a feature mapping or a bare tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureInput {
    Map(Features),
    Single(Tensor),
}

impl FeatureInput {
    /// A bare tensor becomes a mapping under the empty-string key.
    pub fn into_feature_dict(self) -> Features {
        match self {
            FeatureInput::Map(features) => features,
            FeatureInput::Single(tensor) => Features::from([(String::new(), tensor)]),
        }
    }
}

impl From<Features> for FeatureInput {
    fn from(features: Features) -> Self {
        FeatureInput::Map(features)
    }
}

impl From<Tensor> for FeatureInput {
    fn from(tensor: Tensor) -> Self {
        FeatureInput::Single(tensor)
    }
}

impl From<Array2<f64>> for FeatureInput {
    fn from(x: Array2<f64>) -> Self {
        FeatureInput::Single(Tensor::Dense(x))
    }
}

/// Common batch size of all features.
pub fn batch_size(features: &Features) -> Result<usize> {
    let mut sizes = features.iter().map(|(name, t)| (name, t.batch_size()));
    let Some((_, first)) = sizes.next() else {
        return Err(NNError::InvalidInputShape("no features given".into()));
    };
    for (name, size) in sizes {
        if size != first {
            return Err(NNError::InvalidInputShape(format!(
                "feature `{name}` has batch size {size}, expected {first}"
            )));
        }
    }
    Ok(first)
}

pub fn select_rows(features: &Features, idx: &[usize]) -> Features {
    features
        .iter()
        .map(|(name, t)| (name.clone(), t.select_rows(idx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tensor_maps_to_empty_key() {
        let features = FeatureInput::from(array![[1.0, 2.0]]).into_feature_dict();
        assert_eq!(features.len(), 1);
        assert_eq!(features[""].batch_size(), 1);
    }

    #[test]
    fn batch_size_must_agree() {
        let mut features = Features::new();
        features.insert("a".into(), Tensor::from(Array2::zeros((3, 1))));
        features.insert(
            "b".into(),
            Tensor::from(SparseTensor::from_rows(&[vec!["x"], vec![], vec!["y", "z"]])),
        );
        assert_eq!(batch_size(&features).unwrap(), 3);

        features.insert("c".into(), Tensor::from(Array2::zeros((2, 1))));
        assert!(matches!(batch_size(&features), Err(NNError::InvalidInputShape(_))));
    }

    #[test]
    fn select_rows_keeps_alignment() {
        let mut features = Features::new();
        features.insert("a".into(), Tensor::from(array![[0.0], [1.0], [2.0]]));
        features.insert(
            "b".into(),
            Tensor::from(SparseTensor::from_rows(&[vec![0i64], vec![1], vec![2]])),
        );
        let picked = select_rows(&features, &[2, 0]);
        assert_eq!(picked["a"], Tensor::from(array![[2.0], [0.0]]));
        assert_eq!(
            picked["b"],
            Tensor::from(SparseTensor::from_rows(&[vec![2i64], vec![0]]))
        );
    }
}
