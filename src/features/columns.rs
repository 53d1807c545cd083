use super::tensor::{Features, Tensor, Value};
use crate::core::Normalization;
use crate::prelude::*;
use crate::utils::fingerprint;
use crate::variables::{Initializer, VariableStore};

/// How a sparse column maps raw values to ids in `[0, bucket_size)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum SparseKind {
    /// Vocabulary lookup; values outside the vocabulary are dropped.
    Keys(Vec<String>),
    HashBucket(usize),
    /// Integer ids taken modulo the bucket size.
    Integerized(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SparseColumn {
    pub name: String,
    pub kind: SparseKind,
}

impl SparseColumn {
    pub fn bucket_size(&self) -> usize {
        match &self.kind {
            SparseKind::Keys(keys) => keys.len(),
            SparseKind::HashBucket(n) | SparseKind::Integerized(n) => *n,
        }
    }

    fn id(&self, value: &Value) -> Result<Option<usize>> {
        let id = match (&self.kind, value) {
            (SparseKind::Keys(keys), Value::Str(s)) => keys.iter().position(|k| k == s),
            (SparseKind::Keys(keys), Value::Int(i)) => {
                let s = i.to_string();
                keys.iter().position(|k| *k == s)
            }
            (SparseKind::HashBucket(n), Value::Str(s)) => Some((fingerprint(s) % *n as u64) as usize),
            (SparseKind::HashBucket(n), Value::Int(i)) => {
                Some((fingerprint(&i.to_string()) % *n as u64) as usize)
            }
            (SparseKind::Integerized(n), Value::Int(i)) => Some(i.rem_euclid(*n as i64) as usize),
            (_, other) => {
                return Err(NNError::InvalidFeature {
                    name: self.name.clone(),
                    reason: format!("unsupported value {other:?} for {:?}", self.kind),
                })
            }
        };
        Ok(id)
    }

    /// Ids per example, each with weight 1.
    fn ids(&self, features: &Features) -> Result<Vec<Vec<(usize, f64)>>> {
        let sparse = lookup(features, &self.name)?.as_sparse(&self.name)?;
        sparse
            .rows
            .iter()
            .map(|row| {
                let mut ids = Vec::with_capacity(row.len());
                for value in row {
                    if let Some(id) = self.id(value)? {
                        ids.push((id, 1.0));
                    }
                }
                Ok(ids)
            })
            .collect()
    }
}

/// A sparse column whose ids carry weights from a parallel float feature.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeightedSparseColumn {
    pub sparse: SparseColumn,
    pub weight_column_name: String,
}

impl WeightedSparseColumn {
    pub fn name(&self) -> String {
        format!("{}_weighted_by_{}", self.sparse.name, self.weight_column_name)
    }

    fn ids(&self, features: &Features) -> Result<Vec<Vec<(usize, f64)>>> {
        let values = lookup(features, &self.sparse.name)?.as_sparse(&self.sparse.name)?;
        let weights = lookup(features, &self.weight_column_name)?.as_sparse(&self.weight_column_name)?;
        if values.batch_size() != weights.batch_size() {
            return Err(NNError::InvalidFeature {
                name: self.name(),
                reason: "ids and weights have different batch sizes".into(),
            });
        }
        values
            .rows
            .iter()
            .zip(&weights.rows)
            .map(|(row, weight_row)| {
                if row.len() != weight_row.len() {
                    return Err(NNError::InvalidFeature {
                        name: self.name(),
                        reason: format!("{} ids but {} weights", row.len(), weight_row.len()),
                    });
                }
                let mut ids = Vec::with_capacity(row.len());
                for (value, weight) in row.iter().zip(weight_row) {
                    let weight = match weight {
                        Value::Float(w) => *w,
                        Value::Int(w) => *w as f64,
                        Value::Str(_) => {
                            return Err(NNError::InvalidFeature {
                                name: self.weight_column_name.clone(),
                                reason: "weights must be numeric".into(),
                            })
                        }
                    };
                    if let Some(id) = self.sparse.id(value)? {
                        ids.push((id, weight));
                    }
                }
                Ok(ids)
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CategoricalColumn {
    Sparse(SparseColumn),
    Weighted(WeightedSparseColumn),
}

impl CategoricalColumn {
    pub fn name(&self) -> String {
        match self {
            Self::Sparse(c) => c.name.clone(),
            Self::Weighted(c) => c.name(),
        }
    }

    pub fn bucket_size(&self) -> usize {
        match self {
            Self::Sparse(c) => c.bucket_size(),
            Self::Weighted(c) => c.sparse.bucket_size(),
        }
    }

    pub(crate) fn ids(&self, features: &Features) -> Result<Vec<Vec<(usize, f64)>>> {
        match self {
            Self::Sparse(c) => c.ids(features),
            Self::Weighted(c) => c.ids(features),
        }
    }
}

impl From<SparseColumn> for CategoricalColumn {
    fn from(c: SparseColumn) -> Self {
        Self::Sparse(c)
    }
}

impl From<WeightedSparseColumn> for CategoricalColumn {
    fn from(c: WeightedSparseColumn) -> Self {
        Self::Weighted(c)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RealValuedColumn {
    pub name: String,
    pub dimension: usize,
    /// `(min, max)` mapped onto `[0, 1]`.
    pub normalizer: Option<(f64, f64)>,
}

impl RealValuedColumn {
    pub fn with_normalizer(mut self, min: f64, max: f64) -> Self {
        self.normalizer = Some((min, max));
        self
    }

    fn values(&self, features: &Features) -> Result<Array2<f64>> {
        let x = lookup(features, &self.name)?.as_dense(&self.name)?;
        if x.ncols() != self.dimension {
            return Err(NNError::InvalidFeature {
                name: self.name.clone(),
                reason: format!("expected {} column(s), got {}", self.dimension, x.ncols()),
            });
        }
        let mut x = x.to_owned();
        if let Some((lb, ub)) = self.normalizer {
            x.to_unity(lb, ub);
        }
        Ok(x)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BucketizedColumn {
    pub source: RealValuedColumn,
    pub boundaries: Vec<f64>,
}

impl BucketizedColumn {
    pub fn name(&self) -> String {
        format!("{}_bucketized", self.source.name)
    }

    fn buckets(&self) -> usize {
        self.boundaries.len() + 1
    }

    fn bucket(&self, v: f64) -> usize {
        self.boundaries.partition_point(|&b| b <= v)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OneHotColumn {
    pub sparse: CategoricalColumn,
}

impl OneHotColumn {
    pub fn name(&self) -> String {
        format!("{}_one_hot", self.sparse.name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Combiner {
    Sum,
    #[default]
    Mean,
    SqrtN,
}

impl Combiner {
    /// Scale applied to the weighted sum of one example's embeddings.
    pub fn scale(&self, ids: &[(usize, f64)]) -> f64 {
        let denominator = match self {
            Combiner::Sum => return 1.0,
            Combiner::Mean => ids.iter().map(|(_, w)| w).sum::<f64>(),
            Combiner::SqrtN => ids.iter().map(|(_, w)| w * w).sum::<f64>().sqrt(),
        };
        if denominator == 0.0 {
            0.0
        } else {
            1.0 / denominator
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EmbeddingColumn {
    pub sparse: CategoricalColumn,
    pub dimension: usize,
    pub combiner: Combiner,
    /// Defaults to `1 / sqrt(dimension)`.
    pub initializer_stddev: Option<f64>,
}

impl EmbeddingColumn {
    pub fn name(&self) -> String {
        format!("{}_embedding", self.sparse.name())
    }

    pub fn with_combiner(mut self, combiner: Combiner) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn with_initializer_stddev(mut self, stddev: f64) -> Self {
        self.initializer_stddev = Some(stddev);
        self
    }

    pub fn variable_name(&self, scope: &str) -> String {
        format!("{scope}/{}/weights", self.name())
    }

    pub fn initializer(&self) -> Initializer {
        Initializer::TruncatedNormal(
            self.initializer_stddev
                .unwrap_or(1.0 / (self.dimension as f64).sqrt()),
        )
    }
}

/// Describes how one raw feature becomes part of the dense input layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum FeatureColumn {
    RealValued(RealValuedColumn),
    Bucketized(BucketizedColumn),
    /// Only usable through a one-hot or embedding column in a DNN.
    Sparse(CategoricalColumn),
    OneHot(OneHotColumn),
    Embedding(EmbeddingColumn),
}

/// Output of encoding one column over a batch.
pub(crate) struct Encoded {
    pub dense: Array2<f64>,
    /// Ids and combiner scale per example, for embedding columns.
    pub lookup: Option<(Vec<Vec<(usize, f64)>>, Vec<f64>)>,
}

impl FeatureColumn {
    pub fn name(&self) -> String {
        match self {
            Self::RealValued(c) => c.name.clone(),
            Self::Bucketized(c) => c.name(),
            Self::Sparse(c) => c.name(),
            Self::OneHot(c) => c.name(),
            Self::Embedding(c) => c.name(),
        }
    }

    /// Width this column contributes to the dense input layer.
    pub fn output_dimension(&self) -> Result<usize> {
        match self {
            Self::RealValued(c) => Ok(c.dimension),
            Self::Bucketized(c) => Ok(c.source.dimension * c.buckets()),
            Self::Sparse(c) => Err(raw_sparse(c)),
            Self::OneHot(c) => Ok(c.sparse.bucket_size()),
            Self::Embedding(c) => Ok(c.dimension),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> {
            Err(NNError::InvalidFeatureColumn(format!("{}: {reason}", self.name())))
        };
        match self {
            Self::RealValued(c) if c.dimension == 0 => invalid("dimension must be > 0".into()),
            Self::Bucketized(c) if c.boundaries.windows(2).any(|w| w[0] >= w[1]) => {
                invalid("boundaries must be sorted and unique".into())
            }
            Self::Bucketized(c) if c.source.dimension == 0 => invalid("dimension must be > 0".into()),
            Self::OneHot(c) if c.sparse.bucket_size() == 0 => invalid("bucket size must be > 0".into()),
            Self::Embedding(c) if c.dimension == 0 || c.sparse.bucket_size() == 0 => {
                invalid(format!(
                    "dimension ({}) and bucket size ({}) must be > 0",
                    c.dimension,
                    c.sparse.bucket_size()
                ))
            }
            Self::Sparse(c) => Err(raw_sparse(c)),
            _ => Ok(()),
        }
    }

    /// Embedding table for this column, if it has one.
    pub fn embedding(&self) -> Option<&EmbeddingColumn> {
        match self {
            Self::Embedding(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn encode(&self, features: &Features, store: &VariableStore, scope: &str) -> Result<Encoded> {
        let dense = match self {
            Self::RealValued(c) => c.values(features)?,
            Self::Bucketized(c) => {
                let x = c.source.values(features)?;
                let buckets = c.buckets();
                let mut out = Array2::zeros((x.nrows(), x.ncols() * buckets));
                for ((row, d), &v) in x.indexed_iter() {
                    out[[row, d * buckets + c.bucket(v)]] = 1.0;
                }
                out
            }
            Self::Sparse(c) => return Err(raw_sparse(c)),
            Self::OneHot(c) => {
                let ids = c.sparse.ids(features)?;
                let mut out = Array2::zeros((ids.len(), c.sparse.bucket_size()));
                for (row, ids) in ids.iter().enumerate() {
                    for &(id, weight) in ids {
                        out[[row, id]] += weight;
                    }
                }
                out
            }
            Self::Embedding(c) => {
                let table = store.value(&c.variable_name(scope))?;
                let ids = c.sparse.ids(features)?;
                let scales: Vec<f64> = ids.iter().map(|ids| c.combiner.scale(ids)).collect();
                let mut out = Array2::zeros((ids.len(), c.dimension));
                for (row, (ids, &scale)) in ids.iter().zip(&scales).enumerate() {
                    let mut target = out.row_mut(row);
                    for &(id, weight) in ids {
                        target.scaled_add(weight * scale, &table.row(id));
                    }
                }
                return Ok(Encoded {
                    dense: out,
                    lookup: Some((ids, scales)),
                });
            }
        };
        Ok(Encoded { dense, lookup: None })
    }
}

fn raw_sparse(column: &CategoricalColumn) -> NNError {
    NNError::InvalidFeatureColumn(format!(
        "sparse column `{}` must be wrapped in a one-hot or embedding column",
        column.name()
    ))
}

fn lookup<'a>(features: &'a Features, name: &str) -> Result<&'a Tensor> {
    features
        .get(name)
        .ok_or_else(|| NNError::MissingFeature(name.to_string()))
}

pub fn real_valued_column(name: &str, dimension: usize) -> RealValuedColumn {
    RealValuedColumn {
        name: name.to_string(),
        dimension,
        normalizer: None,
    }
}

pub fn bucketized_column(source: RealValuedColumn, boundaries: Vec<f64>) -> FeatureColumn {
    FeatureColumn::Bucketized(BucketizedColumn { source, boundaries })
}

pub fn sparse_column_with_keys(name: &str, keys: &[&str]) -> SparseColumn {
    SparseColumn {
        name: name.to_string(),
        kind: SparseKind::Keys(keys.iter().map(|k| k.to_string()).collect()),
    }
}

pub fn sparse_column_with_hash_bucket(name: &str, hash_bucket_size: usize) -> SparseColumn {
    SparseColumn {
        name: name.to_string(),
        kind: SparseKind::HashBucket(hash_bucket_size),
    }
}

pub fn sparse_column_with_integerized_feature(name: &str, bucket_size: usize) -> SparseColumn {
    SparseColumn {
        name: name.to_string(),
        kind: SparseKind::Integerized(bucket_size),
    }
}

pub fn weighted_sparse_column(sparse: SparseColumn, weight_column_name: &str) -> WeightedSparseColumn {
    WeightedSparseColumn {
        sparse,
        weight_column_name: weight_column_name.to_string(),
    }
}

pub fn one_hot_column(sparse: impl Into<CategoricalColumn>) -> FeatureColumn {
    FeatureColumn::OneHot(OneHotColumn { sparse: sparse.into() })
}

pub fn embedding_column(sparse: impl Into<CategoricalColumn>, dimension: usize) -> EmbeddingColumn {
    EmbeddingColumn {
        sparse: sparse.into(),
        dimension,
        combiner: Combiner::default(),
        initializer_stddev: None,
    }
}

impl From<RealValuedColumn> for FeatureColumn {
    fn from(c: RealValuedColumn) -> Self {
        Self::RealValued(c)
    }
}

impl From<SparseColumn> for FeatureColumn {
    fn from(c: SparseColumn) -> Self {
        Self::Sparse(c.into())
    }
}

impl From<WeightedSparseColumn> for FeatureColumn {
    fn from(c: WeightedSparseColumn) -> Self {
        Self::Sparse(c.into())
    }
}

impl From<EmbeddingColumn> for FeatureColumn {
    fn from(c: EmbeddingColumn) -> Self {
        Self::Embedding(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::tensor::SparseTensor;
    use crate::variables::Partitioner;
    use approx::assert_abs_diff_eq;

    fn features() -> Features {
        let mut features = Features::new();
        features.insert("age".into(), Tensor::from(array![[20.0], [45.0], [70.0]]));
        features.insert(
            "language".into(),
            Tensor::from(SparseTensor::from_rows(&[vec!["en"], vec!["fr", "en"], vec!["xx"]])),
        );
        features.insert(
            "language_w".into(),
            Tensor::from(SparseTensor::from_rows(&[vec![2.0], vec![1.0, 3.0], vec![1.0]])),
        );
        features
    }

    #[test]
    fn real_valued_normalizes_to_unit_interval() {
        let column: FeatureColumn = real_valued_column("age", 1).with_normalizer(20.0, 70.0).into();
        let store = VariableStore::new(0);
        let encoded = column.encode(&features(), &store, "in").unwrap();
        assert_eq!(encoded.dense, array![[0.0], [0.5], [1.0]]);
    }

    #[test]
    fn bucketized_one_hot_per_dimension() {
        let column = bucketized_column(real_valued_column("age", 1), vec![30.0, 45.0, 60.0]);
        assert_eq!(column.output_dimension().unwrap(), 4);
        let store = VariableStore::new(0);
        let encoded = column.encode(&features(), &store, "in").unwrap();
        assert_eq!(
            encoded.dense,
            array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]]
        );
        assert!(bucketized_column(real_valued_column("age", 1), vec![3.0, 1.0])
            .validate()
            .is_err());
    }

    #[test]
    fn one_hot_drops_unknown_keys() {
        let column = one_hot_column(sparse_column_with_keys("language", &["en", "fr"]));
        let store = VariableStore::new(0);
        let encoded = column.encode(&features(), &store, "in").unwrap();
        assert_eq!(encoded.dense, array![[1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]);
        assert_eq!(column.name(), "language_one_hot");
    }

    #[test]
    fn weighted_one_hot_sums_weights() {
        let weighted = weighted_sparse_column(sparse_column_with_keys("language", &["en", "fr"]), "language_w");
        let column = one_hot_column(weighted);
        assert_eq!(column.name(), "language_weighted_by_language_w_one_hot");
        let store = VariableStore::new(0);
        let encoded = column.encode(&features(), &store, "in").unwrap();
        assert_eq!(encoded.dense, array![[2.0, 0.0], [3.0, 1.0], [0.0, 0.0]]);
    }

    #[test]
    fn hash_buckets_are_stable() {
        let column = sparse_column_with_hash_bucket("language", 10);
        let a = column.ids(&features()).unwrap();
        let b = column.ids(&features()).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().flatten().all(|&(id, _)| id < 10));
        assert_eq!(a[1][1], a[0][0]);
    }

    #[test]
    fn embedding_mean_combiner() {
        let column: FeatureColumn = embedding_column(sparse_column_with_keys("language", &["en", "fr"]), 2).into();
        let mut store = VariableStore::new(0);
        let embedding = column.embedding().unwrap();
        store
            .get_or_create(&embedding.variable_name("in"), (2, 2), embedding.initializer(), Partitioner::none())
            .unwrap();
        let table = store.value("in/language_embedding/weights").unwrap().clone();
        let encoded = column.encode(&features(), &store, "in").unwrap();
        assert_eq!(encoded.dense.row(0), table.row(0));
        let mean = (&table.row(0) + &table.row(1)) / 2.0;
        assert_abs_diff_eq!(encoded.dense[[1, 0]], mean[0], epsilon = 1e-12);
        assert_abs_diff_eq!(encoded.dense[[1, 1]], mean[1], epsilon = 1e-12);
        assert_eq!(encoded.dense.row(2).sum(), 0.0);
    }

    #[test]
    fn raw_sparse_and_missing_features_fail() {
        let raw: FeatureColumn = sparse_column_with_keys("language", &["en"]).into();
        assert!(matches!(raw.output_dimension(), Err(NNError::InvalidFeatureColumn(_))));
        let missing: FeatureColumn = real_valued_column("height", 1).into();
        let store = VariableStore::new(0);
        assert!(matches!(
            missing.encode(&features(), &store, "in"),
            Err(NNError::MissingFeature(name)) if name == "height"
        ));
    }

    #[test]
    fn combiner_scales() {
        let ids = [(0, 3.0), (1, 4.0)];
        assert_eq!(Combiner::Sum.scale(&ids), 1.0);
        assert_abs_diff_eq!(Combiner::Mean.scale(&ids), 1.0 / 7.0);
        assert_abs_diff_eq!(Combiner::SqrtN.scale(&ids), 0.2);
        assert_eq!(Combiner::Mean.scale(&[]), 0.0);
    }
}
