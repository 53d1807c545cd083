use super::columns::{CategoricalColumn, FeatureColumn, SparseKind};
use super::tensor::{Features, SparseTensor, Tensor, Value};
use crate::prelude::*;
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    String,
    Int64,
    Float,
}

/// How a raw feature is read from a serialized example.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum FeatureSpec {
    FixedLen { dimension: usize, default: Option<f64> },
    VarLen { dtype: DType },
}

pub type ParsingSpec = BTreeMap<String, FeatureSpec>;

/// Raw features the given columns read, and how to parse each one.
pub fn create_feature_spec_for_parsing(columns: &[FeatureColumn]) -> ParsingSpec {
    let mut spec = ParsingSpec::new();
    for column in columns {
        match column {
            FeatureColumn::RealValued(c) => {
                spec.insert(c.name.clone(), fixed_len(c.dimension));
            }
            FeatureColumn::Bucketized(c) => {
                spec.insert(c.source.name.clone(), fixed_len(c.source.dimension));
            }
            FeatureColumn::Sparse(c) => categorical_spec(c, &mut spec),
            FeatureColumn::OneHot(c) => categorical_spec(&c.sparse, &mut spec),
            FeatureColumn::Embedding(c) => categorical_spec(&c.sparse, &mut spec),
        }
    }
    spec
}

fn fixed_len(dimension: usize) -> FeatureSpec {
    FeatureSpec::FixedLen {
        dimension,
        default: None,
    }
}

fn categorical_spec(column: &CategoricalColumn, spec: &mut ParsingSpec) {
    let sparse = match column {
        CategoricalColumn::Sparse(c) => c,
        CategoricalColumn::Weighted(c) => {
            spec.insert(
                c.weight_column_name.clone(),
                FeatureSpec::VarLen { dtype: DType::Float },
            );
            &c.sparse
        }
    };
    let dtype = match sparse.kind {
        SparseKind::Integerized(_) => DType::Int64,
        SparseKind::Keys(_) | SparseKind::HashBucket(_) => DType::String,
    };
    spec.insert(sparse.name.clone(), FeatureSpec::VarLen { dtype });
}

/// Parses a batch of JSON examples (`{"feature": [values...]}`) into features.
/// Missing var-len features parse as empty rows; missing fixed-len features
/// use their default or fail.
pub fn parse_examples(serialized: &[String], spec: &ParsingSpec) -> Result<Features> {
    let examples = serialized
        .iter()
        .map(|s| serde_json::from_str::<BTreeMap<String, serde_json::Value>>(s))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut features = Features::new();
    for (name, feature_spec) in spec {
        let tensor = match feature_spec {
            FeatureSpec::FixedLen { dimension, default } => {
                let mut out = Array2::zeros((examples.len(), *dimension));
                for (row, example) in examples.iter().enumerate() {
                    let values = match (example.get(name), default) {
                        (Some(value), _) => numbers(name, value)?,
                        (None, Some(default)) => vec![*default; *dimension],
                        (None, None) => return Err(NNError::MissingFeature(name.clone())),
                    };
                    if values.len() != *dimension {
                        return Err(NNError::InvalidFeature {
                            name: name.clone(),
                            reason: format!("expected {} value(s), got {}", dimension, values.len()),
                        });
                    }
                    out.row_mut(row).assign(&Array1::from(values));
                }
                Tensor::Dense(out)
            }
            FeatureSpec::VarLen { dtype } => {
                let rows = examples
                    .iter()
                    .map(|example| match example.get(name) {
                        Some(value) => var_len(name, value, *dtype),
                        None => Ok(Vec::new()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Tensor::Sparse(SparseTensor::new(rows))
            }
        };
        features.insert(name.clone(), tensor);
    }
    Ok(features)
}

/// Stand-in batch shaped by `spec`: fixed-len features hold their default
/// (or zeros), var-len features are empty.
pub fn placeholder_features(spec: &ParsingSpec, batch: usize) -> Features {
    spec.iter()
        .map(|(name, feature_spec)| {
            let tensor = match feature_spec {
                FeatureSpec::FixedLen { dimension, default } => {
                    Tensor::Dense(Array2::from_elem((batch, *dimension), default.unwrap_or(0.0)))
                }
                FeatureSpec::VarLen { .. } => Tensor::Sparse(SparseTensor::new(vec![Vec::new(); batch])),
            };
            (name.clone(), tensor)
        })
        .collect()
}

fn as_list(value: &serde_json::Value) -> Vec<&serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn numbers(name: &str, value: &serde_json::Value) -> Result<Vec<f64>> {
    as_list(value)
        .into_iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| NNError::InvalidFeature {
                name: name.to_string(),
                reason: format!("expected a number, got {v}"),
            })
        })
        .collect()
}

fn var_len(name: &str, value: &serde_json::Value, dtype: DType) -> Result<Vec<Value>> {
    as_list(value)
        .into_iter()
        .map(|v| {
            let parsed = match dtype {
                DType::String => v.as_str().map(Value::from),
                DType::Int64 => v.as_i64().map(Value::Int),
                DType::Float => v.as_f64().map(Value::Float),
            };
            parsed.ok_or_else(|| NNError::InvalidFeature {
                name: name.to_string(),
                reason: format!("expected {dtype:?}, got {v}"),
            })
        })
        .collect()
}
