use super::columns::{Encoded, FeatureColumn};
use super::tensor::Features;
use crate::core::Gradients;
use crate::prelude::*;
use crate::variables::{Partitioner, VariableStore};
use rayon::prelude::*;
use std::collections::BTreeMap;

struct EmbeddingLookup {
    variable: String,
    vocab: usize,
    /// First output column of this embedding in the input layer.
    offset: usize,
    dimension: usize,
    ids: Vec<Vec<(usize, f64)>>,
    scales: Vec<f64>,
}

/// Dense input batch built from feature columns, plus what is needed to
/// send gradients back into embedding tables.
pub struct InputLayer {
    pub output: Array2<f64>,
    embeddings: Vec<EmbeddingLookup>,
}

impl InputLayer {
    pub fn dimension(&self) -> usize {
        self.output.ncols()
    }

    /// Gradients of the embedding tables given the gradient of the input layer.
    pub fn embedding_gradients(&self, d_output: &Array2<f64>) -> Gradients {
        self.embeddings
            .iter()
            .map(|e| {
                let mut grad = Array2::zeros((e.vocab, e.dimension));
                let d = d_output.slice(s![.., e.offset..e.offset + e.dimension]);
                for (row, (ids, &scale)) in e.ids.iter().zip(&e.scales).enumerate() {
                    for &(id, weight) in ids {
                        grad.row_mut(id).scaled_add(weight * scale, &d.row(row));
                    }
                }
                (e.variable.clone(), grad)
            })
            .collect()
    }
}

/// Encodes `features` with `columns` (ordered by column name) and
/// concatenates the results. Embedding tables are created on first use in
/// `store` under `<scope>/<column>/weights`.
pub fn input_from_feature_columns(
    features: &Features,
    columns: &[FeatureColumn],
    store: &mut VariableStore,
    scope: &str,
    partitioner: Partitioner,
) -> Result<InputLayer> {
    if columns.is_empty() {
        return Err(NNError::InvalidFeatureColumn("no feature columns given".into()));
    }
    let mut sorted: BTreeMap<String, &FeatureColumn> = BTreeMap::new();
    for column in columns {
        column.validate()?;
        sorted.insert(column.name(), column);
    }
    let columns: Vec<&FeatureColumn> = sorted.into_values().collect();

    for embedding in columns.iter().filter_map(|c| c.embedding()) {
        store.get_or_create(
            &embedding.variable_name(scope),
            (embedding.sparse.bucket_size(), embedding.dimension),
            embedding.initializer(),
            partitioner,
        )?;
    }

    let store: &VariableStore = store;
    let encoded: Vec<Encoded> = columns
        .par_iter()
        .map(|column| column.encode(features, store, scope))
        .collect::<Result<_>>()?;

    let batch = encoded[0].dense.nrows();
    if let Some((column, e)) = columns.iter().zip(&encoded).find(|(_, e)| e.dense.nrows() != batch) {
        return Err(NNError::InvalidInputShape(format!(
            "column `{}` has batch size {}, expected {}",
            column.name(),
            e.dense.nrows(),
            batch
        )));
    }

    let views: Vec<_> = encoded.iter().map(|e| e.dense.view()).collect();
    let output = concatenate(Axis(1), &views)?;

    let mut embeddings = Vec::new();
    let mut offset = 0;
    for (column, e) in columns.iter().zip(encoded) {
        let width = e.dense.ncols();
        if let (Some(embedding), Some((ids, scales))) = (column.embedding(), e.lookup) {
            embeddings.push(EmbeddingLookup {
                variable: embedding.variable_name(scope),
                vocab: embedding.sparse.bucket_size(),
                offset,
                dimension: embedding.dimension,
                ids,
                scales,
            });
        }
        offset += width;
    }

    Ok(InputLayer { output, embeddings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::columns::*;
    use crate::features::tensor::{SparseTensor, Tensor};
    use approx::assert_abs_diff_eq;

    fn setup() -> (Features, Vec<FeatureColumn>) {
        let mut features = Features::new();
        features.insert("x".into(), Tensor::from(array![[1.0, 2.0], [3.0, 4.0]]));
        features.insert(
            "tag".into(),
            Tensor::from(SparseTensor::from_rows(&[vec!["a", "b"], vec!["b"]])),
        );
        let columns = vec![
            real_valued_column("x", 2).into(),
            embedding_column(sparse_column_with_keys("tag", &["a", "b", "c"]), 3).into(),
        ];
        (features, columns)
    }

    #[test]
    fn columns_are_ordered_by_name() {
        let (features, columns) = setup();
        let mut store = VariableStore::new(1);
        let layer = input_from_feature_columns(&features, &columns, &mut store, "dnn/input_from_feature_columns", Partitioner::none())
            .unwrap();
        assert_eq!(layer.dimension(), 5);
        // "tag_embedding" sorts before "x"
        assert_eq!(layer.output.slice(s![.., 3..]), array![[1.0, 2.0], [3.0, 4.0]]);
        assert!(store
            .get("dnn/input_from_feature_columns/tag_embedding/weights")
            .is_some());
    }

    #[test]
    fn embedding_gradients_follow_combiner() {
        let (features, columns) = setup();
        let mut store = VariableStore::new(1);
        let layer = input_from_feature_columns(&features, &columns, &mut store, "in", Partitioner::none()).unwrap();
        let grads = layer.embedding_gradients(&Array2::ones((2, 5)));
        assert_eq!(grads.len(), 1);
        let (name, grad) = &grads[0];
        assert_eq!(name, "in/tag_embedding/weights");
        // mean combiner: row 0 splits over a and b, row 1 is all b
        assert_abs_diff_eq!(grad[[0, 0]], 0.5);
        assert_abs_diff_eq!(grad[[1, 0]], 1.5);
        assert_abs_diff_eq!(grad[[2, 0]], 0.0);
    }

    #[test]
    fn empty_columns_rejected() {
        let (features, _) = setup();
        let mut store = VariableStore::new(1);
        assert!(matches!(
            input_from_feature_columns(&features, &[], &mut store, "in", Partitioner::none()),
            Err(NNError::InvalidFeatureColumn(_))
        ));
    }
}
