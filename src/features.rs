pub mod columns;
pub mod input_layer;
pub mod parsing;
pub mod tensor;

pub use columns::{
    bucketized_column, embedding_column, one_hot_column, real_valued_column, sparse_column_with_hash_bucket,
    sparse_column_with_integerized_feature, sparse_column_with_keys, weighted_sparse_column, CategoricalColumn,
    Combiner, EmbeddingColumn, FeatureColumn,
};
pub use input_layer::{input_from_feature_columns, InputLayer};
pub use parsing::{create_feature_spec_for_parsing, parse_examples, placeholder_features, FeatureSpec, ParsingSpec};
pub use tensor::{FeatureInput, Features, Labels, SparseTensor, Tensor, Value};
