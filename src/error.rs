use thiserror::Error;

#[derive(Debug, Error)]
pub enum NNError {
    // Model configuration errors
    #[error("Invalid layer configuration: {0}")]
    InvalidLayerConfiguration(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("n_classes must be > 1, got {0}")]
    InvalidNClasses(usize),
    #[error("label_dimension must be > 0, got {0}")]
    InvalidLabelDimension(usize),
    #[error("Unsupported optimizer: {0}")]
    UnsupportedOptimizer(String),
    #[error("Invalid feature column: {0}")]
    InvalidFeatureColumn(String),

    // Input related errors
    #[error("Feature `{0}` not found in input")]
    MissingFeature(String),
    #[error("Invalid feature `{name}`: {reason}")]
    InvalidFeature { name: String, reason: String },
    #[error("Labels are required in {0} mode")]
    MissingLabels(String),
    #[error("Invalid labels: {0}")]
    InvalidLabels(String),
    #[error("Invalid input shape: {0}")]
    InvalidInputShape(String),
    #[error("Layer shape mismatch: {0}")]
    LayerShapeMismatch(String),

    // Training and lifecycle errors
    #[error("NaN loss during training at step {0}")]
    NanLoss(u64),
    #[error("Could not find trained model in {0}")]
    NotTrained(String),
    #[error("Variable `{0}` not found")]
    VariableNotFound(String),
    #[error("Prediction key `{0}` is not produced by the model")]
    UnknownPredictionKey(String),
    #[error("Invalid metric `{name}`: {reason}")]
    InvalidMetric { name: String, reason: String },
    #[error("Failed to load model: {0}")]
    ModelLoadError(String),
    #[error("Export failed: {0}")]
    ExportError(String),
    #[error("Plot error: {0}")]
    PlotError(String),

    // Wrapped errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] Box<bincode::ErrorKind>),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),
    #[error("Shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NNError>;
