// src/core.rs
pub mod activations;
pub mod layers;
pub mod losses;
pub mod normalization;
pub mod optimizers;

// Re-export commonly used items
pub use activations::Activation;
pub use layers::{Dense, Dropout, LayerTrait};
pub use losses::Loss;
pub use normalization::Normalization;
pub use optimizers::{
    optimize_loss, Gradients, OptimizerSpec, OptimizerType, TrainOp, DEFAULT_LEARNING_RATE,
};
