use thiserror::Error;

/// Contract violations raised by the embedding network.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("training-mode forward requires labels")]
    MissingLabels,

    #[error("label {label} out of range for {n_classes} classes")]
    LabelOutOfRange { label: usize, n_classes: usize },

    #[error("batch mismatch: {images} images, {labels} labels")]
    BatchMismatch { images: usize, labels: usize },

    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("checkpoint is missing parameter {0}")]
    MissingParameter(String),
}
