use burn_extra_ops::DeformConvError;
use thiserror::Error;

/// The error type for deformable convolution layers.
#[derive(Error, Debug)]
pub enum DcnError {
    /// Error for when an invalid layer configuration is provided.
    /// Raised by `validate()` before any tensor is allocated.
    #[error("Invalid layer configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when building the layer's parameters fails.
    #[error("Model initialization failed: {reason}")]
    ModelInitializationFailed {
        /// The reason for the initialization failure.
        reason: String,
    },

    /// A sampling or accumulation call rejected its operands.
    #[error(transparent)]
    Operation(#[from] DeformConvError),
}

/// A specialized `Result` type for deformable convolution layers.
pub type DcnResult<T> = Result<T, DcnError>;
