use thiserror::Error;

/// The error type for deformable convolution operations.
///
/// Every variant describes a programming or configuration mistake surfaced
/// synchronously to the caller. Sampling far outside the feature map is not an
/// error: the sampler zero-pads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeformConvError {
    /// A tensor's shape disagrees with the convolution geometry, or channel
    /// counts are not divisible by the requested groups.
    #[error("Shape mismatch for {tensor}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Name of the offending tensor (`input`, `offset`, `mask`, ...).
        tensor: &'static str,
        /// The expected shape or divisibility constraint.
        expected: String,
        /// The actual shape.
        actual: String,
    },

    /// Stride, dilation, group count or kernel size make the convolution
    /// ill-defined (zero-sized factors or an empty output).
    #[error("Invalid convolution geometry: {reason}")]
    InvalidGeometry {
        /// Why the geometry is invalid.
        reason: String,
    },

    /// A forward pass was requested on an autodiff backend. The host kernels
    /// read tensors back as plain data, so the result would be detached from
    /// the graph and its gradients silently lost.
    #[error("{operation} cannot record an autodiff graph, call it on the inner backend")]
    AutodiffBackend {
        /// The rejected operation.
        operation: &'static str,
    },

    /// Tensor data could not be read back as floating point values.
    #[error("Failed to read tensor data: {reason}")]
    DataConversion {
        /// The underlying data error.
        reason: String,
    },
}

/// A specialized `Result` type for deformable convolution operations.
pub type DeformConvResult<T> = Result<T, DeformConvError>;
