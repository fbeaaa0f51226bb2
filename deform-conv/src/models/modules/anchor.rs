//! Fixed per-tap displacement pattern used by the anchor offset policies.

use burn::{prelude::*, tensor::TensorData};

/// Unit displacement of each kernel tap relative to the centre tap.
///
/// Stored as `2 * kh * kw` values, `(dy, dx)` per tap in row-major tap order.
/// For a 3x3 kernel this is the ring
/// `[-1,-1, -1,0, -1,1, 0,-1, 0,0, 0,1, 1,-1, 1,0, 1,1]`. The pattern does not
/// depend on the layer's dilation: a scale `s` moves every tap by
/// `anchor * (s - c)` input pixels whatever the dilation is.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorPattern {
    values: Vec<f64>,
}

impl AnchorPattern {
    pub fn new(kernel_size: [usize; 2]) -> Self {
        let [kernel_height, kernel_width] = kernel_size;
        // Even kernels put the centre on the upper-left of the middle four taps.
        let centre = |tap: usize, kernel: usize| tap as f64 - (kernel.saturating_sub(1) / 2) as f64;

        let mut values = Vec::with_capacity(2 * kernel_height * kernel_width);
        for ki in 0..kernel_height {
            for kj in 0..kernel_width {
                values.push(centre(ki, kernel_height));
                values.push(centre(kj, kernel_width));
            }
        }
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// `2 * kh * kw`.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The pattern as a `[1, 1, 2 * kh * kw, 1, 1]` tensor, broadcastable over
    /// `[batch, group, taps * 2, height, width]`.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 5> {
        let len = self.len();
        Tensor::from_data(TensorData::new(self.values.clone(), [1, 1, len, 1, 1]), device)
    }
}
