//! Deformable sampling operations for the Burn deep learning framework
//!
//! This crate provides the bilinear sampler and the deformable convolution
//! primitive (plain and modulated, forward and backward) that Burn does not
//! expose with an explicit backward pass.

use burn::{prelude::*, tensor::ops::DeformConvOptions};

mod bilinear;
mod deform_conv;
mod error;

// Convenient re-exports
pub use bilinear::{bilinear_sample, BilinearSample, Corner, FeatureMapView};
pub use deform_conv::{
    backward_host, conv_output_size, deform_conv, deform_conv2d, deform_conv2d_backward,
    deform_conv_backward, forward_host, modulated_deform_conv, modulated_deform_conv_backward,
    DeformConvGradients, DeformConvShape, HostGradients, HostInputs,
};
pub use error::{DeformConvError, DeformConvResult};

/// Additional operations for 4D Burn tensors in NCHW layout
pub trait TensorExtraOps<B: Backend> {
    /// Bilinearly sample channel `channel` of batch item `batch` at `(y, x)`.
    ///
    /// Locations more than one unit outside the map sample `0.0`.
    fn bilinear_sample(&self, batch: usize, channel: usize, y: f64, x: f64)
        -> DeformConvResult<f64>;

    /// Apply a deformable convolution with this tensor as input.
    ///
    /// Autodiff backends are rejected with `AutodiffBackend`.
    fn deform_conv(
        self,
        offset: Tensor<B, 4>,
        weight: Tensor<B, 4>,
        options: DeformConvOptions<2>,
    ) -> DeformConvResult<Tensor<B, 4>>;

    /// Apply a modulated deformable convolution with this tensor as input.
    fn modulated_deform_conv(
        self,
        offset: Tensor<B, 4>,
        mask: Tensor<B, 4>,
        weight: Tensor<B, 4>,
        bias: Option<Tensor<B, 1>>,
        options: DeformConvOptions<2>,
    ) -> DeformConvResult<Tensor<B, 4>>;
}

impl<B: Backend> TensorExtraOps<B> for Tensor<B, 4> {
    fn bilinear_sample(
        &self,
        batch: usize,
        channel: usize,
        y: f64,
        x: f64,
    ) -> DeformConvResult<f64> {
        let [batch_size, channels, height, width] = self.dims();
        if batch >= batch_size || channel >= channels {
            return Err(DeformConvError::ShapeMismatch {
                tensor: "input",
                expected: format!("batch < {batch_size} and channel < {channels}"),
                actual: format!("batch {batch}, channel {channel}"),
            });
        }

        let plane = self
            .clone()
            .slice([batch..batch + 1, channel..channel + 1, 0..height, 0..width]);
        let plane = deform_conv::host_data(plane)?;
        Ok(bilinear_sample(&plane, height, width, y, x))
    }

    fn deform_conv(
        self,
        offset: Tensor<B, 4>,
        weight: Tensor<B, 4>,
        options: DeformConvOptions<2>,
    ) -> DeformConvResult<Tensor<B, 4>> {
        deform_conv(self, offset, weight, options)
    }

    fn modulated_deform_conv(
        self,
        offset: Tensor<B, 4>,
        mask: Tensor<B, 4>,
        weight: Tensor<B, 4>,
        bias: Option<Tensor<B, 1>>,
        options: DeformConvOptions<2>,
    ) -> DeformConvResult<Tensor<B, 4>> {
        modulated_deform_conv(self, offset, mask, weight, bias, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::ndarray::NdArray, tensor::Tensor};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tensor_bilinear_sample() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 1, Int>::arange(0..24, &device)
            .float()
            .reshape([2, 3, 2, 2]);

        assert_eq!(tensor.bilinear_sample(1, 2, 1.0, 1.0).unwrap(), 23.0);
        assert_eq!(tensor.bilinear_sample(0, 1, 0.5, 0.5).unwrap(), 5.5);
        assert_eq!(tensor.bilinear_sample(0, 0, -3.0, 0.0).unwrap(), 0.0);
        assert!(matches!(
            tensor.bilinear_sample(2, 0, 0.0, 0.0),
            Err(DeformConvError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_tensor_deform_conv() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::random(
            [2, 3, 6, 5],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let weight = Tensor::<TestBackend, 4>::ones([4, 3, 3, 3], &device);
        let offset = Tensor::<TestBackend, 4>::zeros([2, 18, 3, 3], &device);
        let mask = Tensor::<TestBackend, 4>::ones([2, 9, 3, 3], &device);
        let options = DeformConvOptions::new([2, 2], [1, 1], [1, 1], 1, 1);

        let plain = tensor
            .clone()
            .deform_conv(offset.clone(), weight.clone(), options.clone())
            .unwrap();
        let modulated = tensor
            .modulated_deform_conv(offset, mask, weight, None, options)
            .unwrap();

        assert_eq!(plain.dims(), [2, 4, 3, 3]);
        // A mask of ones leaves the samples untouched.
        let diff: f32 = (plain - modulated).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }
}
