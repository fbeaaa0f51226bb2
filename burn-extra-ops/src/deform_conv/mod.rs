//! # Deformable Convolution
//!
//! Deformable convolution (v1) and modulated deformable convolution (v2) on
//! Burn tensors, with a paired backward entry point for each.
//!
//! Every kernel tap samples the input at its regular grid location shifted by
//! a per-position offset read from the offset field. The modulated variant
//! also multiplies each sample by a per-tap mask value.
//!
//! The kernels run on the host in `f64` (see [`forward_host`] and
//! [`backward_host`]) and are parallelized with `rayon`; the tensor entry
//! points read the data back from any backend and return tensors on the
//! input's device. The forward entry points refuse autodiff backends, whose
//! graph they would silently cut; the paired backward functions are the
//! gradient path.
//! Geometry uses Burn's [`DeformConvOptions`], where
//! `weight_groups` are the convolution groups and `offset_groups` the
//! deformable groups.

mod host;
mod shape;

use burn::{
    prelude::*,
    tensor::{ops::DeformConvOptions, TensorData},
};

pub use host::{backward_host, forward_host, HostGradients, HostInputs};
pub use shape::{conv_output_size, DeformConvShape};

use crate::error::{DeformConvError, DeformConvResult};

/// Gradients of a deformable convolution w.r.t. each of its inputs.
#[derive(Debug, Clone)]
pub struct DeformConvGradients<B: Backend> {
    /// `[N, Cin, H, W]`
    pub input: Tensor<B, 4>,
    /// `[N, 2 * dg * kh * kw, H_out, W_out]`
    pub offset: Tensor<B, 4>,
    /// `[Cout, Cin / groups, kh, kw]`
    pub weight: Tensor<B, 4>,
    /// Present when a mask was given.
    pub mask: Option<Tensor<B, 4>>,
    /// Present when a bias was given.
    pub bias: Option<Tensor<B, 1>>,
}

/// Reads a tensor back to the host as `f64` values.
pub(crate) fn host_data<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> DeformConvResult<Vec<f64>> {
    tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|err| DeformConvError::DataConversion {
            reason: format!("{err:?}"),
        })
}

fn to_tensor<B: Backend, const D: usize>(
    values: Vec<f64>,
    dims: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::from_data(TensorData::new(values, dims), device)
}

/// Host copies of the operands of one call, after shape validation.
struct HostOperands {
    shape: DeformConvShape,
    input: Vec<f64>,
    offset: Vec<f64>,
    mask: Option<Vec<f64>>,
    weight: Vec<f64>,
    bias: Option<Vec<f64>>,
}

impl HostOperands {
    fn read<B: Backend>(
        input: Tensor<B, 4>,
        offset: Tensor<B, 4>,
        weight: Tensor<B, 4>,
        mask: Option<Tensor<B, 4>>,
        bias: Option<Tensor<B, 1>>,
        options: &DeformConvOptions<2>,
    ) -> DeformConvResult<Self> {
        let shape = DeformConvShape::new(input.dims(), weight.dims(), options)?;
        shape.check_offset(offset.dims())?;
        if let Some(mask) = &mask {
            shape.check_mask(mask.dims())?;
        }
        if let Some(bias) = &bias {
            shape.check_bias(bias.dims())?;
        }

        Ok(Self {
            shape,
            input: host_data(input)?,
            offset: host_data(offset)?,
            mask: mask.map(host_data).transpose()?,
            weight: host_data(weight)?,
            bias: bias.map(host_data).transpose()?,
        })
    }

    fn inputs(&self) -> HostInputs<'_> {
        HostInputs {
            input: &self.input,
            offset: &self.offset,
            mask: self.mask.as_deref(),
            weight: &self.weight,
        }
    }
}

/// Deformable convolution with an optional modulation mask and bias.
///
/// # Shapes
/// - input: `[N, Cin, H, W]`
/// - offset: `[N, 2 * offset_groups * kh * kw, H_out, W_out]`
/// - weight: `[Cout, Cin / weight_groups, kh, kw]`
/// - mask: `[N, offset_groups * kh * kw, H_out, W_out]`
/// - bias: `[Cout]`
/// - output: `[N, Cout, H_out, W_out]`
///
/// The output is computed on the host and cannot join an autodiff graph.
/// Gradients come from [`deform_conv2d_backward`].
///
/// # Errors
///
/// `ShapeMismatch` when a tensor disagrees with the geometry or the channels do
/// not divide by the groups, `InvalidGeometry` for degenerate options and
/// `AutodiffBackend` when `B` records gradients.
pub fn deform_conv2d<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    mask: Option<Tensor<B, 4>>,
    bias: Option<Tensor<B, 1>>,
    options: DeformConvOptions<2>,
) -> DeformConvResult<Tensor<B, 4>> {
    if B::ad_enabled() {
        return Err(DeformConvError::AutodiffBackend {
            operation: "deform_conv2d",
        });
    }

    let device = input.device();
    let operands = HostOperands::read(input, offset, weight, mask, bias, &options)?;
    let shape = operands.shape;

    tracing::trace!(
        input = ?shape.input_dims(),
        weight = ?shape.weight_dims(),
        modulated = operands.mask.is_some(),
        "deform_conv2d forward"
    );

    let output = forward_host(&shape, operands.inputs(), operands.bias.as_deref());
    Ok(to_tensor(output, shape.output_dims(), &device))
}

/// Backward pass of [`deform_conv2d`].
///
/// `bias` only determines whether a bias gradient is produced.
///
/// # Errors
///
/// As [`deform_conv2d`], plus `ShapeMismatch` when `output_grad` does not have
/// the output's shape.
pub fn deform_conv2d_backward<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    mask: Option<Tensor<B, 4>>,
    bias: Option<Tensor<B, 1>>,
    output_grad: Tensor<B, 4>,
    options: DeformConvOptions<2>,
) -> DeformConvResult<DeformConvGradients<B>> {
    let device = input.device();
    let operands = HostOperands::read(input, offset, weight, mask, bias, &options)?;
    let shape = operands.shape;
    shape.check_output_grad(output_grad.dims())?;
    let output_grad = host_data(output_grad)?;

    tracing::trace!(
        input = ?shape.input_dims(),
        weight = ?shape.weight_dims(),
        modulated = operands.mask.is_some(),
        "deform_conv2d backward"
    );

    let grads = backward_host(
        &shape,
        operands.inputs(),
        operands.bias.is_some(),
        &output_grad,
    );

    Ok(DeformConvGradients {
        input: to_tensor(grads.input, shape.input_dims(), &device),
        offset: to_tensor(grads.offset, shape.offset_dims(), &device),
        weight: to_tensor(grads.weight, shape.weight_dims(), &device),
        mask: grads
            .mask
            .map(|mask| to_tensor(mask, shape.mask_dims(), &device)),
        bias: grads
            .bias
            .map(|bias| to_tensor(bias, [shape.out_channels], &device)),
    })
}

/// Deformable convolution (v1): no mask, no bias.
pub fn deform_conv<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    options: DeformConvOptions<2>,
) -> DeformConvResult<Tensor<B, 4>> {
    deform_conv2d(input, offset, weight, None, None, options)
}

/// Gradients of [`deform_conv`] w.r.t. input, offset and weight.
pub fn deform_conv_backward<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    output_grad: Tensor<B, 4>,
    options: DeformConvOptions<2>,
) -> DeformConvResult<DeformConvGradients<B>> {
    deform_conv2d_backward(input, offset, weight, None, None, output_grad, options)
}

/// Modulated deformable convolution (v2).
pub fn modulated_deform_conv<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    mask: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    bias: Option<Tensor<B, 1>>,
    options: DeformConvOptions<2>,
) -> DeformConvResult<Tensor<B, 4>> {
    deform_conv2d(input, offset, weight, Some(mask), bias, options)
}

/// Gradients of [`modulated_deform_conv`], including the mask gradient.
pub fn modulated_deform_conv_backward<B: Backend>(
    input: Tensor<B, 4>,
    offset: Tensor<B, 4>,
    mask: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    bias: Option<Tensor<B, 1>>,
    output_grad: Tensor<B, 4>,
    options: DeformConvOptions<2>,
) -> DeformConvResult<DeformConvGradients<B>> {
    deform_conv2d_backward(input, offset, weight, Some(mask), bias, output_grad, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{ndarray::NdArray, Autodiff},
        tensor::{module::conv2d, ops::ConvOptions, Distribution},
    };

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn options(
        stride: usize,
        padding: usize,
        weight_groups: usize,
        offset_groups: usize,
    ) -> DeformConvOptions<2> {
        DeformConvOptions {
            stride: [stride, stride],
            padding: [padding, padding],
            dilation: [1, 1],
            weight_groups,
            offset_groups,
        }
    }

    fn max_abs_diff<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> f64 {
        host_data(a)
            .unwrap()
            .iter()
            .zip(host_data(b).unwrap())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    #[test]
    fn test_zero_offsets_match_dense_convolution_on_5x5_input() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 5, 5],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let weight = Tensor::<TestBackend, 4>::random(
            [4, 3, 3, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let offset = Tensor::<TestBackend, 4>::zeros([1, 18, 5, 5], &device);

        let output =
            deform_conv(input.clone(), offset, weight.clone(), options(1, 1, 1, 1)).unwrap();
        assert_eq!(output.dims(), [1, 4, 5, 5]);

        // Independent dense reference computed directly from the buffers.
        let x = host_data(input.clone()).unwrap();
        let w = host_data(weight.clone()).unwrap();
        let out = host_data(output.clone()).unwrap();
        for co in 0..4 {
            for ho in 0..5_usize {
                for wo in 0..5_usize {
                    let mut expected = 0.0;
                    for ci in 0..3 {
                        for ki in 0..3 {
                            for kj in 0..3 {
                                let (Some(y), Some(x_pos)) =
                                    ((ho + ki).checked_sub(1), (wo + kj).checked_sub(1))
                                else {
                                    continue;
                                };
                                if y >= 5 || x_pos >= 5 {
                                    continue;
                                }
                                expected += w[((co * 3 + ci) * 3 + ki) * 3 + kj]
                                    * x[(ci * 5 + y) * 5 + x_pos];
                            }
                        }
                    }
                    let actual = out[(co * 5 + ho) * 5 + wo];
                    assert!((actual - expected).abs() < 1e-5, "({co}, {ho}, {wo})");
                }
            }
        }

        let dense = conv2d(input, weight, None, ConvOptions::new([1, 1], [1, 1], [1, 1], 1));
        assert!(max_abs_diff(output, dense) < 1e-5);
    }

    #[test]
    fn test_matches_burn_deform_conv2d_with_groups_and_mask() {
        let device = Default::default();
        let opts = options(2, 1, 2, 2);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 4, 7, 6],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let weight = Tensor::<TestBackend, 4>::random(
            [6, 2, 3, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let offset = Tensor::<TestBackend, 4>::random(
            [2, 36, 4, 3],
            Distribution::Uniform(-2.0, 2.0),
            &device,
        );
        let mask = Tensor::<TestBackend, 4>::random(
            [2, 18, 4, 3],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let bias =
            Tensor::<TestBackend, 1>::random([6], Distribution::Uniform(-1.0, 1.0), &device);

        let ours = modulated_deform_conv(
            input.clone(),
            offset.clone(),
            mask.clone(),
            weight.clone(),
            Some(bias.clone()),
            opts.clone(),
        )
        .unwrap();
        let reference = burn::tensor::module::deform_conv2d(
            input,
            offset,
            weight,
            Some(mask),
            Some(bias),
            opts,
        );

        assert_eq!(ours.dims(), [2, 6, 4, 3]);
        assert!(max_abs_diff(ours, reference) < 1e-4);
    }

    #[test]
    fn test_weight_and_input_grads_match_autodiff_of_dense_convolution() {
        let device = Default::default();
        let input = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 2, 4, 5],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        )
        .require_grad();
        let weight = Tensor::<TestAutodiffBackend, 4>::random(
            [3, 2, 3, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        )
        .require_grad();
        let output_grad = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 3, 4, 5],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let dense = conv2d(
            input.clone(),
            weight.clone(),
            None,
            ConvOptions::new([1, 1], [1, 1], [1, 1], 1),
        );
        let grads = (dense * output_grad.clone()).sum().backward();
        let expected_input = input.grad(&grads).unwrap();
        let expected_weight = weight.grad(&grads).unwrap();

        let ours = deform_conv_backward(
            input.inner(),
            Tensor::zeros([2, 18, 4, 5], &device),
            weight.inner(),
            output_grad.inner(),
            options(1, 1, 1, 1),
        )
        .unwrap();

        assert!(ours.mask.is_none());
        assert!(ours.bias.is_none());
        assert!(max_abs_diff(ours.input, expected_input) < 1e-4);
        assert!(max_abs_diff(ours.weight, expected_weight) < 1e-4);
    }

    #[test]
    fn test_modulated_backward_returns_every_gradient() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 3, 3], &device);
        let weight = Tensor::<TestBackend, 4>::ones([2, 2, 2, 2], &device);
        let offset = Tensor::<TestBackend, 4>::zeros([1, 8, 2, 2], &device);
        let mask = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let bias = Tensor::<TestBackend, 1>::zeros([2], &device);
        let output_grad = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device);

        let grads = modulated_deform_conv_backward(
            input,
            offset,
            mask,
            weight,
            Some(bias),
            output_grad,
            options(1, 0, 1, 1),
        )
        .unwrap();

        assert_eq!(grads.input.dims(), [1, 2, 3, 3]);
        assert_eq!(grads.offset.dims(), [1, 8, 2, 2]);
        assert_eq!(grads.weight.dims(), [2, 2, 2, 2]);
        assert_eq!(grads.mask.unwrap().dims(), [1, 4, 2, 2]);
        // Each output channel sums 4 positions of upstream gradient 1.
        let bias_grad = host_data(grads.bias.unwrap()).unwrap();
        assert_eq!(bias_grad, vec![4.0, 4.0]);
        // Every weight tap sees 4 positions of ones.
        let weight_grad = host_data(grads.weight).unwrap();
        assert!(weight_grad.iter().all(|&g| (g - 4.0).abs() < 1e-6));
    }

    #[test]
    fn test_forward_on_autodiff_backend_is_rejected() {
        let device = Default::default();
        let input = Tensor::<TestAutodiffBackend, 4>::ones([1, 2, 5, 5], &device).require_grad();
        let weight = Tensor::<TestAutodiffBackend, 4>::ones([2, 2, 3, 3], &device);
        let offset = Tensor::<TestAutodiffBackend, 4>::zeros([1, 18, 5, 5], &device);

        let err = deform_conv(
            input.clone(),
            offset.clone(),
            weight.clone(),
            options(1, 1, 1, 1),
        )
        .unwrap_err();
        assert_eq!(
            err,
            DeformConvError::AutodiffBackend {
                operation: "deform_conv2d"
            }
        );

        // The inner backend runs, and the backward pass reads autodiff
        // tensors as values.
        let output = deform_conv(
            input.clone().inner(),
            offset.clone().inner(),
            weight.clone().inner(),
            options(1, 1, 1, 1),
        )
        .unwrap();
        assert_eq!(output.dims(), [1, 2, 5, 5]);

        let grads = deform_conv_backward(
            input,
            offset,
            weight,
            Tensor::ones([1, 2, 5, 5], &device),
            options(1, 1, 1, 1),
        )
        .unwrap();
        assert_eq!(grads.input.dims(), [1, 2, 5, 5]);
    }

    #[test]
    fn test_wrong_offset_channels_are_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 5, 5], &device);
        let weight = Tensor::<TestBackend, 4>::ones([2, 2, 3, 3], &device);
        let offset = Tensor::<TestBackend, 4>::zeros([1, 9, 5, 5], &device);

        let err = deform_conv(input, offset, weight, options(1, 1, 1, 1)).unwrap_err();
        assert!(matches!(
            err,
            DeformConvError::ShapeMismatch {
                tensor: "offset",
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_mask_and_output_grad_shapes_are_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 2, 5, 5], &device);
        let weight = Tensor::<TestBackend, 4>::ones([2, 2, 3, 3], &device);
        let offset = Tensor::<TestBackend, 4>::zeros([1, 18, 5, 5], &device);

        let err = modulated_deform_conv(
            input.clone(),
            offset.clone(),
            Tensor::ones([1, 18, 5, 5], &device),
            weight.clone(),
            None,
            options(1, 1, 1, 1),
        )
        .unwrap_err();
        assert!(matches!(err, DeformConvError::ShapeMismatch { tensor: "mask", .. }));

        let err = deform_conv_backward(
            input,
            offset,
            weight,
            Tensor::ones([1, 2, 4, 4], &device),
            options(1, 1, 1, 1),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DeformConvError::ShapeMismatch {
                tensor: "output_grad",
                ..
            }
        ));
    }

    #[test]
    fn test_indivisible_groups_are_rejected() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 5, 5], &device);
        let weight = Tensor::<TestBackend, 4>::ones([2, 3, 3, 3], &device);
        let offset = Tensor::<TestBackend, 4>::zeros([1, 36, 5, 5], &device);

        let err = deform_conv(input, offset, weight, options(1, 1, 1, 2)).unwrap_err();
        assert!(matches!(err, DeformConvError::ShapeMismatch { .. }));
    }
}
