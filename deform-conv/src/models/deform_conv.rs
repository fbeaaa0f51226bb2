use core::f64::consts::SQRT_2;

use burn::{
    module::{Ignored, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer,
    },
    prelude::*,
    tensor::{
        module::conv2d,
        ops::{ConvOptions, DeformConvOptions},
    },
};
use burn_extra_ops::{conv_output_size, deform_conv2d, deform_conv2d_backward, DeformConvError};

use super::modules::{AnchorPattern, ModulationGate, OffsetHead, OffsetHeadConfig, OffsetTransform};
use crate::{
    config::{ConvLayout, DeformConv2dConfig},
    error::DcnResult,
};

impl DeformConv2dConfig {
    /// Validates the configuration and builds the layer.
    ///
    /// The weight is drawn from `U(-1/sqrt(n), 1/sqrt(n))` with
    /// `n = in_channels * kh * kw`, the bias starts at zero and the offset head
    /// starts at its identity constants, so a fresh layer computes a standard
    /// convolution.
    ///
    /// # Errors
    ///
    /// Any error of [`DeformConv2dConfig::validate`].
    pub fn init<B: Backend>(&self, device: &B::Device) -> DcnResult<DeformConv2d<B>> {
        self.validate()?;

        let [kernel_height, kernel_width] = self.kernel_size;
        let out_channels = self.deform_out_channels();
        let weight_groups = self.weight_groups();
        let bound = 1.0 / ((self.in_channels * kernel_height * kernel_width) as f64).sqrt();

        let weight = Initializer::Uniform {
            min: -bound,
            max: bound,
        }
        .init(
            [
                out_channels,
                self.in_channels / weight_groups,
                kernel_height,
                kernel_width,
            ],
            device,
        );
        let bias = self
            .bias
            .then(|| Initializer::Zeros.init([out_channels], device));

        let offset_bias = if self.offset_policy.is_anchor_based() {
            self.anchor_center
        } else {
            0.0
        };
        let head = OffsetHeadConfig::new(self.in_channels, self.head_offset_channels())
            .with_mask_channels(self.mask_channels())
            .with_kind(self.head.clone())
            .with_kernel_size(self.kernel_size)
            .with_stride(self.stride)
            .with_padding(self.padding)
            .with_dilation(self.dilation)
            .with_offset_bias(offset_bias)
            .init(device)?;

        let transform = OffsetTransform::new(
            self.offset_policy.clone(),
            AnchorPattern::new(self.kernel_size),
            self.deformable_groups,
        )
        .with_offset_bound(self.offset_bound)
        .with_anchor_center(self.anchor_center)
        .with_scale_lower_bound(self.resolved_scale_lower_bound());
        let gate = self.modulated.then(|| ModulationGate::new(self.mask_scale));

        let channel_mixer = match self.layout {
            ConvLayout::Grouped => None,
            ConvLayout::DepthwiseSeparable => Some(
                Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                    .with_bias(false)
                    .with_initializer(Initializer::KaimingNormal {
                        gain: SQRT_2,
                        fan_out_only: false,
                    })
                    .init(device),
            ),
        };

        tracing::debug!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            kernel_size = ?self.kernel_size,
            groups = weight_groups,
            deformable_groups = self.deformable_groups,
            policy = ?self.offset_policy,
            head = ?self.head,
            layout = ?self.layout,
            modulated = self.modulated,
            "initialized deformable convolution"
        );

        Ok(DeformConv2d {
            weight,
            bias,
            head,
            channel_mixer,
            in_channels: self.in_channels,
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            weight_groups,
            offset_groups: self.deformable_groups,
            transform: Ignored(transform),
            gate: Ignored(gate),
        })
    }
}

/// Deformable 2D convolution with a learned offset field.
///
/// The offset head predicts a raw tensor from the input, the offset transform
/// turns it into per-tap offsets, the optional gate turns the mask logits into
/// modulation weights, and the deformable convolution samples and accumulates.
/// The depthwise-separable layout follows with a 1x1 channel mixer.
#[derive(Module, Debug)]
pub struct DeformConv2d<B: Backend> {
    /// `[out, in / groups, kh, kw]`.
    pub weight: Param<Tensor<B, 4>>,
    pub bias: Option<Param<Tensor<B, 1>>>,
    pub head: OffsetHead<B>,
    /// Bias-free 1x1 convolution of the depthwise-separable layout.
    pub channel_mixer: Option<Conv2d<B>>,
    in_channels: usize,
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
    weight_groups: usize,
    offset_groups: usize,
    transform: Ignored<OffsetTransform>,
    gate: Ignored<Option<ModulationGate>>,
}

/// Offset and mask fields as consumed by the deformable convolution.
#[derive(Debug, Clone)]
pub struct DeformFields<B: Backend> {
    /// `[N, 2 * dg * kh * kw, H_out, W_out]`.
    pub offset: Tensor<B, 4>,
    /// `[N, dg * kh * kw, H_out, W_out]`, present when modulated.
    pub mask: Option<Tensor<B, 4>>,
}

/// Gradients produced by [`DeformConv2d::backward`].
///
/// The chain stops at the head's raw output: `head_output` is the gradient
/// w.r.t. the tensor returned by [`OffsetHead::forward`], and `input` covers
/// only the sampling path, not the path through the head.
#[derive(Debug, Clone)]
pub struct DeformConv2dGrads<B: Backend> {
    pub input: Tensor<B, 4>,
    pub weight: Tensor<B, 4>,
    pub bias: Option<Tensor<B, 1>>,
    pub channel_mixer: Option<Tensor<B, 4>>,
    /// W.r.t. the transformed offset field.
    pub offset: Tensor<B, 4>,
    /// W.r.t. the gated mask.
    pub mask: Option<Tensor<B, 4>>,
    pub head_output: Tensor<B, 4>,
}

struct Prediction<B: Backend> {
    raw_offset: Tensor<B, 4>,
    raw_mask: Option<Tensor<B, 4>>,
    fields: DeformFields<B>,
}

impl<B: Backend> DeformConv2d<B> {
    /// On an autodiff backend the sampling step runs through Burn's
    /// `deform_conv2d`, so gradients reach the weight, bias, head and upstream
    /// activations. Other backends run the host kernels, whose gradients
    /// [`Self::backward`] returns.
    ///
    /// # Shapes
    /// - input: `[N, in_channels, H, W]`
    /// - output: `[N, out_channels, H_out, W_out]`
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` for an input with the wrong channel count and
    /// `InvalidGeometry` for an input smaller than the kernel footprint.
    pub fn forward(&self, x: Tensor<B, 4>) -> DcnResult<Tensor<B, 4>> {
        let fields = self.offsets(x.clone())?;
        let output = self.deform(x, fields)?;

        Ok(match &self.channel_mixer {
            Some(mixer) => mixer.forward(output),
            None => output,
        })
    }

    /// The offset and mask fields the layer would sample `x` with.
    ///
    /// # Errors
    ///
    /// As [`Self::forward`].
    pub fn offsets(&self, x: Tensor<B, 4>) -> DcnResult<DeformFields<B>> {
        self.predict(x).map(|prediction| prediction.fields)
    }

    /// Gradients of the layer given the gradient of its output.
    ///
    /// # Errors
    ///
    /// As [`Self::forward`], plus `ShapeMismatch` when `output_grad` does not
    /// have the output's shape.
    pub fn backward(
        &self,
        x: Tensor<B, 4>,
        output_grad: Tensor<B, 4>,
    ) -> DcnResult<DeformConv2dGrads<B>> {
        let Prediction {
            raw_offset,
            raw_mask,
            fields,
        } = self.predict(x.clone())?;

        let (deform_grad, channel_mixer) = match &self.channel_mixer {
            Some(mixer) => {
                let output = self.deform(x.clone(), fields.clone())?;
                let (input_grad, weight_grad) =
                    pointwise_backward(mixer.weight.val(), output, output_grad)?;
                (input_grad, Some(weight_grad))
            }
            None => (output_grad, None),
        };

        let grads = deform_conv2d_backward(
            x,
            fields.offset,
            self.weight.val(),
            fields.mask,
            self.bias.as_ref().map(Param::val),
            deform_grad,
            self.options(),
        )?;

        let raw_offset_grad = self.transform.backward(raw_offset, grads.offset.clone())?;
        let head_output = match (self.gate.0.as_ref(), raw_mask, grads.mask.clone()) {
            (Some(gate), Some(raw_mask), Some(mask_grad)) => {
                let raw_mask_grad = gate.backward(raw_mask, mask_grad);
                Tensor::cat(vec![raw_offset_grad, raw_mask_grad], 1)
            }
            _ => raw_offset_grad,
        };

        Ok(DeformConv2dGrads {
            input: grads.input,
            weight: grads.weight,
            bias: grads.bias,
            channel_mixer,
            offset: grads.offset,
            mask: grads.mask,
            head_output,
        })
    }

    /// Geometry handed to the deformable convolution.
    pub fn options(&self) -> DeformConvOptions<2> {
        DeformConvOptions {
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            weight_groups: self.weight_groups,
            offset_groups: self.offset_groups,
        }
    }

    pub fn transform(&self) -> &OffsetTransform {
        &self.transform
    }

    pub fn gate(&self) -> Option<&ModulationGate> {
        self.gate.0.as_ref()
    }

    fn predict(&self, x: Tensor<B, 4>) -> DcnResult<Prediction<B>> {
        self.check_input(x.dims())?;

        let (raw_offset, raw_mask) = self.head.split(self.head.forward(x));
        let offset = self.transform.apply(raw_offset.clone())?;
        let mask = match (self.gate.0.as_ref(), &raw_mask) {
            (Some(gate), Some(raw_mask)) => Some(gate.apply(raw_mask.clone())),
            _ => None,
        };

        Ok(Prediction {
            raw_offset,
            raw_mask,
            fields: DeformFields { offset, mask },
        })
    }

    fn deform(&self, x: Tensor<B, 4>, fields: DeformFields<B>) -> DcnResult<Tensor<B, 4>> {
        let weight = self.weight.val();
        let bias = self.bias.as_ref().map(Param::val);
        if B::ad_enabled() {
            // Burn's operator records the step on the autodiff graph.
            return Ok(burn::tensor::module::deform_conv2d(
                x,
                fields.offset,
                weight,
                fields.mask,
                bias,
                self.options(),
            ));
        }

        let output = deform_conv2d(x, fields.offset, weight, fields.mask, bias, self.options())?;
        Ok(output)
    }

    fn check_input(&self, dims: [usize; 4]) -> DcnResult<()> {
        let [_, channels, height, width] = dims;
        if channels != self.in_channels {
            return Err(DeformConvError::ShapeMismatch {
                tensor: "input",
                expected: format!("{} channels", self.in_channels),
                actual: format!("{dims:?}"),
            }
            .into());
        }

        let [_, _, kernel_height, kernel_width] = self.weight.dims();
        let fits = |size, kernel, axis: usize| {
            conv_output_size(
                size,
                kernel,
                self.stride[axis],
                self.padding[axis],
                self.dilation[axis],
            )
            .is_some()
        };
        if !fits(height, kernel_height, 0) || !fits(width, kernel_width, 1) {
            return Err(DeformConvError::InvalidGeometry {
                reason: format!(
                    "input of {height}x{width} is smaller than the {kernel_height}x{kernel_width} kernel footprint"
                ),
            }
            .into());
        }
        Ok(())
    }
}

/// Backward of a bias-free 1x1 convolution: gradients w.r.t. its input and weight.
fn pointwise_backward<B: Backend>(
    weight: Tensor<B, 4>,
    input: Tensor<B, 4>,
    output_grad: Tensor<B, 4>,
) -> DcnResult<(Tensor<B, 4>, Tensor<B, 4>)> {
    let [batch, in_channels, height, width] = input.dims();
    let [out_channels, ..] = weight.dims();
    let expected = [batch, out_channels, height, width];
    if output_grad.dims() != expected {
        return Err(DeformConvError::ShapeMismatch {
            tensor: "output_grad",
            expected: format!("{expected:?}"),
            actual: format!("{:?}", output_grad.dims()),
        }
        .into());
    }

    let input_grad = conv2d(
        output_grad.clone(),
        weight.swap_dims(0, 1),
        None,
        ConvOptions::new([1, 1], [0, 0], [1, 1], 1),
    );

    let positions = batch * height * width;
    let weight_grad = output_grad
        .swap_dims(0, 1)
        .reshape([out_channels, positions])
        .matmul(
            input
                .swap_dims(0, 1)
                .reshape([in_channels, positions])
                .transpose(),
        )
        .reshape([out_channels, in_channels, 1, 1]);

    Ok((input_grad, weight_grad))
}
