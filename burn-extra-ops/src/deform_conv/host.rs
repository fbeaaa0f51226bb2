//! Host kernels on flat `f64` NCHW buffers.
//!
//! Each batch item goes through a deformable im2col producing columns of shape
//! `[Cin * kh * kw, H_out * W_out]` (sampled value times mask), followed by a
//! grouped product with the weight. The backward pass reverses both steps:
//! column gradients `W^T * dOut` are scattered to input pixels through the
//! bilinear corner weights and reduced into offset and mask gradients through
//! the positional derivatives of the sampler.
//!
//! Work is split so that every parallel task owns a disjoint slice of its
//! output buffer. Input gradients are split per input channel plane, since a
//! plane only receives scatters from its own channel's columns.

use rayon::prelude::*;

use super::shape::DeformConvShape;
use crate::bilinear::{bilinear_sample, BilinearSample};

/// Borrowed inputs of one deformable convolution call.
#[derive(Debug, Clone, Copy)]
pub struct HostInputs<'a> {
    /// `[N, Cin, H, W]`
    pub input: &'a [f64],
    /// `[N, 2 * dg * kh * kw, H_out, W_out]`
    pub offset: &'a [f64],
    /// `[N, dg * kh * kw, H_out, W_out]`, `None` for the unmodulated variant.
    pub mask: Option<&'a [f64]>,
    /// `[Cout, Cin / groups, kh, kw]`
    pub weight: &'a [f64],
}

/// Gradients w.r.t. every differentiable input, in the inputs' layouts.
#[derive(Debug, Clone, PartialEq)]
pub struct HostGradients {
    pub input: Vec<f64>,
    pub offset: Vec<f64>,
    /// Present when a mask was given.
    pub mask: Option<Vec<f64>>,
    pub weight: Vec<f64>,
    /// Present when the convolution has a bias.
    pub bias: Option<Vec<f64>>,
}

/// Per-batch strides of the input, offset and mask buffers.
struct BatchStrides {
    input: usize,
    offset: usize,
    mask: usize,
    output: usize,
}

impl BatchStrides {
    fn new(shape: &DeformConvShape) -> Self {
        let [_, out_channels, out_height, out_width] = shape.output_dims();
        Self {
            input: shape.in_channels * shape.in_plane(),
            offset: 2 * shape.offset_groups * shape.taps() * shape.out_plane(),
            mask: shape.offset_groups * shape.taps() * shape.out_plane(),
            output: out_channels * out_height * out_width,
        }
    }
}

/// The slices of `inputs` belonging to batch item `batch`.
fn batch_item<'a>(
    inputs: &HostInputs<'a>,
    strides: &BatchStrides,
    batch: usize,
) -> HostInputs<'a> {
    HostInputs {
        input: &inputs.input[batch * strides.input..(batch + 1) * strides.input],
        offset: &inputs.offset[batch * strides.offset..(batch + 1) * strides.offset],
        mask: inputs
            .mask
            .map(|mask| &mask[batch * strides.mask..(batch + 1) * strides.mask]),
        weight: inputs.weight,
    }
}

fn column_len(shape: &DeformConvShape) -> usize {
    shape.in_channels * shape.taps() * shape.out_plane()
}

fn modulation(
    shape: &DeformConvShape,
    mask: Option<&[f64]>,
    group: usize,
    tap: usize,
    position: usize,
) -> f64 {
    mask.map_or(1.0, |mask| mask[shape.mask_index(group, tap, position)])
}

/// Deformable im2col of one batch item into `columns`.
fn deform_im2col(shape: &DeformConvShape, item: &HostInputs<'_>, columns: &mut [f64]) {
    let taps = shape.taps();
    let out_plane = shape.out_plane();
    let in_plane = shape.in_plane();

    columns
        .par_chunks_mut(taps * out_plane)
        .enumerate()
        .for_each(|(channel, channel_columns)| {
            let plane = &item.input[channel * in_plane..(channel + 1) * in_plane];
            let group = shape.offset_group_of(channel);

            for (tap, row) in channel_columns.chunks_mut(out_plane).enumerate() {
                for (position, column) in row.iter_mut().enumerate() {
                    let (y, x) = shape.sample_location(item.offset, group, tap, position);
                    let sample = bilinear_sample(plane, shape.height, shape.width, y, x);
                    *column = modulation(shape, item.mask, group, tap, position) * sample;
                }
            }
        });
}

/// `output[co] = bias[co] + W[co] * columns[group(co)]` for one batch item.
fn columns_to_output(
    shape: &DeformConvShape,
    weight: &[f64],
    columns: &[f64],
    bias: Option<&[f64]>,
    output: &mut [f64],
) {
    let out_plane = shape.out_plane();
    let row = shape.weight_row();
    let out_per_group = shape.out_channels_per_group();

    output
        .par_chunks_mut(out_plane)
        .enumerate()
        .for_each(|(out_channel, plane)| {
            let group = out_channel / out_per_group;
            let weights = &weight[out_channel * row..(out_channel + 1) * row];
            let group_columns = &columns[group * row * out_plane..(group + 1) * row * out_plane];

            plane.fill(bias.map_or(0.0, |bias| bias[out_channel]));
            for (&w, column) in weights.iter().zip(group_columns.chunks(out_plane)) {
                for (value, &sampled) in plane.iter_mut().zip(column) {
                    *value += w * sampled;
                }
            }
        });
}

/// Deformable convolution forward pass.
///
/// Returns the `[N, Cout, H_out, W_out]` output. Buffer lengths must match
/// `shape`; the tensor entry points guarantee this.
pub fn forward_host(
    shape: &DeformConvShape,
    inputs: HostInputs<'_>,
    bias: Option<&[f64]>,
) -> Vec<f64> {
    let strides = BatchStrides::new(shape);
    let mut output = vec![0.0; shape.batch_size * strides.output];
    if output.is_empty() {
        return output;
    }

    let mut columns = vec![0.0; column_len(shape)];
    for (batch, batch_output) in output.chunks_mut(strides.output).enumerate() {
        let item = batch_item(&inputs, &strides, batch);
        deform_im2col(shape, &item, &mut columns);
        columns_to_output(shape, inputs.weight, &columns, bias, batch_output);
    }
    output
}

/// `grad_columns[ci, tap] = sum over co in group(ci) of W[co, ci_local, tap] * dOut[co]`.
fn output_grad_to_columns(
    shape: &DeformConvShape,
    weight: &[f64],
    output_grad: &[f64],
    grad_columns: &mut [f64],
) {
    let taps = shape.taps();
    let out_plane = shape.out_plane();
    let row = shape.weight_row();
    let in_per_group = shape.in_channels_per_group();
    let out_per_group = shape.out_channels_per_group();

    grad_columns
        .par_chunks_mut(out_plane)
        .enumerate()
        .for_each(|(column_row, grad)| {
            let (channel, tap) = (column_row / taps, column_row % taps);
            let (group, local) = (channel / in_per_group, channel % in_per_group);

            grad.fill(0.0);
            for out_channel in group * out_per_group..(group + 1) * out_per_group {
                let w = weight[out_channel * row + local * taps + tap];
                let out_grad = &output_grad[out_channel * out_plane..(out_channel + 1) * out_plane];
                for (g, &o) in grad.iter_mut().zip(out_grad) {
                    *g += w * o;
                }
            }
        });
}

/// Scatters column gradients of one batch item back to its input pixels.
fn columns_to_input_grad(
    shape: &DeformConvShape,
    item: &HostInputs<'_>,
    grad_columns: &[f64],
    grad_input: &mut [f64],
) {
    let taps = shape.taps();
    let out_plane = shape.out_plane();
    let in_plane = shape.in_plane();
    if in_plane == 0 {
        return;
    }

    grad_input
        .par_chunks_mut(in_plane)
        .enumerate()
        .for_each(|(channel, plane_grad)| {
            let plane = &item.input[channel * in_plane..(channel + 1) * in_plane];
            let group = shape.offset_group_of(channel);
            let channel_grads =
                &grad_columns[channel * taps * out_plane..(channel + 1) * taps * out_plane];

            for (tap, grads) in channel_grads.chunks(out_plane).enumerate() {
                for (position, &grad) in grads.iter().enumerate() {
                    let (y, x) = shape.sample_location(item.offset, group, tap, position);
                    let sample = BilinearSample::at(plane, shape.height, shape.width, y, x);
                    let scale = grad * modulation(shape, item.mask, group, tap, position);
                    sample.scatter(scale, plane_grad);
                }
            }
        });
}

/// Reduces column gradients of one batch item into offset and mask gradients.
fn columns_to_field_grads(
    shape: &DeformConvShape,
    item: &HostInputs<'_>,
    grad_columns: &[f64],
    grad_offset: &mut [f64],
    grad_mask: &mut [f64],
) {
    let taps = shape.taps();
    let out_plane = shape.out_plane();
    let in_plane = shape.in_plane();
    let per_group = shape.in_channels_per_offset_group();

    grad_offset
        .par_chunks_mut(2 * out_plane)
        .zip(grad_mask.par_chunks_mut(out_plane))
        .enumerate()
        .for_each(|(group_tap, (offset_grad, mask_grad))| {
            let (group, tap) = (group_tap / taps, group_tap % taps);
            let (grad_y, grad_x) = offset_grad.split_at_mut(out_plane);

            for position in 0..out_plane {
                let (y, x) = shape.sample_location(item.offset, group, tap, position);
                let weight = modulation(shape, item.mask, group, tap, position);
                let (mut dy, mut dx, mut dm) = (0.0, 0.0, 0.0);

                for channel in group * per_group..(group + 1) * per_group {
                    let grad = grad_columns[(channel * taps + tap) * out_plane + position];
                    let plane = &item.input[channel * in_plane..(channel + 1) * in_plane];
                    let sample = BilinearSample::at(plane, shape.height, shape.width, y, x);
                    dy += grad * weight * sample.grad_y;
                    dx += grad * weight * sample.grad_x;
                    dm += grad * sample.value;
                }

                grad_y[position] = dy;
                grad_x[position] = dx;
                mask_grad[position] = dm;
            }
        });
}

/// Adds `dOut[co] * columns[group(co)]^T` of one batch item to `grad_weight`.
fn accumulate_weight_grad(
    shape: &DeformConvShape,
    output_grad: &[f64],
    columns: &[f64],
    grad_weight: &mut [f64],
) {
    let out_plane = shape.out_plane();
    let row = shape.weight_row();
    let out_per_group = shape.out_channels_per_group();
    if row == 0 {
        return;
    }

    grad_weight
        .par_chunks_mut(row)
        .enumerate()
        .for_each(|(out_channel, grad_row)| {
            let group = out_channel / out_per_group;
            let out_grad = &output_grad[out_channel * out_plane..(out_channel + 1) * out_plane];
            let group_columns = &columns[group * row * out_plane..(group + 1) * row * out_plane];

            for (grad, column) in grad_row.iter_mut().zip(group_columns.chunks(out_plane)) {
                *grad += out_grad
                    .iter()
                    .zip(column)
                    .map(|(o, c)| o * c)
                    .sum::<f64>();
            }
        });
}

/// Deformable convolution backward pass.
///
/// `output_grad` is `dLoss/dOutput` in the `[N, Cout, H_out, W_out]` layout.
/// The mask gradient is returned only when `inputs.mask` is present, the bias
/// gradient only when `with_bias` is set.
pub fn backward_host(
    shape: &DeformConvShape,
    inputs: HostInputs<'_>,
    with_bias: bool,
    output_grad: &[f64],
) -> HostGradients {
    let strides = BatchStrides::new(shape);
    let out_plane = shape.out_plane();

    let mut grad_input = vec![0.0; shape.batch_size * strides.input];
    let mut grad_offset = vec![0.0; shape.batch_size * strides.offset];
    let mut grad_mask = vec![0.0; shape.batch_size * strides.mask];
    let mut grad_weight = vec![0.0; inputs.weight.len()];
    let mut grad_bias = vec![0.0; shape.out_channels];

    let mut columns = vec![0.0; column_len(shape)];
    let mut grad_columns = vec![0.0; column_len(shape)];

    for batch in 0..shape.batch_size {
        let item = batch_item(&inputs, &strides, batch);
        let out_grad = &output_grad[batch * strides.output..(batch + 1) * strides.output];

        output_grad_to_columns(shape, inputs.weight, out_grad, &mut grad_columns);
        columns_to_input_grad(
            shape,
            &item,
            &grad_columns,
            &mut grad_input[batch * strides.input..(batch + 1) * strides.input],
        );
        columns_to_field_grads(
            shape,
            &item,
            &grad_columns,
            &mut grad_offset[batch * strides.offset..(batch + 1) * strides.offset],
            &mut grad_mask[batch * strides.mask..(batch + 1) * strides.mask],
        );

        deform_im2col(shape, &item, &mut columns);
        accumulate_weight_grad(shape, out_grad, &columns, &mut grad_weight);

        for (out_channel, grad) in grad_bias.iter_mut().enumerate() {
            *grad += out_grad[out_channel * out_plane..(out_channel + 1) * out_plane]
                .iter()
                .sum::<f64>();
        }
    }

    HostGradients {
        input: grad_input,
        offset: grad_offset,
        mask: inputs.mask.map(|_| grad_mask),
        weight: grad_weight,
        bias: with_bias.then_some(grad_bias),
    }
}
