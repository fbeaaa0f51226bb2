//! Validated geometry of one deformable convolution call.

use burn::tensor::ops::DeformConvOptions;

use crate::error::{DeformConvError, DeformConvResult};

/// Sizes, strides and grouping of a deformable convolution, checked against
/// the input and weight shapes.
///
/// All index helpers assume the flat NCHW layouts described on each method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeformConvShape {
    pub batch_size: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub out_channels: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    /// Convolution groups.
    pub weight_groups: usize,
    /// Deformable groups.
    pub offset_groups: usize,
}

/// Standard convolution output size, `None` when the kernel does not fit.
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    let padded = input + 2 * padding;
    let extent = dilation * kernel.saturating_sub(1) + 1;
    (padded >= extent).then(|| (padded - extent) / stride + 1)
}

fn mismatch(
    tensor: &'static str,
    expected: impl Into<String>,
    actual: impl core::fmt::Debug,
) -> DeformConvError {
    DeformConvError::ShapeMismatch {
        tensor,
        expected: expected.into(),
        actual: format!("{actual:?}"),
    }
}

impl DeformConvShape {
    /// Validates `input` and `weight` dimensions against `options`.
    ///
    /// # Errors
    ///
    /// `InvalidGeometry` for zero stride, dilation, groups or kernel size and
    /// for an empty output; `ShapeMismatch` for channel counts that do not
    /// divide by the groups or disagree with the weight.
    pub fn new(
        input: [usize; 4],
        weight: [usize; 4],
        options: &DeformConvOptions<2>,
    ) -> DeformConvResult<Self> {
        let [batch_size, in_channels, height, width] = input;
        let [out_channels, weight_in_channels, kernel_height, kernel_width] = weight;
        let weight_groups = options.weight_groups;
        let offset_groups = options.offset_groups;

        if options.stride.contains(&0) || options.dilation.contains(&0) {
            return Err(DeformConvError::InvalidGeometry {
                reason: format!(
                    "stride {:?} and dilation {:?} must be non-zero",
                    options.stride, options.dilation
                ),
            });
        }
        if weight_groups == 0 || offset_groups == 0 {
            return Err(DeformConvError::InvalidGeometry {
                reason: format!(
                    "groups ({weight_groups}) and deformable groups ({offset_groups}) must be non-zero"
                ),
            });
        }
        if kernel_height == 0 || kernel_width == 0 {
            return Err(DeformConvError::InvalidGeometry {
                reason: format!("kernel size {kernel_height}x{kernel_width} is empty"),
            });
        }

        if in_channels % weight_groups != 0 {
            return Err(mismatch(
                "input",
                format!("channels divisible by groups ({weight_groups})"),
                input,
            ));
        }
        if out_channels % weight_groups != 0 {
            return Err(mismatch(
                "weight",
                format!("output channels divisible by groups ({weight_groups})"),
                weight,
            ));
        }
        if in_channels % offset_groups != 0 {
            return Err(mismatch(
                "input",
                format!("channels divisible by deformable groups ({offset_groups})"),
                input,
            ));
        }
        if weight_in_channels * weight_groups != in_channels {
            return Err(mismatch(
                "weight",
                format!(
                    "[_, {}, _, _] for {in_channels} input channels in {weight_groups} groups",
                    in_channels / weight_groups
                ),
                weight,
            ));
        }

        let out_height = conv_output_size(
            height,
            kernel_height,
            options.stride[0],
            options.padding[0],
            options.dilation[0],
        );
        let out_width = conv_output_size(
            width,
            kernel_width,
            options.stride[1],
            options.padding[1],
            options.dilation[1],
        );
        let (Some(out_height), Some(out_width)) = (out_height, out_width) else {
            return Err(DeformConvError::InvalidGeometry {
                reason: format!(
                    "kernel {kernel_height}x{kernel_width} with dilation {:?} does not fit input {height}x{width} padded by {:?}",
                    options.dilation, options.padding
                ),
            });
        };

        Ok(Self {
            batch_size,
            in_channels,
            height,
            width,
            out_channels,
            kernel_height,
            kernel_width,
            out_height,
            out_width,
            stride: options.stride,
            padding: options.padding,
            dilation: options.dilation,
            weight_groups,
            offset_groups,
        })
    }

    /// Number of kernel taps, `kh * kw`.
    pub const fn taps(&self) -> usize {
        self.kernel_height * self.kernel_width
    }

    /// `H_out * W_out`.
    pub const fn out_plane(&self) -> usize {
        self.out_height * self.out_width
    }

    /// `H * W`.
    pub const fn in_plane(&self) -> usize {
        self.height * self.width
    }

    pub const fn in_channels_per_group(&self) -> usize {
        self.in_channels / self.weight_groups
    }

    pub const fn out_channels_per_group(&self) -> usize {
        self.out_channels / self.weight_groups
    }

    pub const fn in_channels_per_offset_group(&self) -> usize {
        self.in_channels / self.offset_groups
    }

    /// Deformable group owning input channel `channel`.
    pub const fn offset_group_of(&self, channel: usize) -> usize {
        channel / self.in_channels_per_offset_group()
    }

    /// Length of one weight row, `Cin/groups * kh * kw`.
    pub const fn weight_row(&self) -> usize {
        self.in_channels_per_group() * self.taps()
    }

    pub const fn output_dims(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.out_channels,
            self.out_height,
            self.out_width,
        ]
    }

    pub const fn offset_dims(&self) -> [usize; 4] {
        [
            self.batch_size,
            2 * self.offset_groups * self.taps(),
            self.out_height,
            self.out_width,
        ]
    }

    pub const fn mask_dims(&self) -> [usize; 4] {
        [
            self.batch_size,
            self.offset_groups * self.taps(),
            self.out_height,
            self.out_width,
        ]
    }

    pub const fn input_dims(&self) -> [usize; 4] {
        [self.batch_size, self.in_channels, self.height, self.width]
    }

    pub const fn weight_dims(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels_per_group(),
            self.kernel_height,
            self.kernel_width,
        ]
    }

    /// Checks an offset field against `[N, 2*dg*kh*kw, H_out, W_out]`.
    pub fn check_offset(&self, dims: [usize; 4]) -> DeformConvResult<()> {
        let expected = self.offset_dims();
        if dims == expected {
            Ok(())
        } else {
            Err(mismatch("offset", format!("{expected:?}"), dims))
        }
    }

    /// Checks a mask field against `[N, dg*kh*kw, H_out, W_out]`.
    pub fn check_mask(&self, dims: [usize; 4]) -> DeformConvResult<()> {
        let expected = self.mask_dims();
        if dims == expected {
            Ok(())
        } else {
            Err(mismatch("mask", format!("{expected:?}"), dims))
        }
    }

    pub fn check_bias(&self, dims: [usize; 1]) -> DeformConvResult<()> {
        if dims == [self.out_channels] {
            Ok(())
        } else {
            Err(mismatch("bias", format!("[{}]", self.out_channels), dims))
        }
    }

    pub fn check_output_grad(&self, dims: [usize; 4]) -> DeformConvResult<()> {
        let expected = self.output_dims();
        if dims == expected {
            Ok(())
        } else {
            Err(mismatch("output_grad", format!("{expected:?}"), dims))
        }
    }

    /// Index of `(dy, dx)` component `axis` of tap `tap` in deformable group
    /// `group` at output position `position`, within one batch item's offsets.
    pub const fn offset_index(
        &self,
        group: usize,
        tap: usize,
        axis: usize,
        position: usize,
    ) -> usize {
        ((group * self.taps() + tap) * 2 + axis) * self.out_plane() + position
    }

    /// Index of a tap's mask value within one batch item's mask.
    pub const fn mask_index(&self, group: usize, tap: usize, position: usize) -> usize {
        (group * self.taps() + tap) * self.out_plane() + position
    }

    /// Undeformed sampling location of `tap` for output `position`.
    pub fn base_location(&self, tap: usize, position: usize) -> (f64, f64) {
        let (ki, kj) = (tap / self.kernel_width, tap % self.kernel_width);
        let (ho, wo) = (position / self.out_width, position % self.out_width);
        let y = (ho * self.stride[0] + ki * self.dilation[0]) as f64 - self.padding[0] as f64;
        let x = (wo * self.stride[1] + kj * self.dilation[1]) as f64 - self.padding[1] as f64;
        (y, x)
    }

    /// Deformed sampling location read from one batch item's offset field.
    pub fn sample_location(
        &self,
        offset: &[f64],
        group: usize,
        tap: usize,
        position: usize,
    ) -> (f64, f64) {
        let (y, x) = self.base_location(tap, position);
        (
            y + offset[self.offset_index(group, tap, 0, position)],
            x + offset[self.offset_index(group, tap, 1, position)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(groups: usize, offset_groups: usize) -> DeformConvOptions<2> {
        DeformConvOptions {
            stride: [1, 1],
            padding: [1, 1],
            dilation: [1, 1],
            weight_groups: groups,
            offset_groups,
        }
    }

    #[test]
    fn test_output_size_follows_convolution_formula() {
        assert_eq!(conv_output_size(5, 3, 1, 1, 1), Some(5));
        assert_eq!(conv_output_size(7, 3, 2, 0, 1), Some(3));
        assert_eq!(conv_output_size(7, 3, 1, 2, 2), Some(7));
        assert_eq!(conv_output_size(2, 5, 1, 0, 1), None);
    }

    #[test]
    fn test_valid_shape_reports_field_dims() {
        let shape = DeformConvShape::new([2, 4, 6, 5], [6, 2, 3, 3], &options(2, 2)).unwrap();

        assert_eq!(shape.output_dims(), [2, 6, 6, 5]);
        assert_eq!(shape.offset_dims(), [2, 36, 6, 5]);
        assert_eq!(shape.mask_dims(), [2, 18, 6, 5]);
        assert_eq!(shape.offset_group_of(3), 1);
        assert!(shape.check_offset([2, 36, 6, 5]).is_ok());
        assert!(shape.check_offset([2, 18, 6, 5]).is_err());
        assert!(shape.check_mask([2, 9, 6, 5]).is_err());
        assert!(shape.check_bias([5]).is_err());
    }

    #[test]
    fn test_indivisible_channels_are_shape_mismatches() {
        let err = DeformConvShape::new([1, 3, 4, 4], [4, 1, 3, 3], &options(2, 1)).unwrap_err();
        assert!(matches!(err, DeformConvError::ShapeMismatch { tensor: "input", .. }));

        let err = DeformConvShape::new([1, 4, 4, 4], [3, 2, 3, 3], &options(2, 1)).unwrap_err();
        assert!(matches!(err, DeformConvError::ShapeMismatch { tensor: "weight", .. }));

        let err = DeformConvShape::new([1, 4, 4, 4], [4, 4, 3, 3], &options(1, 3)).unwrap_err();
        assert!(matches!(err, DeformConvError::ShapeMismatch { tensor: "input", .. }));

        let err = DeformConvShape::new([1, 4, 4, 4], [4, 4, 3, 3], &options(2, 1)).unwrap_err();
        assert!(matches!(err, DeformConvError::ShapeMismatch { tensor: "weight", .. }));
    }

    #[test]
    fn test_degenerate_geometry_is_rejected() {
        let mut opts = options(1, 1);
        opts.stride = [0, 1];
        let err = DeformConvShape::new([1, 1, 4, 4], [1, 1, 3, 3], &opts).unwrap_err();
        assert!(matches!(err, DeformConvError::InvalidGeometry { .. }));

        let mut opts = options(1, 1);
        opts.padding = [0, 0];
        let err = DeformConvShape::new([1, 1, 2, 2], [1, 1, 3, 3], &opts).unwrap_err();
        assert!(matches!(err, DeformConvError::InvalidGeometry { .. }));
    }

    #[test]
    fn test_base_location_applies_stride_padding_and_dilation() {
        let opts = DeformConvOptions {
            stride: [2, 1],
            padding: [1, 2],
            dilation: [1, 2],
            weight_groups: 1,
            offset_groups: 1,
        };
        let shape = DeformConvShape::new([1, 1, 8, 8], [1, 1, 3, 3], &opts).unwrap();

        // tap (2, 1), output (1, 3)
        let position = shape.out_width + 3;
        assert_eq!(shape.base_location(7, position), (3.0, 3.0));
        assert_eq!(shape.base_location(0, 0), (-1.0, -2.0));
    }
}
