//! Core configuration for deformable convolution layers.

use burn::prelude::*;

use super::enums::{ConvLayout, OffsetHeadKind, OffsetPolicy};
use crate::error::{DcnError, DcnResult};

/// Configuration for [`DeformConv2d`](crate::DeformConv2d).
///
/// Geometry follows the usual convolution conventions; `groups` splits the
/// weight and `deformable_groups` splits the input channels into sets that
/// share one offset field.
#[derive(Config, Debug)]
pub struct DeformConv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    #[config(default = "[3, 3]")]
    pub kernel_size: [usize; 2],
    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],
    #[config(default = "[1, 1]")]
    pub padding: [usize; 2],
    #[config(default = "[1, 1]")]
    pub dilation: [usize; 2],
    /// Convolution groups.
    #[config(default = "1")]
    pub groups: usize,
    /// Deformable groups.
    #[config(default = "1")]
    pub deformable_groups: usize,
    /// Add a learnable bias to the deformable convolution.
    #[config(default = "false")]
    pub bias: bool,
    /// Predict a per-tap modulation mask (deformable convolution v2).
    #[config(default = "false")]
    pub modulated: bool,
    /// Bound `B` used by the bounded policies.
    #[config(default = "8.0")]
    pub offset_bound: f64,
    /// Scale `c` at which the anchor policies produce zero offsets.
    #[config(default = "1.0")]
    pub anchor_center: f64,
    /// Lower clamp for `AnchorScaledBoundedPositive`. `None` means `1 - offset_bound`.
    #[config(default = "None")]
    pub scale_lower_bound: Option<f64>,
    /// Multiplier applied after the modulation sigmoid.
    #[config(default = "1.0")]
    pub mask_scale: f64,
    #[config(default = "OffsetPolicy::Identity")]
    pub offset_policy: OffsetPolicy,
    #[config(default = "OffsetHeadKind::Full")]
    pub head: OffsetHeadKind,
    #[config(default = "ConvLayout::Grouped")]
    pub layout: ConvLayout,
}

impl DeformConv2dConfig {
    /// Number of kernel taps.
    #[must_use]
    pub const fn taps(&self) -> usize {
        self.kernel_size[0] * self.kernel_size[1]
    }

    /// Channels of the offset field fed to the sampler.
    #[must_use]
    pub const fn offset_field_channels(&self) -> usize {
        2 * self.deformable_groups * self.taps()
    }

    /// Offset (or scale) channels the head predicts.
    #[must_use]
    pub const fn head_offset_channels(&self) -> usize {
        if self.offset_policy.is_anchor_based() {
            self.deformable_groups
        } else {
            self.offset_field_channels()
        }
    }

    /// Mask channels the head predicts, zero when not modulated.
    #[must_use]
    pub const fn mask_channels(&self) -> usize {
        if self.modulated {
            self.deformable_groups * self.taps()
        } else {
            0
        }
    }

    /// Output channels of the deformable convolution before any channel mixing.
    #[must_use]
    pub const fn deform_out_channels(&self) -> usize {
        match self.layout {
            ConvLayout::Grouped => self.out_channels,
            ConvLayout::DepthwiseSeparable => self.in_channels,
        }
    }

    /// Weight groups of the deformable convolution.
    #[must_use]
    pub const fn weight_groups(&self) -> usize {
        match self.layout {
            ConvLayout::Grouped => self.groups,
            ConvLayout::DepthwiseSeparable => self.in_channels,
        }
    }

    /// Lower clamp of the scale in `AnchorScaledBoundedPositive`.
    #[must_use]
    pub fn resolved_scale_lower_bound(&self) -> f64 {
        self.scale_lower_bound.unwrap_or(1.0 - self.offset_bound)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err(DcnError::InvalidConfiguration)` for zero-sized geometry,
    /// channel counts that do not divide by the groups, non-finite or
    /// inconsistent bounds, and a pointwise head on a layer whose padding does
    /// not preserve the spatial size.
    pub fn validate(&self) -> DcnResult<()> {
        let invalid = |reason: String| Err(DcnError::InvalidConfiguration { reason });

        // 1. Sizes
        if self.in_channels == 0 || self.out_channels == 0 {
            return invalid(format!(
                "Channel counts must be non-zero, got in_channels={} and out_channels={}",
                self.in_channels, self.out_channels
            ));
        }
        if self.kernel_size.contains(&0)
            || self.stride.contains(&0)
            || self.dilation.contains(&0)
        {
            return invalid(format!(
                "Kernel size {:?}, stride {:?} and dilation {:?} must be non-zero",
                self.kernel_size, self.stride, self.dilation
            ));
        }

        // 2. Grouping
        if self.groups == 0 || self.deformable_groups == 0 {
            return invalid("Groups and deformable groups must be non-zero".to_string());
        }
        if self.layout == ConvLayout::DepthwiseSeparable && self.groups != 1 {
            return invalid(format!(
                "The depthwise-separable layout fixes the groups to in_channels, got groups={}",
                self.groups
            ));
        }
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return invalid(format!(
                "Channels ({} in, {} out) must be divisible by groups={}",
                self.in_channels, self.out_channels, self.groups
            ));
        }
        if self.in_channels % self.deformable_groups != 0 {
            return invalid(format!(
                "in_channels={} must be divisible by deformable_groups={}",
                self.in_channels, self.deformable_groups
            ));
        }

        // 3. Policy constants
        if self.offset_policy.is_bounded()
            && !(self.offset_bound.is_finite() && self.offset_bound > 0.0)
        {
            return invalid(format!(
                "offset_bound must be positive and finite, got {}",
                self.offset_bound
            ));
        }
        if self.offset_policy == OffsetPolicy::AnchorScaledBoundedPositive {
            let lower = self.resolved_scale_lower_bound();
            if !lower.is_finite() || lower > self.offset_bound {
                return invalid(format!(
                    "scale_lower_bound={lower} must be finite and at most offset_bound={}",
                    self.offset_bound
                ));
            }
        }
        if !self.anchor_center.is_finite() {
            return invalid(format!(
                "anchor_center must be finite, got {}",
                self.anchor_center
            ));
        }
        if self.modulated && !(self.mask_scale.is_finite() && self.mask_scale > 0.0) {
            return invalid(format!(
                "mask_scale must be positive and finite, got {}",
                self.mask_scale
            ));
        }

        // 4. A 1x1 head only lines up with the sampler when the layer keeps the size
        if self.head == OffsetHeadKind::Pointwise {
            for axis in 0..2 {
                if 2 * self.padding[axis] != self.dilation[axis] * (self.kernel_size[axis] - 1) {
                    return invalid(format!(
                        "Pointwise offset head requires size-preserving padding, got kernel {:?}, padding {:?}, dilation {:?}",
                        self.kernel_size, self.padding, self.dilation
                    ));
                }
            }
        }

        Ok(())
    }
}
