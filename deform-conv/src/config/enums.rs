//! Enumeration types for deformable convolution configuration.

use burn::prelude::*;

/// How the raw head output becomes the offset field consumed by the sampler.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum OffsetPolicy {
    /// Offsets are used as predicted.
    Identity,
    /// Offsets are clamped to `[-offset_bound, offset_bound]`.
    Bounded,
    /// Offsets are rounded to the nearest integer, so sampling degenerates to
    /// nearest-neighbour lookup.
    Rounded,
    /// One scalar per deformable group and position stretches the anchor
    /// pattern: `offset = anchor * (s - anchor_center)`.
    AnchorScaled,
    /// As `AnchorScaled`, with the scalar first clamped to
    /// `[scale_lower_bound, offset_bound]`.
    AnchorScaledBoundedPositive,
}

impl OffsetPolicy {
    /// Whether the head predicts one scale per group instead of per-tap offsets.
    #[must_use]
    pub const fn is_anchor_based(&self) -> bool {
        matches!(self, Self::AnchorScaled | Self::AnchorScaledBoundedPositive)
    }

    /// Whether the policy clamps against `offset_bound`.
    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        matches!(self, Self::Bounded | Self::AnchorScaledBoundedPositive)
    }
}

/// Convolution used to predict the raw offset (and mask) tensor.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum OffsetHeadKind {
    /// One convolution with the layer's kernel and geometry.
    Full,
    /// A 1x1 convolution with the layer's stride.
    Pointwise,
    /// A depthwise convolution over the kernel footprint followed by a 1x1
    /// projection.
    Depthwise,
}

/// Arrangement of the deformable convolution itself.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ConvLayout {
    /// A single (optionally grouped) deformable convolution.
    Grouped,
    /// A depthwise deformable convolution followed by a bias-free 1x1
    /// channel-mixing convolution.
    DepthwiseSeparable,
}
