//! Turns the raw offset (or scale) prediction into the offset field consumed by
//! the sampler, under one [`OffsetPolicy`].

use burn::prelude::*;
use burn_extra_ops::DeformConvError;

use super::anchor::AnchorPattern;
use crate::{
    config::OffsetPolicy,
    error::{DcnError, DcnResult},
};

/// An offset policy together with its constants.
///
/// Additive policies map `[N, 2*dg*kh*kw, H, W]` to the same shape. Anchor
/// policies map one scale per deformable group, `[N, dg, H, W]`, to
/// `anchor * (s - anchor_center)` laid out as `[N, 2*dg*kh*kw, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetTransform {
    policy: OffsetPolicy,
    anchor: AnchorPattern,
    deformable_groups: usize,
    offset_bound: f64,
    anchor_center: f64,
    scale_lower_bound: f64,
}

impl OffsetTransform {
    /// A transform with bound 8, anchor centre 1 and lower scale bound `1 - 8`.
    pub fn new(policy: OffsetPolicy, anchor: AnchorPattern, deformable_groups: usize) -> Self {
        Self {
            policy,
            anchor,
            deformable_groups,
            offset_bound: 8.0,
            anchor_center: 1.0,
            scale_lower_bound: -7.0,
        }
    }

    pub fn with_offset_bound(mut self, offset_bound: f64) -> Self {
        self.offset_bound = offset_bound;
        self
    }

    pub fn with_anchor_center(mut self, anchor_center: f64) -> Self {
        self.anchor_center = anchor_center;
        self
    }

    pub fn with_scale_lower_bound(mut self, scale_lower_bound: f64) -> Self {
        self.scale_lower_bound = scale_lower_bound;
        self
    }

    pub const fn policy(&self) -> &OffsetPolicy {
        &self.policy
    }

    /// Channels the raw prediction must have.
    pub fn raw_channels(&self) -> usize {
        if self.policy.is_anchor_based() {
            self.deformable_groups
        } else {
            self.field_channels()
        }
    }

    /// Channels of the produced offset field.
    pub fn field_channels(&self) -> usize {
        self.deformable_groups * self.anchor.len()
    }

    /// Applies the policy to `raw`.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when `raw` does not have [`Self::raw_channels`] channels.
    pub fn apply<B: Backend>(&self, raw: Tensor<B, 4>) -> DcnResult<Tensor<B, 4>> {
        check_channels("raw_offset", raw.dims(), self.raw_channels())?;
        let bound = self.offset_bound;

        let offset = match self.policy {
            OffsetPolicy::Identity => raw,
            OffsetPolicy::Bounded => raw.clamp(-bound, bound),
            OffsetPolicy::Rounded => raw.round(),
            OffsetPolicy::AnchorScaled => self.expand(raw.sub_scalar(self.anchor_center)),
            OffsetPolicy::AnchorScaledBoundedPositive => self.expand(
                raw.clamp(self.scale_lower_bound, bound)
                    .sub_scalar(self.anchor_center),
            ),
        };
        Ok(offset)
    }

    /// Maps the gradient w.r.t. the offset field back to the raw prediction.
    ///
    /// Clamps pass the gradient only strictly inside their interval and
    /// rounding passes none.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when `raw` or `offset_grad` have the wrong channels or
    /// disagree on batch and spatial size.
    pub fn backward<B: Backend>(
        &self,
        raw: Tensor<B, 4>,
        offset_grad: Tensor<B, 4>,
    ) -> DcnResult<Tensor<B, 4>> {
        let [batch, _, height, width] = raw.dims();
        check_channels("raw_offset", raw.dims(), self.raw_channels())?;
        if offset_grad.dims() != [batch, self.field_channels(), height, width] {
            return Err(DeformConvError::ShapeMismatch {
                tensor: "offset_grad",
                expected: format!("{:?}", [batch, self.field_channels(), height, width]),
                actual: format!("{:?}", offset_grad.dims()),
            }
            .into());
        }
        let bound = self.offset_bound;

        let raw_grad = match self.policy {
            OffsetPolicy::Identity => offset_grad,
            OffsetPolicy::Bounded => pass_interior(raw, offset_grad, -bound, bound),
            OffsetPolicy::Rounded => offset_grad.zeros_like(),
            OffsetPolicy::AnchorScaled => self.reduce(offset_grad),
            OffsetPolicy::AnchorScaledBoundedPositive => {
                pass_interior(raw, self.reduce(offset_grad), self.scale_lower_bound, bound)
            }
        };
        Ok(raw_grad)
    }

    /// `[N, dg, H, W]` scales to `[N, dg * 2*kh*kw, H, W]` offsets.
    fn expand<B: Backend>(&self, scale: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, groups, height, width] = scale.dims();
        let len = self.anchor.len();
        let anchor = self.anchor.to_tensor::<B>(&scale.device());

        scale
            .reshape([batch, groups, 1, height, width])
            .mul(anchor)
            .reshape([batch, groups * len, height, width])
    }

    /// Adjoint of [`Self::expand`].
    fn reduce<B: Backend>(&self, offset_grad: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = offset_grad.dims();
        let len = self.anchor.len();
        let groups = channels / len;
        let anchor = self.anchor.to_tensor::<B>(&offset_grad.device());

        offset_grad
            .reshape([batch, groups, len, height, width])
            .mul(anchor)
            .sum_dim(2)
            .reshape([batch, groups, height, width])
    }
}

/// Zeroes `grad` wherever `value` is outside the open interval `(low, high)`.
fn pass_interior<B: Backend>(
    value: Tensor<B, 4>,
    grad: Tensor<B, 4>,
    low: f64,
    high: f64,
) -> Tensor<B, 4> {
    grad.mask_fill(value.clone().lower_equal_elem(low), 0.0)
        .mask_fill(value.greater_equal_elem(high), 0.0)
}

fn check_channels(tensor: &'static str, dims: [usize; 4], channels: usize) -> DcnResult<()> {
    if dims[1] == channels {
        Ok(())
    } else {
        Err(DcnError::Operation(DeformConvError::ShapeMismatch {
            tensor,
            expected: format!("{channels} channels"),
            actual: format!("{dims:?}"),
        }))
    }
}
