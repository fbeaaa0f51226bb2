//! # Layers
//!
//! - `deform_conv`: the [`DeformConv2d`] layer composing head, offset
//!   transform, modulation gate and the deformable convolution primitive.
//! - `modules`: the offset heads, offset transform, modulation gate and anchor
//!   pattern it is built from.

pub mod deform_conv;
pub mod modules;

pub use deform_conv::{DeformConv2d, DeformConv2dGrads, DeformConv2dRecord, DeformFields};
