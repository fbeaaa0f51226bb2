//! Configuration module for deformable convolution layers.
//!
//! - `core`: the layer configuration and its validation
//! - `enums`: offset policies, head kinds and layouts

pub mod core;
pub mod enums;

pub use core::DeformConv2dConfig;
pub use enums::{ConvLayout, OffsetHeadKind, OffsetPolicy};
