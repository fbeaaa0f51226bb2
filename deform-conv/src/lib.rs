//! Deformable convolution layers for the Burn deep learning framework.
//!
//! [`DeformConv2d`] predicts a per-position, per-tap offset field from its
//! input, optionally with a modulation mask, and samples the input along it.
//! How the raw prediction becomes offsets is chosen by [`OffsetPolicy`]:
//! used as-is, clamped, rounded to whole pixels, or a learned stretch of the
//! kernel's anchor pattern.

mod config;
mod error;
pub mod models;

pub use config::*;
pub use error::{DcnError, DcnResult};
pub use models::{DeformConv2d, DeformConv2dGrads, DeformConv2dRecord, DeformFields};
