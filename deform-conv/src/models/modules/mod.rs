//! Building blocks of the deformable convolution layer.

pub mod anchor;
pub mod heads;
pub mod modulation;
pub mod offset_transform;

pub use anchor::AnchorPattern;
pub use heads::{OffsetHead, OffsetHeadConfig};
pub use modulation::ModulationGate;
pub use offset_transform::OffsetTransform;
