//! Convolutions predicting the raw offset (or scale) and mask tensor.
//!
//! Every head ends in a projecting convolution whose weights start at zero,
//! so a fresh head outputs its bias constants everywhere: `offset_bias` on
//! the offset channels and zero on the mask channels. The raw output keeps the
//! offset channels first and the mask channels last.

use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::TensorData,
};

use crate::{
    config::OffsetHeadKind,
    error::{DcnError, DcnResult},
};

#[derive(Config, Debug)]
pub struct OffsetHeadConfig {
    pub in_channels: usize,
    /// Offset or scale channels.
    pub offset_channels: usize,
    #[config(default = "0")]
    pub mask_channels: usize,
    #[config(default = "OffsetHeadKind::Full")]
    pub kind: OffsetHeadKind,
    #[config(default = "[3, 3]")]
    pub kernel_size: [usize; 2],
    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],
    #[config(default = "[1, 1]")]
    pub padding: [usize; 2],
    #[config(default = "[1, 1]")]
    pub dilation: [usize; 2],
    /// Initial value of the offset channels.
    #[config(default = "0.0")]
    pub offset_bias: f64,
}

impl OffsetHeadConfig {
    /// # Errors
    ///
    /// `ModelInitializationFailed` when there are no input or offset channels.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DcnResult<OffsetHead<B>> {
        if self.in_channels == 0 || self.offset_channels == 0 {
            return Err(DcnError::ModelInitializationFailed {
                reason: format!(
                    "Offset head needs input and offset channels, got in_channels={} and offset_channels={}",
                    self.in_channels, self.offset_channels
                ),
            });
        }
        let channels = self.offset_channels + self.mask_channels;
        let padding = PaddingConfig2d::Explicit(self.padding[0], self.padding[1]);

        let (depthwise, mut projection) = match self.kind {
            OffsetHeadKind::Full => {
                let projection = Conv2dConfig::new([self.in_channels, channels], self.kernel_size)
                    .with_stride(self.stride)
                    .with_padding(padding)
                    .with_dilation(self.dilation)
                    .init(device);
                (None, projection)
            }
            OffsetHeadKind::Pointwise => {
                let projection = Conv2dConfig::new([self.in_channels, channels], [1, 1])
                    .with_stride(self.stride)
                    .init(device);
                (None, projection)
            }
            OffsetHeadKind::Depthwise => {
                let depthwise =
                    Conv2dConfig::new([self.in_channels, self.in_channels], self.kernel_size)
                        .with_stride(self.stride)
                        .with_padding(padding)
                        .with_dilation(self.dilation)
                        .with_groups(self.in_channels)
                        .init(device);
                let projection =
                    Conv2dConfig::new([self.in_channels, channels], [1, 1]).init(device);
                (Some(depthwise), projection)
            }
        };

        let mut bias = vec![self.offset_bias; self.offset_channels];
        bias.resize(channels, 0.0);
        projection.weight = Param::from_tensor(projection.weight.val().zeros_like());
        projection.bias = Some(Param::from_tensor(Tensor::from_data(
            TensorData::new(bias, [channels]),
            device,
        )));

        Ok(OffsetHead {
            depthwise,
            projection,
            offset_channels: self.offset_channels,
            mask_channels: self.mask_channels,
        })
    }
}

#[derive(Module, Debug)]
pub struct OffsetHead<B: Backend> {
    /// Depthwise stage of the `Depthwise` head.
    pub depthwise: Option<Conv2d<B>>,
    /// Zero-initialized convolution producing the raw tensor.
    pub projection: Conv2d<B>,
    offset_channels: usize,
    mask_channels: usize,
}

impl<B: Backend> OffsetHead<B> {
    /// `[N, Cin, H, W]` to the raw `[N, offset_channels + mask_channels, H_out, W_out]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.depthwise {
            Some(depthwise) => depthwise.forward(x),
            None => x,
        };
        self.projection.forward(x)
    }

    /// Splits a raw head output into its offset and mask parts.
    pub fn split(&self, raw: Tensor<B, 4>) -> (Tensor<B, 4>, Option<Tensor<B, 4>>) {
        if self.mask_channels == 0 {
            return (raw, None);
        }
        let mask = raw
            .clone()
            .narrow(1, self.offset_channels, self.mask_channels);
        (raw.narrow(1, 0, self.offset_channels), Some(mask))
    }

    pub const fn offset_channels(&self) -> usize {
        self.offset_channels
    }

    pub const fn mask_channels(&self) -> usize {
        self.mask_channels
    }
}
