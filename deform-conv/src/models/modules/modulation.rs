use burn::{prelude::*, tensor::activation::sigmoid};

/// Per-tap modulation weights, `scale * sigmoid(raw)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationGate {
    scale: f64,
}

impl Default for ModulationGate {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl ModulationGate {
    pub const fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub const fn scale(&self) -> f64 {
        self.scale
    }

    pub fn apply<B: Backend, const D: usize>(&self, raw: Tensor<B, D>) -> Tensor<B, D> {
        sigmoid(raw).mul_scalar(self.scale)
    }

    /// Gradient w.r.t. `raw` given the gradient w.r.t. the mask.
    pub fn backward<B: Backend, const D: usize>(
        &self,
        raw: Tensor<B, D>,
        mask_grad: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let gate = sigmoid(raw);
        let slope = gate.clone() * gate.neg().add_scalar(1.0);
        mask_grad * slope.mul_scalar(self.scale)
    }
}
